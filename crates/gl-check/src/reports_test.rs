use super::*;
use gl_db::DuckDbBackend;

const PROJECT: &str = r#"
name: benefits
tables:
  - name: plans
    source: plans.csv
    watermark_column: updated_at
    grain_key: [company_ein, plan_type, start_date]
    columns:
      - { name: company_ein }
      - { name: plan_type }
      - { name: carrier_name }
      - { name: start_date, type: date }
      - { name: end_date, type: date }
      - { name: updated_at, type: timestamp }
  - name: claims
    source: claims.csv
    watermark_column: updated_at
    grain_key: [claim_id]
    columns:
      - { name: claim_id }
      - { name: company_ein }
      - { name: service_date, type: date }
      - { name: amount, type: float }
      - { name: updated_at, type: timestamp }
  - name: employees
    source: employees.csv
    watermark_column: updated_at
    grain_key: [employee_id]
    columns:
      - { name: employee_id }
      - { name: company_ein }
      - { name: updated_at, type: timestamp }
reports:
  coverage_gaps:
    table: plans
    group_by: [company_ein, plan_type]
    start_column: start_date
    end_column: end_date
    carrier_column: carrier_name
  cost_spikes:
    table: claims
    group_by: [company_ein]
    date_column: service_date
    amount_column: amount
  roster_mismatch:
    table: employees
    group_column: company_ein
    expected:
      "11-1": 2
      "22-2": 10
"#;

const FACTS: &str = "
CREATE SCHEMA fact;
CREATE TABLE fact.plans (company_ein VARCHAR, plan_type VARCHAR, carrier_name VARCHAR,
                         start_date DATE, end_date DATE);
INSERT INTO fact.plans VALUES
    ('11-1', 'medical', 'Aetna', '2024-01-01', '2024-03-31'),
    ('11-1', 'medical', 'Cigna', '2024-05-01', '2024-12-31'),
    ('22-2', 'medical', 'Aetna', '2024-01-01', '2024-06-30'),
    ('22-2', 'medical', 'Aetna', '2024-03-01', '2024-09-30'),
    ('22-2', 'medical', 'Cigna', '2024-10-03', '2024-12-31');
CREATE TABLE fact.claims (claim_id VARCHAR, company_ein VARCHAR, service_date DATE, amount DOUBLE);
INSERT INTO fact.claims VALUES
    ('C1', '11-1', '2024-01-10', 100.0),
    ('C2', '11-1', '2024-04-20', 500.0),
    ('C3', '22-2', '2024-01-10', 100.0),
    ('C4', '22-2', '2024-04-20', 150.0);
CREATE TABLE fact.employees (employee_id VARCHAR, company_ein VARCHAR);
INSERT INTO fact.employees VALUES ('E1', '11-1'), ('E2', '11-1'), ('E3', '22-2');
";

async fn setup() -> (DuckDbBackend, Config) {
    let db = DuckDbBackend::in_memory().unwrap();
    db.execute_batch(FACTS).await.unwrap();
    (db, Config::from_yaml(PROJECT).unwrap())
}

#[test]
fn test_severity_bands() {
    assert_eq!(RosterSeverity::from_pct(0.0), RosterSeverity::Low);
    assert_eq!(RosterSeverity::from_pct(19.99), RosterSeverity::Low);
    assert_eq!(RosterSeverity::from_pct(20.0), RosterSeverity::Medium);
    assert_eq!(RosterSeverity::from_pct(49.9), RosterSeverity::Medium);
    assert_eq!(RosterSeverity::from_pct(50.0), RosterSeverity::High);
    assert_eq!(RosterSeverity::from_pct(100.0), RosterSeverity::High);
    assert_eq!(RosterSeverity::from_pct(100.5), RosterSeverity::Critical);
}

#[test]
fn test_severity_case_sql() {
    assert_eq!(
        RosterSeverity::case_sql("x"),
        "CASE WHEN x < 20 THEN 'Low' WHEN x < 50 THEN 'Medium' WHEN x <= 100 THEN 'High' ELSE 'Critical' END"
    );
}

#[test]
fn test_invalid_report_definitions() {
    let config = Config::from_yaml(PROJECT).unwrap();
    let mut gaps = config.reports.coverage_gaps.clone().unwrap();
    gaps.group_by.clear();
    assert!(matches!(
        coverage_gaps_sql(&gaps, "fact.plans"),
        Err(CheckError::InvalidReport { .. })
    ));

    let mut spikes = config.reports.cost_spikes.clone().unwrap();
    spikes.threshold = f64::NAN;
    assert!(matches!(
        cost_spikes_sql(&spikes, "fact.claims"),
        Err(CheckError::InvalidThreshold(_))
    ));

    let mut roster = config.reports.roster_mismatch.clone().unwrap();
    roster.expected.insert("33-3".into(), 0);
    assert!(roster_sql(&roster, "fact.employees").is_err());
}

#[tokio::test]
async fn test_coverage_gaps() {
    let (db, config) = setup().await;
    let sql = coverage_gaps_sql(config.reports.coverage_gaps.as_ref().unwrap(), "fact.plans").unwrap();
    let rows = db.query_sample_rows(&sql, 10).await.unwrap();
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert!(rows[0].starts_with("11-1, medical, 2024-04-01, 2024-04-30, 30, Aetna, Cigna"));
}

#[tokio::test]
async fn test_cost_spikes() {
    let (db, config) = setup().await;
    let sql = cost_spikes_sql(config.reports.cost_spikes.as_ref().unwrap(), "fact.claims").unwrap();
    let rows = db.query_sample_rows(&sql, 10).await.unwrap();
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert!(rows[0].starts_with("11-1"));
}

#[tokio::test]
async fn test_run_exports_every_report() {
    let (db, config) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    let outputs = ReportRunner::new(&db, &config).run(dir.path()).await.unwrap();

    let names: Vec<_> = outputs.iter().map(|o| o.name).collect();
    assert_eq!(names, vec!["coverage_gaps", "cost_spikes", "roster_mismatch"]);
    assert_eq!(outputs[2].rows, 2);

    let roster = std::fs::read_to_string(dir.path().join("roster_mismatch.csv")).unwrap();
    let lines: Vec<&str> = roster.lines().collect();
    assert_eq!(lines[0], "company_ein,expected,observed,pct_diff,severity");
    assert!(lines[1].starts_with("11-1,2,2,"));
    assert!(lines[1].ends_with(",Low"));
    assert!(lines[2].ends_with(",High"));
}
