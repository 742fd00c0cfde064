use super::*;
use gl_db::DuckDbBackend;

async fn db_with(sql: &str) -> DuckDbBackend {
    let db = DuckDbBackend::in_memory().unwrap();
    db.execute_batch(sql).await.unwrap();
    db
}

#[test]
fn test_unique_sql_composite_key() {
    let sql = generate_unique_sql("fact.plans", &["company_ein".into(), "plan_type".into()]);
    assert_eq!(
        sql,
        "SELECT \"company_ein\", \"plan_type\", COUNT(*) AS cnt\nFROM \"fact\".\"plans\"\nGROUP BY \"company_ein\", \"plan_type\"\nHAVING COUNT(*) > 1"
    );
}

#[test]
fn test_not_null_sql_any_column() {
    let sql = generate_not_null_sql("t", &["a".into(), "b".into()]);
    assert_eq!(sql, "SELECT * FROM \"t\" WHERE \"a\" IS NULL OR \"b\" IS NULL");
}

#[test]
fn test_relationship_sql_joins_every_column() {
    let sql = generate_relationship_sql("fact.employees", &["ein".into()], "fact.companies", &["company_ein".into()]);
    assert!(sql.contains("FROM \"fact\".\"employees\" AS src"));
    assert!(sql.contains("ref_tbl.\"company_ein\" = src.\"ein\""));
    assert!(sql.contains("src.\"ein\" IS NOT NULL"));
}

#[test]
fn test_audits_for_table() {
    let config = gl_core::Config::from_yaml(
        r#"
name: t
tables:
  - name: companies
    source: companies.csv
    watermark_column: updated_at
    grain_key: [ein]
    columns: [{ name: ein }, { name: updated_at }]
  - name: employees
    source: employees.csv
    watermark_column: updated_at
    grain_key: [employee_id]
    columns: [{ name: employee_id }, { name: ein }, { name: updated_at }]
    foreign_keys:
      - { columns: [ein], references: companies }
"#,
    )
    .unwrap();
    let employees = config.table("employees").unwrap();
    let audits = Audit::for_table(&config, employees, Layer::Fact);
    assert_eq!(audits.len(), 3);
    assert_eq!(audits[1].kind, AuditKind::Unique);
    assert_eq!(audits[1].table, "fact.employees");
    assert_eq!(
        audits[2].kind,
        AuditKind::Relationship {
            parent_table: "fact.companies".into(),
            parent_columns: vec!["ein".into()],
        }
    );
}

#[tokio::test]
async fn test_unique_audit_pass_and_fail() {
    let db = db_with(
        "CREATE TABLE ok_t (id INT); INSERT INTO ok_t VALUES (1), (2);
         CREATE TABLE bad_t (id INT); INSERT INTO bad_t VALUES (1), (1), (2);",
    )
    .await;
    let runner = AuditRunner::new(&db);

    let ok = runner
        .run_audit(&Audit::new("ok_t", vec!["id".into()], AuditKind::Unique))
        .await;
    assert!(ok.passed);

    let bad = runner
        .run_audit(&Audit::new("bad_t", vec!["id".into()], AuditKind::Unique))
        .await;
    assert!(!bad.passed);
    assert_eq!(bad.failure_count, 1);
    assert!(!bad.sample_failures.is_empty());
}

#[tokio::test]
async fn test_relationship_audit_finds_orphans() {
    let db = db_with(
        "CREATE TABLE parent (ein VARCHAR); INSERT INTO parent VALUES ('11-1');
         CREATE TABLE child (id INT, ein VARCHAR);
         INSERT INTO child VALUES (1, '11-1'), (2, '99-9'), (3, NULL);",
    )
    .await;
    let audit = Audit::new(
        "child",
        vec!["ein".into()],
        AuditKind::Relationship {
            parent_table: "parent".into(),
            parent_columns: vec!["ein".into()],
        },
    );
    let result = AuditRunner::new(&db).run_audit(&audit).await;
    assert_eq!(result.failure_count, 1);
}

#[tokio::test]
async fn test_missing_table_is_an_error_result() {
    let db = DuckDbBackend::in_memory().unwrap();
    let audits = vec![
        Audit::new("missing", vec!["id".into()], AuditKind::NotNull),
    ];
    let (results, summary) = AuditRunner::new(&db).run_all(&audits).await;
    assert!(results[0].error.is_some());
    assert_eq!(summary.errors, 1);
    assert!(!summary.all_passed());
}
