use super::*;
use gl_core::{BatchMeta, ColumnType, Config};
use tempfile::TempDir;

const PROJECT: &str = r#"
name: staging
tables:
  - name: employees
    source: data/employees.csv
    watermark_column: updated_at
    grain_key: [employee_id]
    columns:
      - { name: employee_id, type: text }
      - { name: email, type: text }
      - { name: region, type: text }
      - { name: carrier, type: text }
      - { name: salary, type: integer }
      - { name: hire_date, type: date }
      - { name: updated_at, type: timestamp }
    rules:
      - { column: email, pattern: '^[^@\s]+@[^@\s]+$', message: invalid email }
    fill_forward:
      - { column: carrier, partition_by: [region] }
"#;

const HEADERS: [&str; 7] = [
    "employee_id",
    "email",
    "region",
    "carrier",
    "salary",
    "hire_date",
    "updated_at",
];

fn stager() -> Stager {
    let config = Config::from_yaml(PROJECT).unwrap();
    Stager::for_table(config.table("employees").unwrap()).unwrap()
}

fn raw(rows: &[[&str; 7]]) -> RecordBatch {
    let schema = Arc::new(BatchSchema::text(&HEADERS).unwrap());
    let meta = BatchMeta::new("data/employees.csv", 1, Layer::Raw);
    let rows = rows
        .iter()
        .enumerate()
        .map(|(i, cells)| {
            Row::new(
                cells.iter().map(|c| Value::Text(c.to_string())).collect(),
                meta.provenance(Some(i as u64 + 1)),
            )
        })
        .collect();
    RecordBatch::new(meta, schema, rows).unwrap()
}

fn cell<'a>(batch: &'a RecordBatch, row: usize, column: &str) -> &'a Value {
    batch.row(row).unwrap().get(column).unwrap()
}

#[test]
fn test_coerces_declared_types() {
    let staged = stager()
        .stage(&raw(&[[
            " E1 ",
            "a@acme.com",
            "west",
            "Aetna",
            "1,200",
            "2024-01-15",
            "2024-02-01 08:00:00",
        ]]))
        .unwrap();
    assert!(staged.issues.is_empty());
    let batch = &staged.batch;
    assert_eq!(batch.layer(), Layer::Staging);
    assert_eq!(cell(batch, 0, "employee_id"), &Value::Text("E1".into()));
    assert_eq!(cell(batch, 0, "salary"), &Value::Int(1200));
    assert_eq!(
        cell(batch, 0, "hire_date"),
        &ColumnType::Date.coerce("2024-01-15").unwrap()
    );
    assert_eq!(batch.rows()[0].provenance().source_line, Some(1));
}

#[test]
fn test_coercion_failure_rejects_row() {
    let staged = stager()
        .stage(&raw(&[
            ["E1", "a@acme.com", "west", "Aetna", "100", "2024-01-15", "2024-02-01 08:00:00"],
            ["E2", "b@acme.com", "west", "Aetna", "lots", "someday", "2024-02-01 08:00:00"],
        ]))
        .unwrap();
    assert_eq!(staged.batch.len(), 1);
    assert_eq!(staged.rejected_rows(), 1);
    let columns: Vec<&str> = staged.issues.iter().map(|i| i.column.as_str()).collect();
    assert_eq!(columns, vec!["salary", "hire_date"]);
    assert!(staged.issues.iter().all(|i| i.rejected && i.source_line == Some(2)));
    assert!(staged.issues[0].reason.contains("E008"));
}

#[test]
fn test_pattern_mismatch_tags_row() {
    let staged = stager()
        .stage(&raw(&[
            ["E1", "not-an-email", "west", "Aetna", "100", "2024-01-15", "2024-02-01 08:00:00"],
            ["E2", "", "west", "Aetna", "100", "2024-01-15", "2024-02-01 08:00:00"],
        ]))
        .unwrap();
    assert_eq!(staged.batch.len(), 2);
    assert_eq!(staged.tagged_rows(), 1);
    assert_eq!(staged.rejected_rows(), 0);
    assert_eq!(staged.issues[0].reason, "invalid email");
    assert_eq!(staged.issues[0].value, "not-an-email");
}

#[test]
fn test_fill_forward_within_group() {
    let staged = stager()
        .stage(&raw(&[
            ["E1", "a@x.com", "west", "", "1", "2024-01-01", "2024-02-01 08:00:00"],
            ["E2", "b@x.com", "east", "Cigna", "1", "2024-01-01", "2024-02-01 08:00:00"],
            ["E3", "c@x.com", "west", "Aetna", "1", "2024-01-01", "2024-02-01 08:00:00"],
            ["E4", "d@x.com", "west", "", "1", "2024-01-01", "2024-02-01 08:00:00"],
            ["E5", "e@x.com", "north", "", "1", "2024-01-01", "2024-02-01 08:00:00"],
        ]))
        .unwrap();
    let carriers: Vec<Value> = staged.batch.column("carrier").unwrap().cloned().collect();
    assert_eq!(
        carriers,
        vec![
            Value::Text("Aetna".into()),
            Value::Text("Cigna".into()),
            Value::Text("Aetna".into()),
            Value::Text("Aetna".into()),
            Value::Null,
        ]
    );
}

#[test]
fn test_missing_declared_column() {
    let schema = Arc::new(BatchSchema::text(&["employee_id"]).unwrap());
    let meta = BatchMeta::new("data/employees.csv", 1, Layer::Raw);
    let batch = RecordBatch::new(meta, schema, vec![]).unwrap();
    assert!(matches!(
        stager().stage(&batch),
        Err(PipelineError::Core(_))
    ));
}

#[test]
fn test_write_validation_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("target").join("validation_errors.csv");
    let staged = stager()
        .stage(&raw(&[
            ["E1", "bad", "west", "Aetna", "1", "2024-01-01", "2024-02-01 08:00:00"],
            ["E2", "b@x.com", "west", "Aetna", "x", "2024-01-01", "2024-02-01 08:00:00"],
        ]))
        .unwrap();
    write_validation_errors(&path, &staged.issues).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "table,source_line,column,value,reason,action");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("employees,1,email,bad,invalid email,tagged"));
    assert!(lines[2].starts_with("employees,2,salary,x,"));
    assert!(lines[2].ends_with(",rejected"));
}
