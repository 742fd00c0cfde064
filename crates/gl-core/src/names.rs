//! Identifier types for target tables and sources.

use crate::newtype_string::define_newtype_string;

define_newtype_string! {
    /// A target table, usually schema-qualified (`fact.employees`).
    pub struct TableName;
}

define_newtype_string! {
    /// A source feed (file path or connector name) that produces batches.
    pub struct SourceName;
}

impl TableName {
    /// Build `<schema>.<table>`.
    pub fn qualified(schema: &str, table: &str) -> Self {
        Self(format!("{schema}.{table}"))
    }

    /// The unqualified table part.
    pub fn table_part(&self) -> &str {
        crate::sql_utils::split_qualified_name(&self.0).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rejects_empty() {
        assert!(TableName::try_new("").is_none());
        assert!(SourceName::parse("").is_err());
    }

    #[test]
    fn test_qualified() {
        let name = TableName::qualified("fact", "employees");
        assert_eq!(name, "fact.employees");
        assert_eq!(name.table_part(), "employees");
    }

    #[test]
    fn test_borrow_lookup() {
        let mut map: HashMap<SourceName, u64> = HashMap::new();
        map.insert(SourceName::parse("employees.csv").unwrap(), 41);
        assert_eq!(map.get("employees.csv"), Some(&41));
    }

    #[test]
    fn test_serde_transparent() {
        let name: TableName = serde_json::from_str(r#""fact.plans""#).unwrap();
        assert_eq!(serde_json::to_string(&name).unwrap(), r#""fact.plans""#);
        assert!(serde_json::from_str::<TableName>(r#""""#).is_err());
    }
}
