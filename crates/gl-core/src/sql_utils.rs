//! SQL identifier quoting utilities
//!
//! Every statement Grainline builds from configured table and column names
//! goes through these helpers.

/// Quote a SQL identifier, doubling embedded double quotes.
///
/// # Examples
/// ```
/// use gl_core::sql_utils::quote_ident;
/// assert_eq!(quote_ident("employee_id"), r#""employee_id""#);
/// assert_eq!(quote_ident(r#"odd"name"#), r#""odd""name""#);
/// ```
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a schema-qualified name component by component.
///
/// # Examples
/// ```
/// use gl_core::sql_utils::quote_qualified;
/// assert_eq!(quote_qualified("fact.claims"), r#""fact"."claims""#);
/// ```
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Split `schema.table` on the last dot; unqualified names land in `main`.
///
/// # Examples
/// ```
/// use gl_core::sql_utils::split_qualified_name;
/// assert_eq!(split_qualified_name("claims"), ("main", "claims"));
/// assert_eq!(split_qualified_name("fact.claims"), ("fact", "claims"));
/// ```
pub fn split_qualified_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) => (&name[..pos], &name[pos + 1..]),
        None => ("main", name),
    }
}

/// Escape a value for use inside a single-quoted SQL literal.
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Comma-separated quoted column list.
pub fn quote_column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `?, ?, ?` for `n` bound parameters.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_keeps_dots() {
        assert_eq!(quote_ident("fact.claims"), r#""fact.claims""#);
    }

    #[test]
    fn test_quote_qualified_escapes_each_part() {
        assert_eq!(quote_qualified(r#"a"b.c"#), r#""a""b"."c""#);
    }

    #[test]
    fn test_escape_sql_string() {
        assert_eq!(escape_sql_string("O'Brien"), "O''Brien");
    }

    #[test]
    fn test_column_list_and_placeholders() {
        assert_eq!(quote_column_list(&["a", "b"]), r#""a", "b""#);
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(0), "");
    }
}
