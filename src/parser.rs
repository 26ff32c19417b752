//! SQL parsing utilities for extracting operation type and table names.

use once_cell::sync::Lazy;
use regex::Regex;

/// SQL operation kinds this instrumentation distinguishes.
///
/// The traced surface is a query entry point, so transaction-control
/// statements are not modeled; anything unrecognized is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Other,
}

impl QueryOperation {
    /// Returns the operation as a string suitable for span attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOperation::Select => "SELECT",
            QueryOperation::Insert => "INSERT",
            QueryOperation::Update => "UPDATE",
            QueryOperation::Delete => "DELETE",
            QueryOperation::Create => "CREATE",
            QueryOperation::Drop => "DROP",
            QueryOperation::Alter => "ALTER",
            QueryOperation::Other => "QUERY",
        }
    }
}

impl std::fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Table-name patterns per operation, compiled once. The capture group is the
// bare table identifier, with optional backtick/quote/bracket delimiters.
static TABLE_PATTERNS: Lazy<Vec<(QueryOperation, Regex)>> = Lazy::new(|| {
    let pattern = |re: &str| Regex::new(re).unwrap();
    vec![
        (
            QueryOperation::Select,
            pattern(r#"(?i)\bFROM\s+[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Insert,
            pattern(r#"(?i)\bINSERT\s+INTO\s+[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Update,
            pattern(r#"(?i)\bUPDATE\s+[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Delete,
            pattern(r#"(?i)\bDELETE\s+FROM\s+[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Create,
            pattern(r#"(?i)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Drop,
            pattern(r#"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?[`"\[]?(\w+)[`"\]]?"#),
        ),
        (
            QueryOperation::Alter,
            pattern(r#"(?i)\bALTER\s+TABLE\s+[`"\[]?(\w+)[`"\]]?"#),
        ),
    ]
});

/// Parse the SQL operation kind from a query string.
pub fn parse_operation(sql: &str) -> QueryOperation {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => QueryOperation::Select,
        "INSERT" => QueryOperation::Insert,
        "UPDATE" => QueryOperation::Update,
        "DELETE" => QueryOperation::Delete,
        "CREATE" => QueryOperation::Create,
        "DROP" => QueryOperation::Drop,
        "ALTER" => QueryOperation::Alter,
        _ => QueryOperation::Other,
    }
}

/// Extract the primary table name from a SQL query.
///
/// Returns `None` if the table cannot be determined.
pub fn extract_table(sql: &str) -> Option<String> {
    let operation = parse_operation(sql);
    let regex = TABLE_PATTERNS
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, re)| re)?;

    regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Statement metadata attached to spans by the factory.
#[derive(Debug)]
pub struct QueryInfo {
    pub operation: QueryOperation,
    pub table: Option<String>,
}

impl QueryInfo {
    /// Parse a SQL statement and extract operation and table information.
    pub fn parse(sql: &str) -> Self {
        Self {
            operation: parse_operation(sql),
            table: extract_table(sql),
        }
    }
}
