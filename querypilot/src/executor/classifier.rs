//! Error taxonomy and provider-message classification
//!
//! Classification works on the provider's free-text error message only. All
//! wording-specific knowledge lives in [`ErrorPatterns`], so retargeting to a
//! different database means supplying a different pattern table.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{FeedbackConfig, SqlDialect};
use crate::schema::SchemaContext;
use crate::similarity::close_matches;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    ConnectionError,
    PermissionDenied,
    ColumnNotFound,
    TableNotFound,
    AggregationError,
    JoinError,
    TypeMismatch,
    SyntaxError,
    Unknown,
}

/// Coarse grouping of categories by what can fix them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Schema,
    Sql,
    System,
    Unknown,
}

impl ErrorCategory {
    /// Classification order; the first matching category wins.
    pub const PRIORITY: [ErrorCategory; 10] = [
        ErrorCategory::Timeout,
        ErrorCategory::ConnectionError,
        ErrorCategory::PermissionDenied,
        ErrorCategory::ColumnNotFound,
        ErrorCategory::TableNotFound,
        ErrorCategory::AggregationError,
        ErrorCategory::JoinError,
        ErrorCategory::TypeMismatch,
        ErrorCategory::SyntaxError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ConnectionError => "connection_error",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::ColumnNotFound => "column_not_found",
            ErrorCategory::TableNotFound => "table_not_found",
            ErrorCategory::AggregationError => "aggregation_error",
            ErrorCategory::JoinError => "join_error",
            ErrorCategory::TypeMismatch => "type_mismatch",
            ErrorCategory::SyntaxError => "syntax_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCategory::ColumnNotFound | ErrorCategory::TableNotFound => ErrorClass::Schema,
            ErrorCategory::SyntaxError
            | ErrorCategory::TypeMismatch
            | ErrorCategory::JoinError
            | ErrorCategory::AggregationError => ErrorClass::Sql,
            ErrorCategory::Timeout
            | ErrorCategory::PermissionDenied
            | ErrorCategory::ConnectionError => ErrorClass::System,
            ErrorCategory::Unknown => ErrorClass::Unknown,
        }
    }

    /// Permission and connection failures are deployment problems the
    /// retry loop cannot fix. Everything else, timeouts included, is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::PermissionDenied | ErrorCategory::ConnectionError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(&'static str),
    Pattern(Regex),
}

impl Matcher {
    fn is_match(&self, lowered: &str) -> bool {
        match self {
            Matcher::Literal(needle) => lowered.contains(needle),
            Matcher::Pattern(re) => re.is_match(lowered),
        }
    }
}

/// Provider-specific wording: which messages map to which category, and
/// how to pull the offending identifier out of a message.
#[derive(Debug, Clone)]
pub struct ErrorPatterns {
    rules: IndexMap<ErrorCategory, Vec<Matcher>>,
    column_detail: Vec<Regex>,
    table_detail: Vec<Regex>,
    near_detail: Vec<Regex>,
}

fn lit(needle: &'static str) -> Matcher {
    Matcher::Literal(needle)
}

fn re(pattern: &str) -> Matcher {
    Matcher::Pattern(Regex::new(pattern).unwrap())
}

fn ci(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){}", pattern)).unwrap()
}

static POSTGRES_PATTERNS: Lazy<ErrorPatterns> = Lazy::new(|| {
    let mut rules = IndexMap::new();
    rules.insert(
        ErrorCategory::Timeout,
        vec![
            lit("canceling statement due to statement timeout"),
            lit("query_timeout"),
            lit("execution timeout"),
            lit("statement timeout"),
        ],
    );
    rules.insert(
        ErrorCategory::ConnectionError,
        vec![
            lit("could not connect to server"),
            lit("connection refused"),
            lit("connection reset"),
            lit("connection timed out"),
            lit("server closed the connection"),
        ],
    );
    rules.insert(
        ErrorCategory::PermissionDenied,
        vec![lit("permission denied"), lit("must be owner of"), lit("access denied")],
    );
    rules.insert(
        ErrorCategory::ColumnNotFound,
        vec![re(r"column .* does not exist")],
    );
    rules.insert(
        ErrorCategory::TableNotFound,
        vec![re(r"relation .* does not exist"), re(r"table .* does not exist")],
    );
    rules.insert(
        ErrorCategory::AggregationError,
        vec![
            lit("must appear in the group by clause"),
            lit("aggregate functions are not allowed"),
            re(r"column .* must appear in the group by"),
        ],
    );
    rules.insert(
        ErrorCategory::JoinError,
        vec![
            re(r"column reference .* is ambiguous"),
            lit("missing from-clause entry"),
            lit("ambiguous column"),
        ],
    );
    rules.insert(
        ErrorCategory::TypeMismatch,
        vec![
            lit("cannot cast type"),
            lit("invalid input syntax for type"),
            lit("operator does not exist"),
            lit("type mismatch"),
        ],
    );
    rules.insert(
        ErrorCategory::SyntaxError,
        vec![lit("syntax error at or near"), lit("syntax error"), lit("invalid syntax")],
    );

    ErrorPatterns {
        rules,
        column_detail: vec![ci(r#"column "?(?:\w+\.)?(\w+)"? does not exist"#)],
        table_detail: vec![ci(r#"(?:relation|table) "?(?:\w+\.)?(\w+)"? does not exist"#)],
        near_detail: vec![ci(r#"at or near "?(\w+)"?"#)],
    }
});

static SQLITE_PATTERNS: Lazy<ErrorPatterns> = Lazy::new(|| {
    let mut rules = IndexMap::new();
    rules.insert(
        ErrorCategory::Timeout,
        vec![lit("interrupted"), lit("statement timeout")],
    );
    rules.insert(
        ErrorCategory::ConnectionError,
        vec![lit("unable to open database file"), lit("database is locked")],
    );
    rules.insert(
        ErrorCategory::PermissionDenied,
        vec![lit("attempt to write a readonly database"), lit("not authorized")],
    );
    rules.insert(ErrorCategory::ColumnNotFound, vec![lit("no such column")]);
    rules.insert(ErrorCategory::TableNotFound, vec![lit("no such table")]);
    rules.insert(ErrorCategory::AggregationError, vec![lit("misuse of aggregate")]);
    rules.insert(ErrorCategory::JoinError, vec![lit("ambiguous column name")]);
    rules.insert(ErrorCategory::TypeMismatch, vec![lit("datatype mismatch")]);
    rules.insert(
        ErrorCategory::SyntaxError,
        vec![re(r#"near ".*": syntax error"#), lit("syntax error"), lit("incomplete input")],
    );

    ErrorPatterns {
        rules,
        column_detail: vec![ci(r"no such column: (?:\w+\.)?(\w+)")],
        table_detail: vec![ci(r"no such table: (?:\w+\.)?(\w+)")],
        near_detail: vec![ci(r#"near "(\w+)""#)],
    }
});

impl ErrorPatterns {
    /// PostgreSQL server wording
    pub fn postgres() -> Self {
        POSTGRES_PATTERNS.clone()
    }

    /// SQLite library wording
    pub fn sqlite() -> Self {
        SQLITE_PATTERNS.clone()
    }

    pub fn for_dialect(dialect: SqlDialect) -> Self {
        match dialect {
            SqlDialect::Postgres => Self::postgres(),
            SqlDialect::Sqlite => Self::sqlite(),
        }
    }

    fn matches(&self, category: ErrorCategory, lowered: &str) -> bool {
        self.rules
            .get(&category)
            .map(|matchers| matchers.iter().any(|m| m.is_match(lowered)))
            .unwrap_or(false)
    }
}

fn first_capture(patterns: &[Regex], message: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

/// Identifiers pulled from an error message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    pub full_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_near: Option<String>,
}

/// Classifies provider errors and turns them into remediation text.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: ErrorPatterns,
    feedback: FeedbackConfig,
    timeout_seconds: u64,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ErrorPatterns::postgres(), FeedbackConfig::default(), 30)
    }
}

impl ErrorClassifier {
    pub fn new(patterns: ErrorPatterns, feedback: FeedbackConfig, timeout_seconds: u64) -> Self {
        Self {
            patterns,
            feedback,
            timeout_seconds,
        }
    }

    /// Category of `message`, honouring [`ErrorCategory::PRIORITY`].
    pub fn classify(&self, message: &str) -> ErrorCategory {
        let lowered = message.to_lowercase();
        ErrorCategory::PRIORITY
            .iter()
            .copied()
            .find(|category| self.patterns.matches(*category, &lowered))
            .unwrap_or(ErrorCategory::Unknown)
    }

    pub fn extract_details(&self, message: &str, category: ErrorCategory) -> ErrorDetails {
        let mut details = ErrorDetails {
            full_error: message.to_string(),
            ..Default::default()
        };
        match category {
            ErrorCategory::ColumnNotFound => {
                details.missing_column = first_capture(&self.patterns.column_detail, message);
            }
            ErrorCategory::TableNotFound => {
                details.missing_table = first_capture(&self.patterns.table_detail, message);
            }
            ErrorCategory::SyntaxError => {
                details.error_near = first_capture(&self.patterns.near_detail, message);
            }
            _ => {}
        }
        details
    }

    /// Remediation text for the generator; schema-aware for missing
    /// columns and tables.
    pub fn generate_feedback(
        &self,
        category: ErrorCategory,
        details: &ErrorDetails,
        schema: &SchemaContext,
    ) -> String {
        match category {
            ErrorCategory::ColumnNotFound => self.column_feedback(details, schema),
            ErrorCategory::TableNotFound => self.table_feedback(details, schema),
            ErrorCategory::SyntaxError => format!(
                "SQL syntax error near '{}'. \
                 Check for typos in SQL keywords (SELECT, FROM, WHERE, JOIN, etc.).",
                details.error_near.as_deref().unwrap_or("unknown")
            ),
            ErrorCategory::TypeMismatch => concat!(
                "Type mismatch error. Check that column data types match comparison values. ",
                "Use explicit casting if needed (e.g., price::numeric > 100)."
            )
            .to_string(),
            ErrorCategory::JoinError => concat!(
                "JOIN error - column reference is ambiguous. ",
                "Use table aliases (e.g., p.product_id, o.order_id) ",
                "to clarify which table's column."
            )
            .to_string(),
            ErrorCategory::AggregationError => "Aggregation error - missing GROUP BY clause. \
                 When using COUNT/SUM/AVG, non-aggregated columns must be in GROUP BY."
                .to_string(),
            ErrorCategory::Timeout => format!(
                "Query execution timeout (exceeded {} seconds). \
                 Query is too complex or slow. Try simplifying, adding indexes, or using LIMIT.",
                self.timeout_seconds
            ),
            ErrorCategory::PermissionDenied => "Permission denied. \
                 Database user lacks permission to access this table or perform this operation."
                .to_string(),
            ErrorCategory::ConnectionError => "Database connection error. \
                 Check that the database is running and connection settings are correct."
                .to_string(),
            ErrorCategory::Unknown => format!("Unknown error occurred: {}", details.full_error),
        }
    }

    fn column_feedback(&self, details: &ErrorDetails, schema: &SchemaContext) -> String {
        let missing = details.missing_column.as_deref().unwrap_or("unknown");
        if schema.is_empty() {
            return format!(
                "Column '{}' does not exist. Check schema for valid column names.",
                missing
            );
        }

        // Which table does the message refer to: one named in it, or the only one
        let lowered = details.full_error.to_lowercase();
        let target = schema
            .tables()
            .find(|(name, _)| lowered.contains(&name.to_lowercase()))
            .or_else(|| {
                if schema.len() == 1 {
                    schema.tables().next()
                } else {
                    None
                }
            });

        if let Some((table_name, table)) = target {
            let columns = table.column_names();
            let suggestions = close_matches(
                missing,
                columns.iter().copied(),
                self.feedback.max_suggestions,
                self.feedback.suggestion_cutoff,
            );
            let mut text = format!(
                "Column '{}' does not exist in table '{}'. Available columns in {}: {}.",
                missing,
                table_name,
                table_name,
                columns.join(", ")
            );
            if !suggestions.is_empty() {
                text.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
            }
            return text;
        }

        // Search every table, remembering where each column lives
        let mut owners: IndexMap<String, Vec<&str>> = IndexMap::new();
        for (name, table) in schema.tables() {
            for column in table.columns.keys() {
                owners.entry(column.to_lowercase()).or_default().push(name);
            }
        }
        let suggestions = close_matches(
            &missing.to_lowercase(),
            owners.keys().map(String::as_str),
            self.feedback.max_suggestions,
            self.feedback.suggestion_cutoff,
        );
        if !suggestions.is_empty() {
            let described: Vec<String> = suggestions
                .iter()
                .map(|s| {
                    let tables = owners.get(s).map(|t| t.join(", ")).unwrap_or_default();
                    format!("{} (in {})", s, tables)
                })
                .collect();
            return format!(
                "Column '{}' does not exist. Did you mean: {}?",
                missing,
                described.join(", ")
            );
        }

        let samples: Vec<String> = schema
            .tables()
            .take(3)
            .map(|(name, table)| {
                let cols: Vec<&str> = table.column_names().into_iter().take(3).collect();
                format!("{} ({}...)", name, cols.join(", "))
            })
            .collect();
        format!(
            "Column '{}' does not exist. Available tables: {}",
            missing,
            samples.join(", ")
        )
    }

    fn table_feedback(&self, details: &ErrorDetails, schema: &SchemaContext) -> String {
        let missing = details.missing_table.as_deref().unwrap_or("unknown");
        if schema.is_empty() {
            return format!(
                "Table '{}' does not exist. Check schema for valid table names.",
                missing
            );
        }

        let available: Vec<&str> = schema.table_names().collect();
        let suggestions = close_matches(
            missing,
            available.iter().copied(),
            self.feedback.max_suggestions,
            self.feedback.suggestion_cutoff,
        );
        let mut text = format!(
            "Table '{}' does not exist. Available tables: {}.",
            missing,
            available.join(", ")
        );
        if !suggestions.is_empty() {
            text.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;
    use pretty_assertions::assert_eq;

    fn shop() -> SchemaContext {
        SchemaContext::from_tables([
            (
                "products",
                TableSchema::new([
                    ("product_id", "INTEGER"),
                    ("name", "VARCHAR"),
                    ("price", "DECIMAL"),
                ]),
            ),
            (
                "orders",
                TableSchema::new([
                    ("order_id", "INTEGER"),
                    ("customer_id", "INTEGER"),
                    ("total", "DECIMAL"),
                ]),
            ),
        ])
    }

    #[test]
    fn classifies_postgres_messages() {
        let classifier = ErrorClassifier::default();
        let cases = [
            ("ERROR: canceling statement due to statement timeout", ErrorCategory::Timeout),
            ("could not connect to server: Connection refused", ErrorCategory::ConnectionError),
            ("permission denied for table salaries", ErrorCategory::PermissionDenied),
            (r#"column "id" does not exist"#, ErrorCategory::ColumnNotFound),
            (r#"relation "invoices" does not exist"#, ErrorCategory::TableNotFound),
            (
                r#"column "p.name" must appear in the GROUP BY clause or be used in an aggregate function"#,
                ErrorCategory::AggregationError,
            ),
            (r#"column reference "id" is ambiguous"#, ErrorCategory::JoinError),
            ("operator does not exist: text > integer", ErrorCategory::TypeMismatch),
            (r#"syntax error at or near "FRM""#, ErrorCategory::SyntaxError),
            ("something odd happened", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classifier.classify(message), expected, "message: {}", message);
        }
    }

    #[test]
    fn priority_beats_syntax() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify(r#"syntax error: column "foo" does not exist"#),
            ErrorCategory::ColumnNotFound
        );
        assert_eq!(
            classifier.classify(r#"syntax error at or near "x"; relation "foo" does not exist"#),
            ErrorCategory::TableNotFound
        );
    }

    #[test]
    fn classifies_sqlite_messages() {
        let classifier =
            ErrorClassifier::new(ErrorPatterns::sqlite(), FeedbackConfig::default(), 5);
        assert_eq!(classifier.classify("no such column: id"), ErrorCategory::ColumnNotFound);
        assert_eq!(classifier.classify("no such table: invoices"), ErrorCategory::TableNotFound);
        assert_eq!(classifier.classify("interrupted"), ErrorCategory::Timeout);
        assert_eq!(
            classifier.classify(r#"near "FRM": syntax error"#),
            ErrorCategory::SyntaxError
        );
        let details =
            classifier.extract_details("no such column: p.nme", ErrorCategory::ColumnNotFound);
        assert_eq!(details.missing_column.as_deref(), Some("nme"));
    }

    #[test]
    fn retryability_by_category() {
        assert!(!ErrorCategory::PermissionDenied.is_retryable());
        assert!(!ErrorCategory::ConnectionError.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Unknown.is_retryable());
        assert_eq!(ErrorCategory::Timeout.class(), ErrorClass::System);
        assert_eq!(ErrorCategory::JoinError.class(), ErrorClass::Sql);
        assert_eq!(
            serde_json::to_string(&ErrorCategory::ColumnNotFound).unwrap(),
            "\"column_not_found\""
        );
    }

    #[test]
    fn extracts_details() {
        let classifier = ErrorClassifier::default();
        let details = classifier.extract_details(
            r#"column "id" does not exist"#,
            ErrorCategory::ColumnNotFound,
        );
        assert_eq!(details.missing_column.as_deref(), Some("id"));
        let details = classifier.extract_details(
            r#"syntax error at or near "FRM""#,
            ErrorCategory::SyntaxError,
        );
        assert_eq!(details.error_near.as_deref(), Some("FRM"));
        let details = classifier.extract_details(
            r#"relation "invoices" does not exist"#,
            ErrorCategory::TableNotFound,
        );
        assert_eq!(details.missing_table.as_deref(), Some("invoices"));
    }

    #[test]
    fn column_feedback_uses_single_table() {
        let classifier = ErrorClassifier::default();
        let schema = SchemaContext::from_tables([(
            "products",
            TableSchema::new([("product_id", "INTEGER"), ("name", "VARCHAR")]),
        )]);
        let details = classifier.extract_details(
            r#"column "nme" does not exist"#,
            ErrorCategory::ColumnNotFound,
        );
        assert_eq!(
            classifier.generate_feedback(ErrorCategory::ColumnNotFound, &details, &schema),
            concat!(
                "Column 'nme' does not exist in table 'products'. ",
                "Available columns in products: product_id, name. Did you mean: name?"
            )
        );
    }

    #[test]
    fn column_feedback_searches_all_tables() {
        let classifier = ErrorClassifier::default();
        let details = classifier.extract_details(
            r#"column "totl" does not exist"#,
            ErrorCategory::ColumnNotFound,
        );
        assert_eq!(
            classifier.generate_feedback(ErrorCategory::ColumnNotFound, &details, &shop()),
            "Column 'totl' does not exist. Did you mean: total (in orders)?"
        );

        let details = classifier.extract_details(
            r#"column "zzz" does not exist"#,
            ErrorCategory::ColumnNotFound,
        );
        assert_eq!(
            classifier.generate_feedback(ErrorCategory::ColumnNotFound, &details, &shop()),
            concat!(
                "Column 'zzz' does not exist. Available tables: ",
                "products (product_id, name, price...), orders (order_id, customer_id, total...)"
            )
        );
    }

    #[test]
    fn table_feedback_suggests_names() {
        let classifier = ErrorClassifier::default();
        let details = classifier.extract_details(
            r#"relation "product" does not exist"#,
            ErrorCategory::TableNotFound,
        );
        assert_eq!(
            classifier.generate_feedback(ErrorCategory::TableNotFound, &details, &shop()),
            concat!(
                "Table 'product' does not exist. ",
                "Available tables: products, orders. Did you mean: products?"
            )
        );
    }

    #[test]
    fn templated_feedback() {
        let classifier =
            ErrorClassifier::new(ErrorPatterns::postgres(), FeedbackConfig::default(), 12);
        let details = ErrorDetails {
            full_error: "boom".into(),
            ..Default::default()
        };
        assert!(classifier
            .generate_feedback(ErrorCategory::Timeout, &details, &shop())
            .contains("exceeded 12 seconds"));
        assert_eq!(
            classifier.generate_feedback(ErrorCategory::Unknown, &details, &shop()),
            "Unknown error occurred: boom"
        );
    }
}
