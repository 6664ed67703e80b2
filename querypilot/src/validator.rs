//! Pre-execution SQL validation
//!
//! Four independent layers, each contributing issues and a penalty:
//!
//! | Layer    | Checks                                         | Penalty          |
//! |----------|------------------------------------------------|------------------|
//! | Syntax   | non-empty, read-only prefix, parens, stmt type | −0.6 once        |
//! | Schema   | referenced tables and columns exist            | −0.4 per issue   |
//! | Safety   | destructive keywords                           | confidence = 0.0 |
//! | Semantic | cartesian products, missing GROUP BY           | −0.2 per issue   |
//!
//! Penalties are applied in that order and the result is clamped to [0, 1].
//! The safety override replaces the running score rather than subtracting.

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::QueryPilotConfig;
use crate::repair::{AutoRepair, ColumnFix};
use crate::schema::SchemaContext;
use crate::sql_text;

const SYNTAX_PENALTY: f64 = 0.6;
const SCHEMA_PENALTY: f64 = 0.4;
const SEMANTIC_PENALTY: f64 = 0.2;

/// Destructive keywords, matched as whole words
pub const UNSAFE_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "ALTER", "TRUNCATE", "UPDATE", "INSERT", "CREATE", "REPLACE",
];

// Whole-word matching is narrower than a plain substring scan: identifiers
// such as `created_at` or `updated_by` pass. A substring scan would block
// them and change which queries are rejected.
static UNSAFE_RES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    UNSAFE_KEYWORDS
        .iter()
        .map(|kw| (*kw, Regex::new(&format!(r"(?i)\b{}\b", kw)).unwrap()))
        .collect()
});

const CARTESIAN_WARNING: &str =
    "Multiple tables detected but no JOIN found (possible cartesian product)";

static AGGREGATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:COUNT|SUM|AVG|MAX|MIN)\s*\(").unwrap());

/// Outcome of a single layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerResult {
    pub valid: bool,
    pub issues: Vec<String>,
}

impl LayerResult {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerResults {
    pub syntax: LayerResult,
    pub schema: LayerResult,
    pub safety: LayerResult,
    pub semantic: LayerResult,
}

/// Result of validating one SQL text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Always within [0, 1]
    pub confidence: f64,
    pub is_valid: bool,
    /// Issues from all layers, in layer order
    pub issues: Vec<String>,
    pub layer_results: LayerResults,
}

impl ValidationResult {
    /// True when any issue points at a missing identifier
    pub fn mentions_missing_identifier(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.to_lowercase().contains("does not exist"))
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_valid { "✓ VALID" } else { "✗ INVALID" };
        write!(
            f,
            "{} (confidence: {:.2}) - {} issues",
            status,
            self.confidence,
            self.issues.len()
        )
    }
}

/// Validation after the opportunistic repair pass
#[derive(Debug, Clone)]
pub struct RepairedValidation {
    /// SQL that `result` describes; differs from the input when repaired
    pub sql: String,
    pub result: ValidationResult,
    pub fixes: Vec<ColumnFix>,
}

impl RepairedValidation {
    pub fn repaired(&self) -> bool {
        !self.fixes.is_empty()
    }
}

/// Multi-layer confidence scorer
#[derive(Debug, Clone)]
pub struct Validator {
    threshold: f64,
    repair: AutoRepair,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl Validator {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            threshold: confidence_threshold,
            repair: AutoRepair::default(),
        }
    }

    pub fn from_config(config: &QueryPilotConfig) -> Self {
        Self::new(config.validator.confidence_threshold)
            .with_repair(AutoRepair::from_config(&config.repair))
    }

    /// Use `repair` for the opportunistic fix in [`Self::validate_with_repair`].
    pub fn with_repair(mut self, repair: AutoRepair) -> Self {
        self.repair = repair;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The column fixer shared with the orchestrator's repair attempt
    pub fn repair(&self) -> &AutoRepair {
        &self.repair
    }

    /// Run all four layers. `question` is only used for logging.
    pub fn validate(&self, sql: &str, schema: &SchemaContext, question: &str) -> ValidationResult {
        debug!("[Validator] Validating SQL for question: {}", question);

        let syntax = LayerResult::from_issues(self.check_syntax(sql));
        let schema_layer = LayerResult::from_issues(self.check_schema(sql, schema));
        let safety = LayerResult::from_issues(self.check_safety(sql));
        let semantic = LayerResult::from_issues(self.check_semantics(sql));

        let mut confidence = 1.0;
        if !syntax.valid {
            confidence -= SYNTAX_PENALTY;
        }
        confidence -= SCHEMA_PENALTY * schema_layer.issues.len() as f64;
        if !safety.valid {
            confidence = 0.0;
        }
        confidence -= SEMANTIC_PENALTY * semantic.issues.len() as f64;
        let confidence: f64 = confidence.clamp(0.0, 1.0);

        let is_valid = confidence >= self.threshold && confidence > 0.0;
        let issues: Vec<String> = [&syntax, &schema_layer, &safety, &semantic]
            .iter()
            .flat_map(|layer| layer.issues.iter().cloned())
            .collect();

        info!(
            "[Validator] Valid: {} (confidence: {:.2})",
            is_valid, confidence
        );
        if !is_valid {
            for issue in &issues {
                warn!("[Validator]   - {}", issue);
            }
        }

        ValidationResult {
            confidence,
            is_valid,
            issues,
            layer_results: LayerResults {
                syntax,
                schema: schema_layer,
                safety,
                semantic,
            },
        }
    }

    /// Validate, and if the SQL is rejected for a missing identifier, try the
    /// column fixer once and re-validate when it changed anything.
    pub fn validate_with_repair(
        &self,
        sql: &str,
        schema: &SchemaContext,
        question: &str,
    ) -> RepairedValidation {
        let result = self.validate(sql, schema, question);
        if result.is_valid || !result.mentions_missing_identifier() {
            return RepairedValidation {
                sql: sql.to_string(),
                result,
                fixes: Vec::new(),
            };
        }

        let repair = self.repair.repair(sql, schema);
        let fixed = repair.sql_or(sql);
        if sql_text::normalize_sql(fixed) == sql_text::normalize_sql(sql) {
            return RepairedValidation {
                sql: sql.to_string(),
                result,
                fixes: Vec::new(),
            };
        }

        info!("[AutoFix] Column repair applied");
        RepairedValidation {
            sql: fixed.to_string(),
            result: self.validate(fixed, schema, question),
            fixes: repair.fixes().to_vec(),
        }
    }

    fn check_syntax(&self, sql: &str) -> Vec<String> {
        if sql.trim().is_empty() {
            return vec!["Empty SQL query".to_string()];
        }

        let upper = sql.trim().to_uppercase();
        if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
            return vec!["SQL must start with SELECT or WITH".to_string()];
        }

        match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(statements) => {
                if let Some(statement) = statements.first() {
                    if !matches!(statement, Statement::Query(_)) {
                        return vec![format!(
                            "Unexpected SQL type: {}",
                            statement_kind(statement)
                        )];
                    }
                }
            }
            // An unparseable statement is treated as an unknown type, not a failure
            Err(e) => debug!("[Validator] Parser could not classify statement: {}", e),
        }

        if sql.matches('(').count() != sql.matches(')').count() {
            return vec!["Unmatched parentheses".to_string()];
        }

        Vec::new()
    }

    fn check_schema(&self, sql: &str, schema: &SchemaContext) -> Vec<String> {
        if schema.is_empty() {
            return vec!["No schema provided for validation".to_string()];
        }

        let mut issues = Vec::new();
        let tables = sql_text::extract_tables(sql);
        let ctes = sql_text::extract_cte_names(sql);
        let available: Vec<&str> = schema.table_names().collect();

        for table in &tables {
            if ctes.contains(table) {
                continue;
            }
            if !schema.has_table(table) {
                issues.push(format!(
                    "Table '{}' does not exist in schema (available: {})",
                    table,
                    available.join(", ")
                ));
            }
        }

        for (table, columns) in column_references(sql, &tables) {
            let Some((table_name, table_schema)) = schema.find_table(&table) else {
                continue;
            };
            for column in columns {
                if column != "*" && !table_schema.has_column(&column) {
                    let sample: Vec<&str> =
                        table_schema.column_names().into_iter().take(5).collect();
                    issues.push(format!(
                        "Column '{}' not in table '{}' (available: {}...)",
                        column,
                        table_name,
                        sample.join(", ")
                    ));
                }
            }
        }

        issues
    }

    fn check_safety(&self, sql: &str) -> Vec<String> {
        UNSAFE_RES
            .iter()
            .filter(|(_, re)| re.is_match(sql))
            .map(|(kw, _)| format!("Unsafe operation detected: {}", kw))
            .collect()
    }

    fn check_semantics(&self, sql: &str) -> Vec<String> {
        let mut issues = Vec::new();
        let upper = sql.to_uppercase();

        let mut referenced = sql_text::extract_tables(sql);
        referenced.extend(sql_text::extract_cte_names(sql));
        if referenced.len() > 1 && !upper.contains("JOIN") {
            issues.push(CARTESIAN_WARNING.to_string());
        }

        if AGGREGATE_RE.is_match(sql)
            && !upper.contains("GROUP BY")
            && sql_text::select_clause_upper(sql).contains(',')
        {
            issues.push("Aggregation with multiple columns but no GROUP BY".to_string());
        }

        issues
    }
}

/// Column references grouped by resolved (lowercased) table name.
fn column_references(sql: &str, tables: &IndexSet<String>) -> IndexMap<String, IndexSet<String>> {
    let mut refs: IndexMap<String, IndexSet<String>> = IndexMap::new();
    let single_table = if tables.len() == 1 { tables.first().cloned() } else { None };

    for reference in sql_text::qualified_refs(sql) {
        refs.entry(reference.qualifier.to_ascii_lowercase())
            .or_default()
            .insert(reference.column.to_ascii_lowercase());
    }

    for arg in sql_text::function_arg_columns(sql) {
        if let Some((qualifier, column)) = arg.split_once('.') {
            refs.entry(qualifier.to_ascii_lowercase())
                .or_default()
                .insert(column.to_ascii_lowercase());
        } else if let Some(table) = &single_table {
            refs.entry(table.clone())
                .or_default()
                .insert(arg.to_ascii_lowercase());
        }
    }

    if let Some(table) = &single_table {
        for column in sql_text::bare_select_columns(sql) {
            refs.entry(table.clone()).or_default().insert(column);
        }
    }

    let aliases = sql_text::alias_map(sql);
    let mut resolved: IndexMap<String, IndexSet<String>> = IndexMap::new();
    for (key, columns) in refs {
        let table = aliases.get(&key).cloned().unwrap_or(key);
        resolved.entry(table).or_default().extend(columns);
    }
    resolved
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Query(_) => "SELECT",
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE",
        _ => "OTHER",
    }
}
