//! Deterministic column-name repair
//!
//! Fixes column references that do not exist in the schema context by
//! substituting the closest known column. No model call and no structural
//! rewriting: only identifier tokens are replaced.
//!
//! # Repair rules applied
//! 1. **Qualified references** (`table.column`, `alias.column`) whose column is
//!    not in that table → best match from the same table.
//! 2. **Bare tokens** that are not keywords, tables, aliases or known columns →
//!    best match across all tables, first occurrence only.

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use tracing::{debug, info};

use crate::config::RepairConfig;
use crate::schema::SchemaContext;
use crate::similarity::best_match;
use crate::sql_text;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").unwrap());

/// Which rule produced a fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    Qualified,
    Bare,
}

/// One substituted identifier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnFix {
    pub kind: FixKind,
    pub original: String,
    pub replacement: String,
}

/// Result of a repair attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RepairResult {
    /// At least one column was substituted
    Repaired { sql: String, fixes: Vec<ColumnFix> },
    /// Nothing fixable was found
    NoRepair,
}

impl RepairResult {
    pub fn is_repaired(&self) -> bool {
        matches!(self, RepairResult::Repaired { .. })
    }

    /// Repaired SQL, or `original` when nothing changed
    pub fn sql_or<'a>(&'a self, original: &'a str) -> &'a str {
        match self {
            RepairResult::Repaired { sql, .. } => sql,
            RepairResult::NoRepair => original,
        }
    }

    pub fn fixes(&self) -> &[ColumnFix] {
        match self {
            RepairResult::Repaired { fixes, .. } => fixes,
            RepairResult::NoRepair => &[],
        }
    }
}

/// Fuzzy column fixer shared by the validator and the orchestrator.
#[derive(Debug, Clone)]
pub struct AutoRepair {
    qualified_cutoff: f64,
    bare_cutoff: f64,
}

impl Default for AutoRepair {
    fn default() -> Self {
        Self::from_config(&RepairConfig::default())
    }
}

impl AutoRepair {
    pub fn new(qualified_cutoff: f64, bare_cutoff: f64) -> Self {
        Self {
            qualified_cutoff,
            bare_cutoff,
        }
    }

    pub fn from_config(config: &RepairConfig) -> Self {
        Self::new(config.qualified_cutoff, config.bare_cutoff)
    }

    pub fn repair(&self, sql: &str, schema: &SchemaContext) -> RepairResult {
        let mut fixes = Vec::new();
        let after_qualified = self.repair_qualified(sql, schema, &mut fixes);
        let repaired = self.repair_bare(&after_qualified, schema, &mut fixes);

        if fixes.is_empty() {
            debug!("[AutoRepair] No repairable columns found");
            return RepairResult::NoRepair;
        }
        for fix in &fixes {
            info!("[AutoRepair] Column '{}' → '{}'", fix.original, fix.replacement);
        }
        RepairResult::Repaired {
            sql: repaired,
            fixes,
        }
    }

    fn repair_qualified(
        &self,
        sql: &str,
        schema: &SchemaContext,
        fixes: &mut Vec<ColumnFix>,
    ) -> String {
        let aliases = sql_text::alias_map(sql);
        let mut edits: Vec<(Range<usize>, String)> = Vec::new();

        for reference in sql_text::qualified_refs(sql) {
            if reference.column == "*" {
                continue;
            }
            let qualifier = reference.qualifier.to_ascii_lowercase();
            let table_name = aliases.get(&qualifier).cloned().unwrap_or(qualifier);
            let Some((_, table)) = schema.find_table(&table_name) else {
                continue;
            };
            if table.has_column(&reference.column) {
                continue;
            }
            let columns = table.lowercase_columns();
            let Some(best) = best_match(
                &reference.column,
                columns.iter().map(String::as_str),
                self.qualified_cutoff,
            ) else {
                continue;
            };

            edits.push((
                reference.range.clone(),
                format!("{}.{}", reference.qualifier, best),
            ));
            let fix = ColumnFix {
                kind: FixKind::Qualified,
                original: format!("{}.{}", reference.qualifier, reference.column),
                replacement: format!("{}.{}", reference.qualifier, best),
            };
            if !fixes.contains(&fix) {
                fixes.push(fix);
            }
        }

        apply_edits(sql, edits)
    }

    fn repair_bare(&self, sql: &str, schema: &SchemaContext, fixes: &mut Vec<ColumnFix>) -> String {
        let index = schema.column_index();
        let mut all_columns: IndexSet<&str> = IndexSet::new();
        for cols in index.values() {
            all_columns.extend(cols.iter().map(String::as_str));
        }
        if all_columns.is_empty() {
            return sql.to_string();
        }

        let mut skip: IndexSet<String> = IndexSet::new();
        skip.extend(index.keys().cloned());
        skip.extend(sql_text::extract_tables(sql));
        skip.extend(sql_text::extract_cte_names(sql));
        skip.extend(sql_text::alias_map(sql).into_keys());
        skip.extend(sql_text::output_aliases(sql));

        // Hide literals and qualified references so only bare tokens remain
        let mut masked = sql_text::mask_literals(sql).to_ascii_lowercase();
        for reference in sql_text::qualified_refs(sql) {
            masked.replace_range(reference.range.clone(), &" ".repeat(reference.range.len()));
        }

        let mut seen: IndexSet<String> = IndexSet::new();
        let mut edits: Vec<(Range<usize>, String)> = Vec::new();
        for word in WORD_RE.find_iter(&masked) {
            let token = word.as_str();
            if seen.contains(token)
                || sql_text::is_keyword(token)
                || skip.contains(token)
                || all_columns.contains(token)
                || token.starts_with(|c: char| c.is_ascii_digit())
                || masked[word.end()..].trim_start().starts_with('(')
            {
                continue;
            }
            seen.insert(token.to_string());

            if let Some(best) = best_match(token, all_columns.iter().copied(), self.bare_cutoff) {
                edits.push((word.range(), best.clone()));
                fixes.push(ColumnFix {
                    kind: FixKind::Bare,
                    original: sql[word.range()].to_string(),
                    replacement: best,
                });
            }
        }

        apply_edits(sql, edits)
    }
}

/// Apply non-overlapping byte-range replacements.
fn apply_edits(sql: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    let mut out = sql.to_string();
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    for (range, replacement) in edits {
        out.replace_range(range, &replacement);
    }
    out
}
