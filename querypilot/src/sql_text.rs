//! Pattern-based SQL text analysis
//!
//! Everything here is best-effort regex work over raw SQL text. There is no
//! AST: table, alias and column extraction follow simple `FROM`/`JOIN`
//! conventions and will miss or misread unusual constructs.

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;

// ============================================================================
// Static Regexes
// ============================================================================

static LINE_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)--.*$").unwrap());

static BLOCK_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)```(?:postgresql|postgres|sqlite|sql)?\s*([\s\S]*?)```").unwrap()
});

static STRING_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());

static FROM_TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bFROM\s+(\w+)").unwrap());

static JOIN_TABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bJOIN\s+(\w+)").unwrap());

static FROM_LIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)\bFROM\s+([\w\s,]+?)(?:\bWHERE\b|\bGROUP\b|\bORDER\b|\bLIMIT\b|\bHAVING\b|\bUNION\b|\bJOIN\b|\bINNER\b|\bLEFT\b|\bRIGHT\b|\bFULL\b|\bCROSS\b|\bNATURAL\b|\bOFFSET\b|\)|;|$)",
    )
    .unwrap()
});

static CTE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bWITH(?:\s+RECURSIVE)?|,)\s*(\w+)\s+AS\s*\(").unwrap()
});

static ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:FROM|JOIN)\s+(\w+)\s+(?:AS\s+)?(\w+)").unwrap()
});

static COLUMN_ALIAS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bAS\s+(\w+)").unwrap());

static QUALIFIED_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*|\*)").unwrap());

static FUNCTION_ARG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b\w+\s*\([^)]*?,\s*([A-Za-z_][\w\.]*)\)").unwrap()
});

static SELECT_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bSELECT\s+(.*?)\s+FROM\b").unwrap());

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").unwrap());

/// Reserved words and common functions never treated as identifiers.
pub const SQL_KEYWORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "avg", "between", "by", "case", "cast", "coalesce",
    "count", "cross", "current_date", "current_timestamp", "date", "date_trunc", "day", "desc",
    "distinct", "else", "end", "except", "exists", "extract", "false", "fetch", "filter",
    "first", "from", "full", "group", "having", "hour", "ilike", "in", "inner", "intersect",
    "interval", "is", "join", "last", "left", "like", "limit", "lower", "max", "min", "minute",
    "month", "natural", "not", "now", "null", "nullif", "nulls", "offset", "on", "or", "order",
    "outer", "over", "partition", "recursive", "right", "round", "row_number", "rows", "select",
    "sum", "then", "true", "union", "upper", "using", "when", "where", "window", "with", "year",
];

pub fn is_keyword(word: &str) -> bool {
    SQL_KEYWORDS.contains(&word.to_ascii_lowercase().as_str())
}

/// Canonical form used for retry-guard comparison: comments removed,
/// whitespace collapsed, lowercased.
pub fn normalize_sql(sql: &str) -> String {
    let without_line = LINE_COMMENT_RE.replace_all(sql, "");
    let without_block = BLOCK_COMMENT_RE.replace_all(&without_line, "");
    without_block
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word-level summary of what changed between two SQL texts, for logs.
pub fn sql_diff(previous: &str, current: &str) -> String {
    let before = normalize_sql(previous);
    let after = normalize_sql(current);
    if before == after {
        return "No functional changes (formatting only)".to_string();
    }

    let old_words: Vec<&str> = before.split_whitespace().collect();
    let new_words: Vec<&str> = after.split_whitespace().collect();
    let mut changes = Vec::new();
    for i in 0..old_words.len().max(new_words.len()) {
        match (old_words.get(i), new_words.get(i)) {
            (Some(a), Some(b)) if a != b => changes.push(format!("Changed: '{}' → '{}'", a, b)),
            (Some(a), None) => changes.push(format!("Removed: '{}'", a)),
            (None, Some(b)) => changes.push(format!("Added: '{}'", b)),
            _ => {}
        }
    }

    if changes.is_empty() {
        return "Structural changes detected".to_string();
    }
    let mut summary = changes.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
    if changes.len() > 3 {
        summary.push_str(&format!(" (and {} more)", changes.len() - 3));
    }
    summary
}

/// Remove markdown code fences a model may wrap around its SQL.
pub fn strip_code_fences(raw: &str) -> String {
    if let Some(caps) = CODE_FENCE_RE.captures(raw) {
        if let Some(inner) = caps.get(1) {
            return inner.as_str().trim().to_string();
        }
    }

    let mut sql = raw.trim();
    for prefix in ["```sql", "```SQL", "```"] {
        if let Some(rest) = sql.strip_prefix(prefix) {
            sql = rest;
            break;
        }
    }
    sql.strip_suffix("```").unwrap_or(sql).trim().to_string()
}

/// True when a limiting clause is already textually present.
pub fn has_limit(sql: &str) -> bool {
    sql.to_uppercase().contains("LIMIT")
}

/// Replace string literal contents with spaces, keeping byte offsets.
pub fn mask_literals(sql: &str) -> String {
    STRING_LITERAL_RE
        .replace_all(sql, |caps: &regex::Captures| " ".repeat(caps[0].len()))
        .into_owned()
}

/// Byte ranges of string literals in `sql`.
pub fn literal_ranges(sql: &str) -> Vec<std::ops::Range<usize>> {
    STRING_LITERAL_RE.find_iter(sql).map(|m| m.range()).collect()
}

fn from_list_segments(sql: &str) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    for caps in FROM_LIST_RE.captures_iter(sql) {
        let list = &caps[1];
        for part in list.split(',') {
            let tokens: Vec<String> = part
                .split_whitespace()
                .map(|t| t.to_ascii_lowercase())
                .collect();
            if !tokens.is_empty() {
                segments.push(tokens);
            }
        }
    }
    segments
}

/// Lowercased table names referenced from `FROM` and `JOIN` clauses,
/// including comma-separated `FROM` lists.
pub fn extract_tables(sql: &str) -> IndexSet<String> {
    let masked = mask_literals(sql);
    let mut tables = IndexSet::new();
    for caps in FROM_TABLE_RE.captures_iter(&masked) {
        tables.insert(caps[1].to_ascii_lowercase());
    }
    for caps in JOIN_TABLE_RE.captures_iter(&masked) {
        tables.insert(caps[1].to_ascii_lowercase());
    }
    for segment in from_list_segments(&masked) {
        if let Some(first) = segment.first() {
            if !is_keyword(first) {
                tables.insert(first.clone());
            }
        }
    }
    tables
}

/// Lowercased common-table-expression names.
pub fn extract_cte_names(sql: &str) -> IndexSet<String> {
    let masked = mask_literals(sql);
    if !masked.trim_start().to_ascii_uppercase().starts_with("WITH") {
        return IndexSet::new();
    }
    CTE_NAME_RE
        .captures_iter(&masked)
        .map(|caps| caps[1].to_ascii_lowercase())
        .collect()
}

/// alias → table, both lowercased, from `FROM/JOIN table [AS] alias` pairs.
pub fn alias_map(sql: &str) -> IndexMap<String, String> {
    let masked = mask_literals(sql);
    let mut aliases = IndexMap::new();
    let mut add = |table: &str, alias: &str| {
        let table = table.to_ascii_lowercase();
        let alias = alias.to_ascii_lowercase();
        if table != alias && !is_keyword(&alias) && !is_keyword(&table) {
            aliases.insert(alias, table);
        }
    };

    for caps in ALIAS_RE.captures_iter(&masked) {
        add(&caps[1], &caps[2]);
    }
    for segment in from_list_segments(&masked) {
        match segment.as_slice() {
            [table, alias] => add(table, alias),
            [table, kw, alias] if kw == "as" => add(table, alias),
            _ => {}
        }
    }
    aliases
}

/// Lowercased names introduced by `AS name` (select-list aliases, CTEs).
pub fn output_aliases(sql: &str) -> IndexSet<String> {
    COLUMN_ALIAS_RE
        .captures_iter(&mask_literals(sql))
        .map(|caps| caps[1].to_ascii_lowercase())
        .collect()
}

/// A `qualifier.column` reference found in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedRef {
    pub qualifier: String,
    pub column: String,
    pub range: std::ops::Range<usize>,
}

/// Qualified references (`table.column`, `alias.column`, `alias.*`),
/// with their original spelling and byte range.
pub fn qualified_refs(sql: &str) -> Vec<QualifiedRef> {
    let masked = mask_literals(sql);
    QUALIFIED_REF_RE
        .captures_iter(&masked)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(QualifiedRef {
                qualifier: caps[1].to_string(),
                column: caps[2].to_string(),
                range: whole.range(),
            })
        })
        .collect()
}

/// Columns appearing as a non-first function argument, e.g. the
/// `order_date` in `DATE_TRUNC('month', order_date)`.
pub fn function_arg_columns(sql: &str) -> Vec<String> {
    FUNCTION_ARG_RE
        .captures_iter(&mask_literals(sql))
        .map(|caps| {
            caps[1]
                .trim()
                .trim_matches(|c| c == ')' || c == ' ' || c == ',' || c == '"' || c == '\'')
                .to_string()
        })
        .filter(|c| !c.is_empty())
        .collect()
}

/// Unqualified, undecorated column names from the first select list.
///
/// Items containing a qualifier, a wildcard, a function call, `AS`, or
/// `DISTINCT` are skipped.
pub fn bare_select_columns(sql: &str) -> Vec<String> {
    let masked = mask_literals(sql);
    let Some(caps) = SELECT_LIST_RE.captures(&masked) else {
        return Vec::new();
    };

    let mut columns = Vec::new();
    for item in caps[1].split(',') {
        let item = item.trim();
        if item.is_empty() || item.contains('.') || item.contains('*') || item.contains('(') {
            continue;
        }
        let decorated = WORD_RE.find_iter(item).any(|w| {
            matches!(
                w.as_str().to_ascii_uppercase().as_str(),
                "AS" | "COUNT" | "SUM" | "AVG" | "MAX" | "MIN" | "DISTINCT"
            )
        });
        if decorated {
            continue;
        }

        let name = item
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c| c == '(' || c == ')' || c == ',');
        let identifier_like = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if identifier_like && !is_keyword(name) {
            columns.push(name.to_ascii_lowercase());
        }
    }
    columns
}

/// Text before the first `FROM`, uppercased.
pub fn select_clause_upper(sql: &str) -> String {
    let upper = sql.to_uppercase();
    upper.split("FROM").next().unwrap_or("").to_string()
}
