//! Schema context
//!
//! The per-question mapping of relevant tables to their columns and keys.
//! It is fetched once per question by the orchestrator and reused, unchanged,
//! for every attempt.

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by schema providers
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid schema document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Schema provider unavailable: {0}")]
    Unavailable(String),
}

/// Metadata for one table: column name → type, primary keys, and
/// foreign keys (column → "table.column").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: IndexMap<String, String>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: IndexMap<String, String>,
}

impl TableSchema {
    pub fn new<I, K, V>(columns: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            primary_keys: Vec::new(),
            foreign_keys: IndexMap::new(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_keys.push(column.into());
        self
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.foreign_keys.insert(column.into(), target.into());
        self
    }

    /// Case-insensitive column membership
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.keys().any(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Column names folded to lowercase, in declaration order
    pub fn lowercase_columns(&self) -> Vec<String> {
        self.columns.keys().map(|c| c.to_lowercase()).collect()
    }
}

/// Mapping of table name → table metadata. Iteration order is the order in
/// which tables were supplied, which keeps feedback text deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaContext {
    tables: IndexMap<String, TableSchema>,
}

impl SchemaContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables<I, K>(tables: I) -> Self
    where
        I: IntoIterator<Item = (K, TableSchema)>,
        K: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn insert(&mut self, name: impl Into<String>, table: TableSchema) {
        self.tables.insert(name.into(), table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableSchema)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Case-insensitive table lookup returning the canonical name
    pub fn find_table(&self, name: &str) -> Option<(&str, &TableSchema)> {
        self.tables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.find_table(name).is_some()
    }

    /// Lowercased table → lowercased columns, as used by text analysis
    pub fn column_index(&self) -> IndexMap<String, Vec<String>> {
        self.tables
            .iter()
            .map(|(name, table)| (name.to_lowercase(), table.lowercase_columns()))
            .collect()
    }

    /// Subset of this schema restricted to `names`, in schema order
    pub fn subset(&self, names: &IndexSet<String>) -> Self {
        Self {
            tables: self
                .tables
                .iter()
                .filter(|(k, _)| names.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Plain-text rendering embedded in generation prompts.
    pub fn render_for_prompt(&self) -> String {
        if self.tables.is_empty() {
            return "No tables found in schema.".to_string();
        }

        let mut lines = Vec::new();
        for (name, table) in &self.tables {
            lines.push(format!("Table: {}", name));
            if !table.columns.is_empty() {
                let cols: Vec<String> = table
                    .columns
                    .iter()
                    .map(|(c, t)| format!("{} ({})", c, t))
                    .collect();
                lines.push(format!("Columns: {}", cols.join(", ")));
            }
            if !table.primary_keys.is_empty() {
                lines.push(format!("Primary Key: {}", table.primary_keys.join(", ")));
            }
            if !table.foreign_keys.is_empty() {
                let fks: Vec<String> = table
                    .foreign_keys
                    .iter()
                    .map(|(c, target)| format!("{} → {}", c, target))
                    .collect();
                lines.push(format!("Foreign Keys: {}", fks.join(", ")));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

/// Supplies the schema context for a question. Called once per question.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_schema(&self, question: &str) -> Result<SchemaContext, SchemaError>;
}

/// Serves a fixed schema, optionally narrowed to the tables a question
/// mentions lexically and expanded along foreign keys.
pub struct StaticSchemaProvider {
    schema: SchemaContext,
    lexical_linking: bool,
}

impl StaticSchemaProvider {
    pub fn new(schema: SchemaContext) -> Self {
        Self {
            schema,
            lexical_linking: false,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        Ok(Self::new(SchemaContext::from_json_file(path)?))
    }

    pub fn with_lexical_linking(mut self, enabled: bool) -> Self {
        self.lexical_linking = enabled;
        self
    }

    fn link(&self, question: &str) -> SchemaContext {
        let words: IndexSet<String> = question
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(singular)
            .collect();

        let mut selected: IndexSet<String> = IndexSet::new();
        for (name, table) in self.schema.tables() {
            let name_hit = words.contains(&singular(&name.to_lowercase()));
            let column_hit = table.columns.keys().any(|col| {
                let col = col.to_lowercase();
                words.contains(&singular(&col))
                    || col
                        .split('_')
                        .filter(|seg| seg.len() > 2 && *seg != "id")
                        .any(|seg| words.contains(&singular(seg)))
            });
            if name_hit || column_hit {
                selected.insert(name.to_string());
            }
        }

        if selected.is_empty() {
            debug!("[SchemaLink] No lexical match, using full schema");
            return self.schema.clone();
        }

        // Foreign-key expansion: pull in every table a selected table references
        let direct: Vec<String> = selected.iter().cloned().collect();
        for name in direct {
            if let Some((_, table)) = self.schema.find_table(&name) {
                for target in table.foreign_keys.values() {
                    let ref_table = target.split('.').next().unwrap_or(target);
                    if let Some((canonical, _)) = self.schema.find_table(ref_table) {
                        selected.insert(canonical.to_string());
                    }
                }
            }
        }

        self.schema.subset(&selected)
    }
}

fn singular(word: &str) -> String {
    word.strip_suffix('s')
        .filter(|w| w.len() > 2)
        .unwrap_or(word)
        .to_string()
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn get_schema(&self, question: &str) -> Result<SchemaContext, SchemaError> {
        let schema = if self.lexical_linking {
            self.link(question)
        } else {
            self.schema.clone()
        };
        info!("[SchemaLink] Linked {} table(s)", schema.len());
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> SchemaContext {
        SchemaContext::from_tables([
            (
                "products",
                TableSchema::new([
                    ("product_id", "INTEGER"),
                    ("name", "VARCHAR"),
                    ("price", "DECIMAL"),
                ])
                .with_primary_key("product_id"),
            ),
            (
                "orders",
                TableSchema::new([
                    ("order_id", "INTEGER"),
                    ("customer_id", "INTEGER"),
                    ("total", "DECIMAL"),
                ])
                .with_primary_key("order_id")
                .with_foreign_key("customer_id", "customers.customer_id"),
            ),
            (
                "customers",
                TableSchema::new([("customer_id", "INTEGER"), ("email", "VARCHAR")]),
            ),
        ])
    }

    #[test]
    fn parses_json_document() {
        let schema = SchemaContext::from_json_str(
            r#"{"products": {"columns": {"product_id": "INTEGER", "name": "VARCHAR"},
                 "primary_keys": ["product_id"], "foreign_keys": {}}}"#,
        )
        .unwrap();
        let (name, table) = schema.find_table("PRODUCTS").unwrap();
        assert_eq!(name, "products");
        assert!(table.has_column("Product_ID"));
        assert_eq!(table.primary_keys, vec!["product_id"]);
    }

    #[test]
    fn renders_prompt_text() {
        let text = shop().render_for_prompt();
        assert!(text.contains("Table: products"));
        assert!(text.contains("Columns: product_id (INTEGER), name (VARCHAR), price (DECIMAL)"));
        assert!(text.contains("Primary Key: order_id"));
        assert!(text.contains("Foreign Keys: customer_id → customers.customer_id"));
    }

    #[test]
    fn empty_schema_renders_placeholder() {
        assert_eq!(SchemaContext::new().render_for_prompt(), "No tables found in schema.");
    }

    #[tokio::test]
    async fn lexical_linking_expands_foreign_keys() {
        let provider = StaticSchemaProvider::new(shop()).with_lexical_linking(true);
        let schema = provider.get_schema("Total of all orders last month").await.unwrap();
        let names: Vec<&str> = schema.table_names().collect();
        assert_eq!(names, vec!["orders", "customers"]);
    }

    #[tokio::test]
    async fn lexical_linking_falls_back_to_full_schema() {
        let provider = StaticSchemaProvider::new(shop()).with_lexical_linking(true);
        let schema = provider.get_schema("How is the weather?").await.unwrap();
        assert_eq!(schema.len(), 3);
    }
}
