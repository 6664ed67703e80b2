//! QueryPilot agent
//!
//! Answers natural-language questions against a read-only SQLite database,
//! correcting generated SQL through the bounded retry loop.
//!
//! Usage:
//!   querypilot --config config/agent_config.toml "How many orders were placed?"
//!   echo "List all products" | querypilot --schema schema.json --database shop.db

use anyhow::Context;
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{error, info};

use querypilot::config::{LlmProviderKind, QueryPilotConfig, SqlDialect};
use querypilot::executor::SqliteExecutionService;
use querypilot::generation::{OpenAiSqlGenerator, SqlGenerator, StubSqlGenerator};
use querypilot::orchestrator::{CorrectionResult, Orchestrator};
use querypilot::schema::StaticSchemaProvider;

/// Agent CLI arguments
#[derive(Parser, Debug)]
#[command(name = "querypilot")]
#[command(about = "QueryPilot - self-correcting natural language to SQL")]
struct Args {
    /// Path to configuration file (TOML, or JSON with a .json extension)
    #[arg(long, env = "QUERYPILOT_CONFIG_PATH")]
    config: Option<String>,

    /// Schema context JSON file (overrides [schema] path)
    #[arg(long)]
    schema: Option<String>,

    /// SQLite database file (overrides [database] path)
    #[arg(long)]
    database: Option<String>,

    /// Maximum attempts per question (overrides [correction] max_attempts)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Scripted SQL for the stub generator, replayed in order
    #[arg(long = "stub-sql")]
    stub_sql: Vec<String>,

    /// Print results as JSON lines
    #[arg(long, default_value = "false")]
    json: bool,

    /// Questions to answer; read from stdin, one per line, when omitted
    questions: Vec<String>,
}

impl Args {
    /// Load the config file, then apply env overrides, then CLI flags.
    fn resolve_config(&self) -> anyhow::Result<QueryPilotConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path);
                QueryPilotConfig::from_file(path)
                    .with_context(|| format!("Failed to load config file '{}'", path))?
            }
            None => QueryPilotConfig::default(),
        };
        config.apply_env_overrides()?;

        if let Some(schema) = &self.schema {
            config.schema.path = Some(schema.clone());
        }
        if let Some(database) = &self.database {
            config.database.path = Some(database.clone());
        }
        if let Some(max_attempts) = self.max_attempts {
            config.correction.max_attempts = max_attempts;
        }
        // Errors come from the bundled SQLite backend, whatever the file says
        if config.executor.dialect != SqlDialect::Sqlite {
            info!("Classifying errors with SQLite patterns (backend is SQLite)");
            config.executor.dialect = SqlDialect::Sqlite;
        }
        config.validate()?;
        Ok(config)
    }
}

fn build_generator(
    config: &QueryPilotConfig,
    stub_sql: &[String],
) -> anyhow::Result<Arc<dyn SqlGenerator>> {
    match config.llm.provider {
        LlmProviderKind::OpenAi => {
            info!("LLM Provider: openai ({})", config.llm.model);
            Ok(Arc::new(OpenAiSqlGenerator::new(config.llm.clone())?))
        }
        LlmProviderKind::Stub => {
            if stub_sql.is_empty() {
                anyhow::bail!("The stub provider needs at least one --stub-sql response");
            }
            info!("LLM Provider: stub ({} scripted responses)", stub_sql.len());
            Ok(Arc::new(StubSqlGenerator::new(stub_sql.to_vec())))
        }
    }
}

fn build_orchestrator(
    config: QueryPilotConfig,
    stub_sql: &[String],
) -> anyhow::Result<Orchestrator> {
    let schema_path = config
        .schema
        .path
        .clone()
        .context("No schema file configured. Use --schema or set [schema] path")?;
    let database_path = config
        .database
        .path
        .clone()
        .context("No database configured. Use --database or set [database] path")?;

    let schema_provider = StaticSchemaProvider::from_json_file(&schema_path)
        .with_context(|| format!("Failed to load schema '{}'", schema_path))?
        .with_lexical_linking(config.schema.lexical_linking);
    let service = SqliteExecutionService::open(&database_path)
        .with_context(|| format!("Failed to open database '{}'", database_path))?;
    let generator = build_generator(&config, stub_sql)?;

    info!("Schema: {}", schema_path);
    info!("Database: {}", database_path);

    Ok(Orchestrator::builder(config)
        .schema_provider(Arc::new(schema_provider))
        .generator(generator)
        .execution_service(Arc::new(service))
        .build()?)
}

fn read_questions(args: &Args) -> anyhow::Result<Vec<String>> {
    if !args.questions.is_empty() {
        return Ok(args.questions.clone());
    }
    let stdin = std::io::stdin();
    let mut questions = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read question from stdin")?;
        if !line.trim().is_empty() {
            questions.push(line.trim().to_string());
        }
    }
    Ok(questions)
}

fn print_result(result: &CorrectionResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    println!("Question: {}", result.question);
    println!("{}", result);
    if let Some(execution) = result.execution.as_ref().filter(|e| e.success) {
        println!("Columns: {}", execution.columns.join(", "));
        for row in execution.rows.iter().flatten().take(20) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            println!("  {}", cells.join(" | "));
        }
        if execution.row_count > 20 {
            println!("  ... {} rows total", execution.row_count);
        }
    } else if let Some(summary) = result.failure_summary() {
        println!("Reason: {}", summary);
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("querypilot=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;
    info!("QueryPilot starting (max attempts: {})", config.correction.max_attempts);

    let orchestrator = build_orchestrator(config, &args.stub_sql)?;
    let questions = read_questions(&args)?;
    if questions.is_empty() {
        anyhow::bail!("No questions given. Pass them as arguments or on stdin");
    }

    let mut errors = 0usize;
    for question in &questions {
        match orchestrator.run(question).await {
            Ok(result) => print_result(&result, args.json)?,
            Err(e) => {
                errors += 1;
                error!("Question '{}' aborted: {}", question, e);
            }
        }
    }

    let summary = orchestrator.metrics().get_summary();
    if args.json {
        println!("{}", serde_json::json!({ "metrics": summary.to_json() }));
    } else {
        println!("{}", summary);
        println!("{}", orchestrator.executor_metrics());
    }

    if errors > 0 {
        anyhow::bail!("{} question(s) aborted", errors);
    }
    Ok(())
}
