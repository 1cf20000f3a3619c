//! Command-line front end.
//!
//! ```bash
//! # Ask a question (prints the answer, or {"answer"}/{"error"} with --json)
//! nl2sql ask "How many products cost more than 100?"
//!
//! # Print the schema the model sees
//! nl2sql schema
//!
//! # Check database connectivity
//! nl2sql health
//! ```

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use nl2sql::{
    AnswerResponse, Client, SchemaCatalog, Settings, SqlAgent, SqlDatabase, SqlxDatabase,
};

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(version)]
#[command(about = "Answer natural-language questions about a SQL database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Database URL (postgres:// or sqlite:); overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Chat model; overrides OPENAI_MODEL
    #[arg(long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask {
        question: String,

        /// Print the response as JSON
        #[arg(long)]
        json: bool,

        /// Maximum model calls
        #[arg(long)]
        max_turns: Option<usize>,

        /// Maximum rows returned per query
        #[arg(long)]
        row_limit: Option<usize>,

        /// Allow INSERT/UPDATE/DELETE and other non-query statements
        #[arg(long)]
        allow_writes: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print table definitions and sample rows
    Schema {
        /// Only these tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Check the database connection
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env()?;
    if let Some(url) = cli.common.database_url {
        settings.database_url = url;
    }
    if let Some(model) = cli.common.model {
        settings.model = model;
    }

    let db = SqlxDatabase::connect(&settings.database_config()).await?;
    let db: Arc<dyn SqlDatabase> = Arc::new(db);

    match cli.command {
        Commands::Ask {
            question,
            json,
            max_turns,
            row_limit,
            allow_writes,
            timeout_secs,
        } => {
            let mut config = settings.loop_config();
            // Read-only unless explicitly allowed, regardless of NL2SQL_READ_ONLY.
            config = config.with_read_only(!allow_writes);
            if let Some(max_turns) = max_turns {
                config = config.with_max_turns(max_turns);
            }
            if let Some(row_limit) = row_limit {
                config = config.with_row_limit(row_limit);
            }

            let client = Client::new(settings.client_config())?;
            let agent = SqlAgent::from_database(Arc::new(client), db, config);

            let response = match timeout_secs {
                Some(secs) => agent
                    .answer_question_with_timeout(&question, Duration::from_secs(secs))
                    .await
                    .into_response(),
                None => agent.answer_question(&question).await,
            };

            if json {
                println!("{}", serde_json::to_string(&response)?);
            } else {
                match &response {
                    AnswerResponse::Answer { answer } => println!("{answer}"),
                    AnswerResponse::Error { error } => eprintln!("error: {error}"),
                }
            }
            Ok(if response.is_answer() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Schema { tables } => {
            let catalog = SchemaCatalog::with_options(db, settings.loop_config().catalog_options());
            println!("{}", catalog.table_info(&tables).await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            db.ping().await?;
            let tables = db.list_tables().await?;
            println!(
                "database connected ({}): {} tables",
                db.backend(),
                tables.len()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
