use anyhow::{Context, Result};
use clap::Parser;
use pgchat::db::{load_saved_connections, save_connection, SslMode};
use pgchat::export::to_text_table;
use pgchat::format::format_schema;
use pgchat::{
    AppConfig, ConnectionProfile, OpenAiModel, PgDatabase, PipelineError, Session, Transcript,
    TurnOutcome,
};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Ask questions about a PostgreSQL database in plain English
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Use a saved connection by name
    #[arg(long = "connect")]
    connect: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    database: Option<String>,

    /// disable, prefer, require, verify-ca or verify-full
    #[arg(long)]
    sslmode: Option<SslMode>,

    /// Save the resulting connection under this name
    #[arg(long)]
    save_as: Option<String>,

    /// Continue the previous conversation
    #[arg(long)]
    resume: bool,
}

fn resolve_profile(cli: &Cli) -> Result<ConnectionProfile> {
    let mut profile = match &cli.connect {
        Some(name) => {
            let saved = load_saved_connections()?;
            match saved.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
                Some(c) => c.clone(),
                None => {
                    eprintln!("Error: no saved connection named {:?}", name);
                    eprintln!("Saved connections:");
                    for c in &saved {
                        eprintln!("  - {}", c.name);
                    }
                    std::process::exit(1);
                }
            }
        }
        None => ConnectionProfile::default(),
    };

    if let Some(host) = &cli.host {
        profile.host = host.clone();
    }
    if let Some(port) = cli.port {
        profile.port = port;
    }
    if let Some(user) = &cli.user {
        profile.user = user.clone();
    }
    if let Some(database) = &cli.database {
        profile.database = database.clone();
    }
    if let Some(mode) = cli.sslmode {
        profile.ssl_mode = mode;
    }

    // PGPASSWORD first, then an interactive prompt
    if profile.password.is_empty() {
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            profile.password = pw;
        } else {
            let prompt = format!("Password for {}: ", profile.display_string());
            profile.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    Ok(profile)
}

fn print_outcome(outcome: &TurnOutcome) {
    let turn = outcome.turn();
    println!("{}", turn.text);
    if let Some(sql) = &turn.sql {
        println!("\n  SQL: {}", sql);
    }
    if let Some(PipelineError::Execution(e)) = outcome.error() {
        let full = e.display_full();
        if full.lines().count() > 1 {
            println!("\n{}", full);
        }
    }
    if outcome.is_error() {
        if let Some(result) = outcome.result() {
            println!("\n{}", to_text_table(result));
        }
    }
    println!();
}

fn prompt() -> Result<()> {
    print!("pgchat> ");
    std::io::stdout().flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let api_key = config.api_key()?;
    let model = OpenAiModel::new(&config.llm, &api_key);
    let mut profile = resolve_profile(&cli)?;

    let mut session: Session<PgDatabase, OpenAiModel> =
        Session::connect(profile.clone(), model, config.pipeline.clone())
            .await
            .context("could not open a session")?;
    println!("Connected to {}", profile.display_string());

    if let Some(name) = &cli.save_as {
        profile.name = name.clone();
        save_connection(&profile)?;
    }

    let transcript_path = Transcript::default_path();
    if cli.resume {
        session.restore_transcript(Transcript::load(&transcript_path)?);
        println!("Resumed {} earlier turns", session.transcript().len());
    }

    match session.fetch_schema().await {
        Ok(schema) => println!("Loaded {} tables from `{}`", schema.tables.len(), schema.namespace),
        Err(e) => eprintln!("Error: {}", e),
    }
    println!("Type a question, or \\schema, \\refresh, \\sql, \\q\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "\\q" => break,
            "\\schema" => match session.schema() {
                Some(schema) if schema.is_empty() => println!("(no tables)\n"),
                Some(schema) => println!("{}\n", format_schema(schema)),
                None => println!("(schema not loaded; try \\refresh)\n"),
            },
            "\\refresh" => match session.fetch_schema().await {
                Ok(schema) => println!("Reloaded {} tables\n", schema.tables.len()),
                Err(e) => eprintln!("Error: {}\n", e),
            },
            "\\sql" => match session.transcript().last_sql() {
                Some(sql) => println!("{}\n", sql),
                None => println!("(no query yet)\n"),
            },
            request => match session.ask(request).await {
                Ok(outcome) => print_outcome(&outcome),
                Err(e) => eprintln!("Error: {}\n", e),
            },
        }
        prompt()?;
    }

    if let Err(e) = session.transcript().save(&transcript_path) {
        eprintln!("Error: could not save transcript: {:#}", e);
    }
    Ok(())
}
