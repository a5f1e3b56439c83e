//! rowpipe - run one command and print its rows.

mod cli;

use cli::{Cli, OutputFormat};
use db_rowpipe::config::{Config, ConnectionConfig};
use db_rowpipe::db::{CommandProvider, DataRecord, MemoryProvider, MemoryResult, PgProvider, Value};
use db_rowpipe::error::{Result, RowpipeError};
use db_rowpipe::logging;
use db_rowpipe::query::{Backpressure, Column, Command};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    logging::init_stderr_logging();

    if let Err(e) = run().await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let format = cli.parse_output_format().map_err(RowpipeError::invalid_argument)?;

    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;
    let backpressure = config.stream.backpressure()?;

    if cli.mock_db {
        let provider = MemoryProvider::new(
            MemoryResult::new(["result"])
                .with_row(vec![Value::String(format!("Mock result for: {}", cli.sql))]),
        );
        return run_command(&cli, &config, Arc::new(provider), backpressure, format).await;
    }

    let connection = resolve_connection(&cli, &config)?.ok_or_else(|| {
        RowpipeError::config("No database connection configured. Use --help for usage information.")
    })?;
    info!("Connection: {}", connection.display_string());

    let provider = Arc::new(PgProvider::connect(&connection).await?);
    let result = run_command(&cli, &config, Arc::clone(&provider), backpressure, format).await;
    provider.close().await;
    result
}

/// Resolves the final connection configuration from CLI args, config file, and environment.
fn resolve_connection(cli: &Cli, config: &Config) -> Result<Option<ConnectionConfig>> {
    // Start with CLI connection config if provided
    let mut connection = cli.to_connection_config()?;

    // If no CLI connection, try named connection from config
    if connection.is_none() {
        if let Some(name) = cli.connection_name() {
            connection = config.get_connection(Some(name)).cloned();
            if connection.is_none() {
                return Err(RowpipeError::config(format!(
                    "Connection '{}' not found in config file",
                    name
                )));
            }
        }
    }

    // If still no connection, try default from config
    if connection.is_none() {
        connection = config.get_connection(None).cloned();
    }

    if let Some(ref mut conn) = connection {
        conn.apply_env_defaults();
    }

    Ok(connection)
}

async fn run_command<P: CommandProvider>(
    cli: &Cli,
    config: &Config,
    provider: Arc<P>,
    backpressure: Backpressure,
    format: OutputFormat,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let command = Command::text(provider, cli.sql.clone())
        .timeout(config.command.timeout())
        .with_backpressure(backpressure)
        .with_cancellation(cancel);

    let start = Instant::now();
    let printed = if cli.stream {
        print_stream(cli, &command, format).await?
    } else {
        let result = command.to_buffer(&cli.selection()).await?;
        let names: Vec<String> = result.columns().iter().map(|c| c.name.clone()).collect();
        let limit = cli.limit.unwrap_or(usize::MAX);
        let rows: Vec<&Vec<Value>> = result.rows().iter().take(limit).collect();
        match format {
            OutputFormat::Table => print_table(&names, &rows),
            OutputFormat::Json => {
                for row in &rows {
                    println!("{}", json_line(&names, row));
                }
            }
        }
        rows.len()
    };

    info!(
        "{printed} rows in {:?} ({:?})",
        start.elapsed(),
        command.state()
    );
    Ok(())
}

/// Prints rows as the stream yields them, closing it early once the limit is hit.
async fn print_stream<P: CommandProvider>(
    cli: &Cli,
    command: &Command<P>,
    format: OutputFormat,
) -> Result<usize> {
    let mut stream = command.to_stream_with_columns(
        cli.selection(),
        |columns: &[Column], record: &P::Cursor| {
            columns
                .iter()
                .map(|c| Ok((c.name.clone(), record.value(c.ordinal)?)))
                .collect::<Result<Vec<(String, Value)>>>()
        },
    )?;

    let limit = cli.limit.unwrap_or(usize::MAX);
    let mut printed = 0;
    while printed < limit {
        let Some(row) = stream.next().await else {
            break;
        };
        let row = row?;
        let (names, values): (Vec<String>, Vec<Value>) = row.into_iter().unzip();

        match format {
            OutputFormat::Table => {
                if printed == 0 {
                    println!("{}", names.join(" | "));
                }
                let cells: Vec<String> = values.iter().map(Value::to_display_string).collect();
                println!("{}", cells.join(" | "));
            }
            OutputFormat::Json => println!("{}", json_line(&names, &values)),
        }
        printed += 1;
    }
    stream.close();

    Ok(printed)
}

fn json_line(names: &[String], values: &[Value]) -> String {
    let object: serde_json::Map<String, serde_json::Value> = names
        .iter()
        .cloned()
        .zip(values.iter().map(|v| serde_json::to_value(v).unwrap_or_default()))
        .collect();
    serde_json::Value::Object(object).to_string()
}

fn print_table(names: &[String], rows: &[&Vec<Value>]) {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(Value::to_display_string).collect())
        .collect();

    let mut widths: Vec<usize> = names.iter().map(|n| n.chars().count()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |values: &[String]| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
    };

    println!("{}", line(names));
    println!(
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );
    for row in &cells {
        println!("{}", line(row));
    }
}
