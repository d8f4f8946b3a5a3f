//! tenant-scope - Main entry point.
//!
//! Runs one SQL statement on a pooled PostgreSQL connection under tenant
//! isolation (or an audited privileged bypass) and prints the rows as JSON.

use std::process::ExitCode;
use tenant_scope::config::Config;
use tenant_scope::db::{PgTenantPool, QueryRunner, TenantExecutor};
use tenant_scope::error::TenancyError;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_usage() {
    eprintln!("Usage: tenant-scope --database <url> --tenant <id> --sql <statement>");
    eprintln!("       tenant-scope --database <url> --privileged --sql <statement>");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  tenant-scope -d postgres://app@localhost/salon -t 42 -s 'SELECT * FROM clients'");
    eprintln!(
        "  tenant-scope -d postgres://app@localhost/salon -t 42 --transaction \\\n      -s 'UPDATE clients SET vip = true WHERE id = $1' -p 7"
    );
    eprintln!("  tenant-scope -d postgres://app@localhost/salon --privileged -s 'SELECT count(*) FROM clients'");
}

fn report(err: &TenancyError) {
    error!(kind = err.kind(), error = %err, "Statement failed");
    eprintln!("Error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("Hint: {}", suggestion);
    }
}

async fn run(config: &Config) -> Result<(), TenancyError> {
    let db_config = config
        .parse_database()
        .map_err(TenancyError::invalid_input)?;
    let mode = config.execution_mode()?;
    let request = config.query_request()?;

    let pool = PgTenantPool::connect(&db_config).await?;
    let executor = TenantExecutor::new(pool.clone());
    let runner = QueryRunner::with_defaults(config.query_timeout, config.limit);

    let outcome = runner.run(&executor, mode, &request).await;
    pool.close().await;
    let result = outcome?;

    info!(
        mode = %mode,
        rows = result.row_count(),
        truncated = result.truncated,
        elapsed_ms = result.execution_time_ms,
        "Statement completed"
    );

    let rendered = serde_json::to_string_pretty(&result)
        .map_err(|e| TenancyError::internal(format!("Failed to render result: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    if config.database.is_none() || config.sql.is_none() {
        eprintln!("Error: a database URL and a SQL statement are required.");
        eprintln!();
        print_usage();
        return ExitCode::from(2);
    }

    info!("Starting tenant-scope v{}", env!("CARGO_PKG_VERSION"));

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
