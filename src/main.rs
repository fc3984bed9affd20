use clap::Parser;
use datastore_backup::cli::{self, Cli};
use datastore_backup::config::ErrorMessage;
use std::process::ExitCode;
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let debug = std::env::var("DEBUG").is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
    let default_level = if debug { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match cli::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("{}", e.to_user_message());
            ExitCode::FAILURE
        }
    }
}
