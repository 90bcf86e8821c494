use anyhow::Result;
use clap::Parser;
use mailcampaign::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Command output goes to stdout; keep log lines on stderr
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(log_level)
        .init();

    if cli.debug {
        tracing::info!("🐛 Debug mode enabled - verbose logging active");
    }

    let mut handler = CliHandler::new(cli.config).await?;
    handler.handle_command(cli.command).await
}
