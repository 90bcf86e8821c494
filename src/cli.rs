use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::campaign::{BatchOutcome, BatchState, CampaignDriver, CampaignEvent};
use crate::config::{CampaignConfig, DEFAULT_BATCH_SIZE};
use crate::gateway::build_gateway;
use crate::ledger::{CampaignStatus, JsonLedgerStore, ProgressLedger};
use crate::recipients::RecipientSource;

/// Mailcampaign - resumable batch email campaigns
#[derive(Parser, Debug)]
#[command(name = "mailcampaign")]
#[command(about = "Send email campaigns in resumable batches")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Settings file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a batch of the default size
    Run,

    /// Send a batch of a custom size
    Batch {
        /// Number of recipients to send to
        size: usize,
    },

    /// Send one test message; campaign progress is not touched
    Test {
        /// Recipient of the test message
        recipient: String,
    },

    /// List the recipients of the active source
    List,

    /// Show campaign progress
    Status,

    /// Switch the active recipient list
    Source {
        /// Path to the recipient CSV file
        path: PathBuf,
    },

    /// Write an initial settings file
    Init(InitArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Verified sender address
    #[arg(long)]
    pub sender_email: String,

    /// Sender display name
    #[arg(long)]
    pub sender_name: Option<String>,

    /// SendGrid API key
    #[arg(long)]
    pub api_key: Option<String>,

    /// Recipient CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,
}

/// Command-line interface handler
pub struct CliHandler {
    config_path: PathBuf,
    config: CampaignConfig,
}

impl CliHandler {
    /// Create a new CLI handler, loading settings from `config_path` or the default location
    pub async fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => CampaignConfig::default_path()?,
        };
        let config = CampaignConfig::load_from_file(&config_path).await?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    /// Handle CLI commands
    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Run => self.handle_batch(DEFAULT_BATCH_SIZE).await,
            Commands::Batch { size } => self.handle_batch(size).await,
            Commands::Test { recipient } => self.handle_test(&recipient).await,
            Commands::List => self.handle_list(),
            Commands::Status => self.handle_status(),
            Commands::Source { path } => self.handle_source(path).await,
            Commands::Init(args) => self.handle_init(args).await,
        }
    }

    fn driver(&self) -> Result<CampaignDriver> {
        self.config
            .validate()
            .map_err(|e| anyhow!("{}. Run 'mailcampaign init' or edit {}", e, self.config_path.display()))?;
        let gateway = build_gateway(&self.config)?;
        Ok(CampaignDriver::new(self.config.clone(), Arc::from(gateway)))
    }

    async fn handle_batch(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(anyhow!("Batch size must be greater than 0"));
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let driver = self.driver()?.with_events(tx);
        let cancel = driver.cancel_handle();

        println!("📧 Mailcampaign batch send");
        println!("==========================\n");
        println!("Source: {}", self.config.csv_file.display());
        println!("Gateway: {}", self.config.gateway);
        println!("Batch size: {}", size);
        println!("Press Ctrl-C to stop after the current recipient.\n");

        let mut worker = tokio::spawn(async move { driver.run_batch(size).await });
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut cancel_requested = false;
        let mut state = BatchState::default();

        let result = loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if let CampaignEvent::StateChanged(next) = event {
                        state = next;
                    }
                    print_event(&event);
                }
                _ = &mut ctrl_c, if !cancel_requested => {
                    cancel_requested = true;
                    cancel.cancel();
                    match state {
                        BatchState::Sending { index, total } => {
                            println!("⏹️  Stopping after recipient {}/{}...", index, total)
                        }
                        _ => println!("⏹️  Stopping before the next recipient..."),
                    }
                }
                result = &mut worker => break result,
            }
        };

        while let Ok(event) = rx.try_recv() {
            print_event(&event);
        }

        match result?? {
            BatchOutcome::Complete(_) => {
                println!("\n🎉 Nothing left to send for this list.");
            }
            BatchOutcome::Finished { summary, status } => {
                println!("\n📊 Batch Summary");
                println!("===============");
                println!("   Attempted: {}/{}", summary.attempted, summary.requested);
                println!("   Successful: {}", summary.successful);
                println!("   Failed: {}", summary.failed);
                println!("   Success rate: {:.1}%", summary.success_rate());
                if summary.cancelled {
                    println!("   Batch was cancelled before completion");
                }
                println!("   Remaining in list: {}", status.remaining);
            }
        }

        Ok(())
    }

    async fn handle_test(&self, recipient: &str) -> Result<()> {
        println!("🧪 Sending test email to {}", recipient.trim());
        let driver = self.driver()?;
        let outcome = driver.send_test(recipient).await?;

        if outcome.success {
            println!("✅ Test email sent successfully");
            if let Some(code) = outcome.status_code {
                println!("   Status code: {}", code);
            }
            Ok(())
        } else {
            println!("❌ Test email failed: {}", outcome.diagnostic());
            Err(anyhow!("Test email failed"))
        }
    }

    fn handle_list(&self) -> Result<()> {
        let recipients = RecipientSource::new(&self.config.csv_file).load_or_empty();

        println!("📋 Recipients in {}", self.config.csv_file.display());
        println!("===============\n");
        if recipients.is_empty() {
            println!("❌ No recipients found");
            return Ok(());
        }

        for (index, address) in recipients.iter().enumerate() {
            println!("{:>6}. {}", index + 1, address);
        }
        println!("\nTotal: {} recipients", recipients.len());
        Ok(())
    }

    fn handle_status(&self) -> Result<()> {
        let status = campaign_status(&self.config);

        println!("📊 Campaign Status");
        println!("==================\n");
        println!("   Source: {}", self.config.csv_file.display());
        println!("   Total in list: {}", status.total_in_source);
        println!("   Attempted: {}", status.attempted);
        println!("   Successful: {}", status.successful);
        println!("   Failed: {}", status.failed);
        println!("   Remaining: {}", status.remaining);
        match status.last_run {
            Some(last_run) => println!("   Last run: {}", last_run.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("   Last run: Never"),
        }

        if status.is_complete() && status.total_in_source > 0 {
            println!("\n🎉 Campaign complete! All emails have been sent.");
        }
        Ok(())
    }

    async fn handle_source(&mut self, path: PathBuf) -> Result<()> {
        if !path.exists() {
            println!("❌ File not found: {}", path.display());
            return Err(anyhow!("Recipient file not found: {}", path.display()));
        }

        let recipients = RecipientSource::new(&path).load()?;
        self.config.set_source(path);
        self.config.save_to_file(&self.config_path).await?;

        println!("✅ Switched to {}", self.config.csv_file.display());
        println!("   {} recipients found", recipients.len());
        Ok(())
    }

    async fn handle_init(&mut self, args: InitArgs) -> Result<()> {
        self.config.sender_email = args.sender_email.trim().to_string();
        if let Some(name) = args.sender_name {
            self.config.sender_name = name;
        }
        if let Some(api_key) = args.api_key {
            self.config.sendgrid_api_key = api_key;
        }
        if let Some(csv) = args.csv {
            self.config.set_source(csv);
        }

        if let Err(e) = self.config.validate() {
            println!("⚠️  Settings are incomplete: {}", e);
        }
        self.config.save_to_file(&self.config_path).await?;

        println!("✅ Settings written to {}", self.config_path.display());
        Ok(())
    }
}

/// Progress of the configured campaign without needing gateway credentials
pub fn campaign_status(config: &CampaignConfig) -> CampaignStatus {
    let source = RecipientSource::new(&config.csv_file);
    let ledger = ProgressLedger::load(Box::new(JsonLedgerStore::for_source(
        &config.progress_dir,
        &source.identity(),
    )));
    ledger.status(&source.load_or_empty())
}

fn print_event(event: &CampaignEvent) {
    match event {
        CampaignEvent::StateChanged(_) => {}
        CampaignEvent::Status(_) => println!("📊 {}", event),
        CampaignEvent::Complete => println!("🎉 {}", event),
        CampaignEvent::BatchStarted { .. } => println!("📧 {}", event),
        CampaignEvent::Attempt { outcome, .. } if outcome.success => println!("✅ {}", event),
        CampaignEvent::Attempt { .. } => println!("❌ {}", event),
        CampaignEvent::PersistFailed { .. } => println!("⚠️  {}", event),
        CampaignEvent::Cancelled { .. } => println!("⏹️  {}", event),
        CampaignEvent::Finished(_) => println!("📈 {}", event),
        CampaignEvent::TestSent { .. } => println!("🧪 {}", event),
    }
}
