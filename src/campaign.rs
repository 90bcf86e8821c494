//! Campaign driver
//!
//! Runs one batch at a time: load the ledger and the recipient list, sample
//! the unsent recipients, then send to them one by one. The ledger is
//! persisted after every single attempt so an interrupted run never loses
//! accounting and never sends twice to the same address.

use crate::config::CampaignConfig;
use crate::content::{ContentError, MessageContent};
use crate::gateway::{OutgoingMessage, SendGateway, SendOutcome};
use crate::ledger::{CampaignStatus, JsonLedgerStore, LedgerStore, ProgressLedger};
use crate::recipients::RecipientSource;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Errors that stop a run before anything is sent
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("A batch is already running")]
    AlreadyRunning,

    #[error("Batch size must be greater than 0")]
    InvalidBatchSize,

    #[error("No recipients found in {0}")]
    NoRecipients(PathBuf),

    #[error(transparent)]
    Content(#[from] ContentError),
}

pub type CampaignResult<T> = Result<T, CampaignError>;

/// Where a batch run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Loading,
    Complete,
    Sending { index: usize, total: usize },
    Finished,
}

/// Aggregate result of one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub requested: usize,
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    /// Percentage of attempted sends that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.successful as f64 / self.attempted as f64 * 100.0
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every recipient already has an attempt record; nothing was sent
    Complete(CampaignStatus),
    /// A batch was processed (possibly cancelled part way)
    Finished {
        summary: BatchSummary,
        status: CampaignStatus,
    },
}

/// Progress notifications published while a run executes
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignEvent {
    StateChanged(BatchState),
    Status(CampaignStatus),
    Complete,
    BatchStarted {
        size: usize,
        sender: String,
    },
    Attempt {
        index: usize,
        total: usize,
        address: String,
        outcome: SendOutcome,
    },
    PersistFailed {
        address: String,
    },
    Cancelled {
        remaining: usize,
    },
    Finished(BatchSummary),
    TestSent {
        address: String,
        outcome: SendOutcome,
    },
}

impl std::fmt::Display for CampaignEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignEvent::StateChanged(state) => write!(f, "State: {:?}", state),
            CampaignEvent::Status(status) => write!(f, "Campaign status: {}", status),
            CampaignEvent::Complete => write!(f, "Campaign complete! All emails have been sent."),
            CampaignEvent::BatchStarted { size, sender } => {
                write!(f, "Starting batch send to {} recipients from {}", size, sender)
            }
            CampaignEvent::Attempt {
                index,
                total,
                address,
                outcome,
            } => {
                if outcome.success {
                    write!(f, "[{}/{}] {}: success", index, total, address)
                } else {
                    write!(f, "[{}/{}] {}: failed: {}", index, total, address, outcome.diagnostic())
                }
            }
            CampaignEvent::PersistFailed { address } => {
                write!(f, "Could not save progress after {}; will retry on next send", address)
            }
            CampaignEvent::Cancelled { remaining } => {
                write!(f, "Batch cancelled, {} recipients left unsent", remaining)
            }
            CampaignEvent::Finished(summary) => write!(
                f,
                "Batch complete! Successful: {}, Failed: {}, Success rate: {:.1}%",
                summary.successful,
                summary.failed,
                summary.success_rate()
            ),
            CampaignEvent::TestSent { address, outcome } => {
                if outcome.success {
                    write!(f, "Test email sent to {}", address)
                } else {
                    write!(f, "Failed to send test email to {}: {}", address, outcome.diagnostic())
                }
            }
        }
    }
}

/// Requests a running batch to stop before its next recipient
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Holds the run-in-progress flag for the lifetime of a batch
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> CampaignResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CampaignError::AlreadyRunning)?;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

type StoreFactory = Box<dyn Fn(&CampaignConfig, &RecipientSource) -> Box<dyn LedgerStore> + Send + Sync>;

/// Orchestrates campaign batches against one recipient source
pub struct CampaignDriver {
    config: CampaignConfig,
    gateway: Arc<dyn SendGateway>,
    store_factory: StoreFactory,
    running: Arc<AtomicBool>,
    cancel: CancelHandle,
    send_delay: Duration,
    events: Option<UnboundedSender<CampaignEvent>>,
}

impl CampaignDriver {
    pub fn new(config: CampaignConfig, gateway: Arc<dyn SendGateway>) -> Self {
        Self {
            config,
            gateway,
            store_factory: Box::new(
                |config: &CampaignConfig, source: &RecipientSource| -> Box<dyn LedgerStore> {
                    Box::new(JsonLedgerStore::for_source(&config.progress_dir, &source.identity()))
                },
            ),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancelHandle {
                flag: Arc::new(AtomicBool::new(false)),
            },
            send_delay: crate::config::SEND_DELAY,
            events: None,
        }
    }

    /// Override the pause between sends
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Publish progress events to `sender`
    pub fn with_events(mut self, sender: UnboundedSender<CampaignEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Replace how the ledger store for a source is created
    pub fn with_ledger_store<F>(mut self, factory: F) -> Self
    where
        F: Fn(&CampaignConfig, &RecipientSource) -> Box<dyn LedgerStore> + Send + Sync + 'static,
    {
        self.store_factory = Box::new(factory);
        self
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn source(&self) -> RecipientSource {
        RecipientSource::new(&self.config.csv_file)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Point the driver at another recipient list; its own ledger is used from now on
    pub fn switch_source(&mut self, csv_file: impl Into<PathBuf>) -> CampaignResult<()> {
        if self.is_running() {
            return Err(CampaignError::AlreadyRunning);
        }
        self.config.set_source(csv_file);
        Ok(())
    }

    /// Currently known recipients of the active source
    pub fn recipients(&self) -> Vec<String> {
        self.source().load_or_empty()
    }

    /// Progress of the active campaign
    pub fn status(&self) -> CampaignStatus {
        let source = self.source();
        let ledger = self.open_ledger(&source);
        ledger.status(&source.load_or_empty())
    }

    /// Send one ad hoc message with the campaign content; the ledger is not touched
    pub async fn send_test(&self, recipient: &str) -> CampaignResult<SendOutcome> {
        let content = MessageContent::load(&self.config.content_dir)?;
        let message = OutgoingMessage::for_recipient(
            &self.config.sender_email,
            self.config.sender_display_name(),
            recipient.trim(),
            &content,
        );

        info!("Sending test email to {}", recipient);
        let outcome = self.gateway.send(&message).await;
        self.emit(CampaignEvent::TestSent {
            address: recipient.trim().to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Run one batch of at most `limit` recipients
    pub async fn run_batch(&self, limit: usize) -> CampaignResult<BatchOutcome> {
        let _guard = RunGuard::acquire(&self.running)?;
        if limit == 0 {
            return Err(CampaignError::InvalidBatchSize);
        }
        self.cancel.flag.store(false, Ordering::SeqCst);

        self.emit(CampaignEvent::StateChanged(BatchState::Loading));
        let source = self.source();
        let mut ledger = self.open_ledger(&source);
        let recipients = source.load_or_empty();
        if recipients.is_empty() {
            return Err(CampaignError::NoRecipients(source.path().to_path_buf()));
        }

        let status = ledger.status(&recipients);
        self.emit(CampaignEvent::Status(status.clone()));

        let unsent = ledger.unsent(&recipients);
        if unsent.is_empty() {
            warn!("No unsent emails remaining!");
            self.emit(CampaignEvent::Complete);
            self.emit(CampaignEvent::StateChanged(BatchState::Complete));
            return Ok(BatchOutcome::Complete(status));
        }

        let content = MessageContent::load(&self.config.content_dir)?;
        let batch = {
            let mut rng = rand::thread_rng();
            ledger.sample_batch(&recipients, limit, &mut rng)
        };

        let sender = match self.config.sender_display_name() {
            Some(name) => format!("{} <{}>", name, self.config.sender_email),
            None => self.config.sender_email.clone(),
        };
        self.emit(CampaignEvent::BatchStarted {
            size: batch.len(),
            sender,
        });

        let total = batch.len();
        let mut summary = BatchSummary {
            requested: total,
            ..Default::default()
        };

        for (position, address) in batch.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, stopping before {}", address);
                summary.cancelled = true;
                self.emit(CampaignEvent::Cancelled {
                    remaining: total - position,
                });
                break;
            }

            let index = position + 1;
            self.emit(CampaignEvent::StateChanged(BatchState::Sending { index, total }));

            let message = OutgoingMessage::for_recipient(
                &self.config.sender_email,
                self.config.sender_display_name(),
                address,
                &content,
            );
            let outcome = self.gateway.send(&message).await;

            summary.attempted += 1;
            if outcome.success {
                summary.successful += 1;
                ledger.record(address, true, None);
            } else {
                summary.failed += 1;
                ledger.record(address, false, Some(outcome.diagnostic()));
            }
            if !ledger.persist() {
                self.emit(CampaignEvent::PersistFailed {
                    address: address.clone(),
                });
            }

            self.emit(CampaignEvent::Attempt {
                index,
                total,
                address: address.clone(),
                outcome,
            });

            if index < total && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        self.emit(CampaignEvent::StateChanged(BatchState::Finished));
        self.emit(CampaignEvent::Finished(summary.clone()));

        let status = ledger.status(&recipients);
        self.emit(CampaignEvent::Status(status.clone()));
        Ok(BatchOutcome::Finished { summary, status })
    }

    fn open_ledger(&self, source: &RecipientSource) -> ProgressLedger {
        ProgressLedger::load((self.store_factory)(&self.config, source))
    }

    fn emit(&self, event: CampaignEvent) {
        match &event {
            CampaignEvent::StateChanged(_) => debug!("{}", event),
            CampaignEvent::PersistFailed { .. } => error!("{}", event),
            CampaignEvent::Attempt { outcome, .. } if !outcome.success => warn!("{}", event),
            _ => info!("{}", event),
        }

        if let Some(sender) = &self.events {
            // A closed receiver only means nobody is watching
            let _ = sender.send(event);
        }
    }
}
