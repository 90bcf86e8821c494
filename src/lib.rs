pub mod campaign;
pub mod cli;
pub mod config;
pub mod content;
pub mod gateway;
pub mod ledger;
pub mod recipients;

pub use campaign::{BatchOutcome, BatchSummary, CampaignDriver, CampaignEvent};
pub use config::CampaignConfig;
