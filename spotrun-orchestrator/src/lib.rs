pub mod alert;
pub mod catalog;
pub mod cli;
pub mod error;
pub mod guard;
pub mod image;
pub mod launch;
pub mod monitor;
pub mod pipeline;
pub mod poll;
pub mod provider_manager;
pub mod provisioner;
pub mod ranker;
pub mod retry;
pub mod settings;

pub use error::LaunchError;
pub use pipeline::{Pipeline, RunSummary};
pub use settings::Settings;
