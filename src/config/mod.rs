#[allow(clippy::module_inception)]
mod config;

pub use config::{AlertConfig, Config, MailerConfig, PollConfig, RunConfig};
