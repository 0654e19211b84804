//! CLI argument types and parsing helpers.
mod cli;
pub(crate) mod parsers;

pub use cli::{CampaignerArgs, Command, ReparseArgs, RunCampaignArgs};
