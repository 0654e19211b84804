use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use super::parsers::parse_key_value;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed experiment orchestrator - declare campaigns of scenarios, stage clients and data on remote hosts over multiplexed SSH channels, shape traffic, run workloads and harvest the logs."
)]
pub struct CampaignerArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (sets log level to debug unless overridden by CAMPAIGNER_LOG/RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the scenarios of one or more campaign files
    RunCampaign(RunCampaignArgs),
    /// Rebuild processed data and views from stored raw logs
    Reparse(ReparseArgs),
    /// Serve multiplexed command channels over stdin/stdout (spawned on
    /// gateways, not for interactive use)
    #[command(name = "mux-serve", hide = true)]
    MuxServe,
}

#[derive(Debug, Args, Clone)]
pub struct RunCampaignArgs {
    /// Only check the scenarios: set everything up and tear it down
    /// again without starting clients
    #[arg(long = "check", conflicts_with = "nocheck")]
    pub check: bool,

    /// Do the real run without a check run first (the default; kept as
    /// an explicit flag)
    #[arg(long = "nocheck")]
    pub nocheck: bool,

    /// Directory campaign results are created under; must exist when
    /// set, the default is created when missing
    #[arg(long = "results-dir", env = "RESULTS_DIR", value_name = "DIR")]
    pub results_dir: Option<String>,

    /// Campaign files to run, in order
    #[arg(required = true, value_name = "CAMPAIGN_FILE")]
    pub campaign_files: Vec<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct ReparseArgs {
    /// Only reparse executions stored as leechers
    #[arg(long = "leechers", conflicts_with = "seeders")]
    pub leechers: bool,

    /// Only reparse executions stored as seeders
    #[arg(long = "seeders")]
    pub seeders: bool,

    /// Add a parser by subtype (repeatable)
    #[arg(long = "parser", value_name = "SUBTYPE")]
    pub parsers: Vec<String>,

    /// Add a processor by subtype (repeatable)
    #[arg(long = "processor", value_name = "SUBTYPE")]
    pub processors: Vec<String>,

    /// Add a viewer by subtype (repeatable)
    #[arg(long = "viewer", value_name = "SUBTYPE")]
    pub viewers: Vec<String>,

    /// Set key=value on the most recent --parser/--processor/--viewer
    #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub arguments: Vec<(String, String)>,

    /// Scenario results directories to reparse
    #[arg(required = true, value_name = "RESULTS_DIR")]
    pub directories: Vec<PathBuf>,
}
