use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "testrun")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Provision guests, prepare them, execute tests and report results", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Debug level of step output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub debug: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run all steps of a plan
    Run(RunArgs),

    /// Show the state of a run
    Status(IdArgs),

    /// Remove run workdirs, stopping their guests
    Clean(IdArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct RunArgs {
    /// Plan file (TOML)
    pub plan: PathBuf,

    #[command(flatten)]
    pub id: IdArgs,

    /// Show what would be done without touching any guest
    #[arg(long)]
    pub dry: bool,

    /// Keep guests running after the run
    #[arg(short, long)]
    pub keep: bool,

    /// Start from scratch, discarding the state of a previous run
    #[arg(short, long)]
    pub force: bool,

    /// Reboot guests at STEP[:ORDER|start|end]
    #[arg(long, value_name = "SPEC")]
    pub reboot: Vec<String>,

    /// Log into guests at STEP[:ORDER|start|end]
    #[arg(long, value_name = "SPEC")]
    pub login: Vec<String>,

    /// Context dimension, overriding the plan (KEY=VALUE)
    #[arg(short, long = "context", value_name = "KEY=VALUE")]
    pub context: Vec<String>,
}

#[derive(Parser)]
pub struct IdArgs {
    /// Run id or workdir path (defaults to the latest run)
    #[arg(short, long, env = "TESTRUN_ID")]
    pub id: Option<String>,
}
