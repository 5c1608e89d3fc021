mod cli;
mod commands;
mod config;
mod paths;
mod plugins;
mod state;
mod ui;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use pipeline::Interrupt;
use std::io;

/// Exit code when the run failed before producing results
const EXIT_ERROR: i32 = 2;

/// Exit code after Ctrl-C
const EXIT_INTERRUPTED: i32 = 130;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub debug: u8,
    pub quiet: bool,
    pub interrupt: Interrupt,
}

impl Context {
    /// Root logger for step output
    pub fn logger(&self, name: &str) -> logkit::Logger {
        logkit::Logger::new(name)
            .with_verbosity(self.verbose)
            .with_debug_level(self.debug)
    }
}

fn init_logging(cli: &Cli) {
    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // Step output is always shown unless quiet
    let step_level = if cli.debug > 0 {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else {
        builder
            .filter_level(log_level)
            .filter_module(logkit::LOG_TARGET, step_level.max(log_level));
    }
    builder.format_timestamp(None).format_target(false).init();
}

fn run(cli: Cli) -> Result<i32> {
    let interrupt = Interrupt::new();
    let handler = interrupt.clone();
    ctrlc::set_handler(move || handler.trigger()).context("Failed to install Ctrl-C handler")?;

    let ctx = Context {
        verbose: cli.verbose,
        debug: cli.debug,
        quiet: cli.quiet,
        interrupt,
    };

    match cli.command {
        Command::Run(args) => commands::run::run(&ctx, args),
        Command::Status(args) => commands::status::run(&ctx, args).map(|()| 0),
        Command::Clean(args) => commands::clean::run(&ctx, args).map(|()| 0),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "testrun", &mut io::stdout());
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            match e.downcast_ref::<pipeline::Error>() {
                Some(pipeline::Error::Interrupted { .. }) => EXIT_INTERRUPTED,
                _ => EXIT_ERROR,
            }
        }
    };
    std::process::exit(code);
}
