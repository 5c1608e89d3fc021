use anyhow::Result;
use colored::Colorize;
use pipeline::{STEPS, StepStatus, StepWorkdir};

use crate::Context;
use crate::cli::IdArgs;
use crate::plugins::report::format_totals;
use crate::state::RunState;
use crate::ui;

pub fn run(_ctx: &Context, args: IdArgs) -> Result<()> {
    let workdir = super::existing_run(&args)?;
    let state = RunState::load(&workdir)?;

    ui::header(&format!("Run {}", workdir.display()));
    ui::kv("Plan", &state.plan.display().to_string());
    ui::kv("Created", &state.created.format("%Y-%m-%d %H:%M:%S").to_string());
    ui::kv("Updated", &state.updated.format("%Y-%m-%d %H:%M:%S").to_string());

    println!();
    for step in STEPS {
        let status = match state.step(step) {
            StepStatus::Done => "done".green(),
            StepStatus::Todo => "todo".dimmed(),
        };
        ui::kv(step, &status.to_string());
    }

    let guests = StepWorkdir::create(&workdir, pipeline::provision::STEP_NAME)?.load_guests()?;
    if !guests.is_empty() {
        println!();
        for (name, record) in &guests {
            let address = record.data.primary_address.as_deref().unwrap_or("-");
            ui::kv(&format!("guest {name}"), &format!("{} ({address})", record.how));
        }
    }

    let results = StepWorkdir::create(&workdir, pipeline::execute::STEP_NAME)?.load_results()?;
    println!();
    ui::kv("Results", &format_totals(&results));

    if state.is_complete() {
        ui::success("Run complete");
    }
    Ok(())
}
