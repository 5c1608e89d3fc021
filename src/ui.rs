use colored::{Color, Colorize};
use pipeline::ResultOutcome;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

pub fn outcome_color(outcome: ResultOutcome) -> Color {
    match outcome {
        ResultOutcome::Pass => Color::Green,
        ResultOutcome::Fail | ResultOutcome::Error => Color::Red,
        ResultOutcome::Warn => Color::Yellow,
        ResultOutcome::Info => Color::Blue,
        ResultOutcome::Skip => Color::White,
    }
}

/// Outcome padded for column output, colored by severity
pub fn outcome(outcome: ResultOutcome) -> String {
    format!("{:<5}", outcome.as_str())
        .color(outcome_color(outcome))
        .bold()
        .to_string()
}
