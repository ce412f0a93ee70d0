//! Output formatting utilities

use console::{style, Style};

use stoker_engine::JobState;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// A job state colored by outcome
pub fn job_state(state: JobState) -> String {
    let text = style(state.as_str());
    match state {
        JobState::Succeeded => text.green(),
        JobState::FailedTransient | JobState::Canceled => text.yellow(),
        JobState::FailedPermanent => text.red(),
        _ => text.dim(),
    }
    .to_string()
}

/// "1 job", "2 jobs"
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}
