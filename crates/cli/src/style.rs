//! Shared styling utilities for CLI output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Label for an actor: humans blue, the agent magenta.
pub fn actor(name: &str) -> String {
    let style = match name {
        "human" => Style::new().blue().bold(),
        "agent" => Style::new().magenta().bold(),
        _ => Style::new(),
    };
    style.apply_to(name).to_string()
}

/// Short form of a commit id.
pub fn short_sha(sha: &str) -> &str {
    &sha[..8.min(sha.len())]
}
