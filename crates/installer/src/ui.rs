//! UI helpers for the homelab CLI.
//!
//! Provides consistent formatting for console output.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Print the banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
  _                          _       _
 | |__   ___  _ __ ___   ___| | __ _| |__
 | '_ \ / _ \| '_ ` _ \ / _ \ |/ _` | '_ \
 | | | | (_) | | | | | |  __/ | (_| | |_) |
 |_| |_|\___/|_| |_| |_|\___|_|\__,_|_.__/
"
        .cyan()
    );
    println!("  {}", "Raspberry Pi · K3s · Istio".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print progress within a step.
pub fn print_progress(message: &str) {
    println!("  {} {}", "→".cyan(), message);
}

/// Print a component header.
pub fn print_component(name: &str, description: &str) {
    println!();
    println!("{} {} {}", "📦".bold(), name.cyan().bold(), description.bright_black());
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Spinner for long waits (reboots, installs).
#[must_use]
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
