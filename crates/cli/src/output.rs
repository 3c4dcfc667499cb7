//! Output formatting utilities

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file
    pub fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print table rows, or a warning when there are none
pub fn print_rows<R: Tabled>(rows: Vec<R>, empty_message: &str) {
    if rows.is_empty() {
        print_warning(empty_message);
        return;
    }
    let total = rows.len();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    println!("\nTotal: {} rows", total);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print the store round-trip time reported by the server
pub fn print_query_time(db_query_time: Option<&str>) {
    if let Some(elapsed) = db_query_time {
        println!("{}", format!("Query time: {}", elapsed).dimmed());
    }
}

/// Format a metric value, keeping the two decimals the server rounds to
pub fn format_value(value: f64) -> String {
    format!("{:.2}", value)
}

/// Render a JSON scalar for a table cell
pub fn format_cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "-".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() => format_value(f),
            _ => n.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// Color an online flag
pub fn color_online(online: bool) -> String {
    if online {
        "online".green().to_string()
    } else {
        "offline".red().to_string()
    }
}

/// Color a yes/no flag
pub fn color_flag(flag: bool) -> String {
    if flag {
        "yes".green().to_string()
    } else {
        "no".dimmed().to_string()
    }
}
