//! Output formatting utilities for CLI commands

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print a section title
pub fn section(title: &str) {
    println!("\n{}", format!("=== {} ===", title).bold());
}

/// Print an aligned `key: value` line
pub fn field(key: &str, value: impl std::fmt::Display) {
    println!("  {:<20} {}", format!("{}:", key), value);
}

/// Print call counts, most frequent first
pub fn call_table(calls: &BTreeMap<String, u64>) {
    let mut sorted: Vec<_> = calls.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    println!("  {:>8}  {}", "COUNT".dimmed(), "CALL".dimmed());
    for (name, count) in sorted {
        println!("  {:>8}  {}", count, name);
    }
}

/// Print `value` as pretty JSON
pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
