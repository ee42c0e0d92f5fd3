//! Output formatting utilities

use console::{style, StyledObject};
use rdm_types::{TaskRecord, TaskStatus};
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// `current / total`, or just `current` while the size is unknown
pub fn format_transferred(record: &TaskRecord) -> String {
    match record.total_bytes {
        Some(total) => format!("{} / {}", format_bytes(record.bytes_so_far), format_bytes(total)),
        None => format_bytes(record.bytes_so_far),
    }
}

pub fn format_progress(record: &TaskRecord) -> String {
    match record.total_bytes {
        Some(_) => format!("{:.1}%", record.progress()),
        None => "?".to_string(),
    }
}

pub fn status_icon(status: TaskStatus) -> StyledObject<&'static str> {
    match status {
        TaskStatus::Success => style("✓").green(),
        TaskStatus::Running => style("↓").cyan(),
        TaskStatus::Paused => style("⏸").yellow(),
        TaskStatus::Canceled => style("○").dim(),
        s if s.is_waiting() => style("…").yellow(),
        s if s.is_error() => style("✗").red(),
        _ => style("·").dim(),
    }
}

/// Shorten long names for table cells
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}
