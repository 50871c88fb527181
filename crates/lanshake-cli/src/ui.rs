//! UI utilities for Lanshake CLI.

use lanshake_core::index::format_size;
use lanshake_core::transfer::TransferProgress;

const BAR_WIDTH: usize = 30;

/// Render a progress line like `[#####-----]  50.0%  1.2 MB / 2.4 MB`.
pub fn progress_line(progress: &TransferProgress) -> String {
    let percent = progress.percentage();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filled = ((percent / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);

    format!(
        "[{}{}] {:5.1}%  {} / {}  ({}/{})",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        percent,
        format_size(progress.bytes_transferred),
        format_size(progress.total_bytes),
        (progress.current_entry + 1).min(progress.total_entries),
        progress.total_entries,
    )
}

/// Format a millisecond timestamp as local time, or `never` for zero.
pub fn format_timestamp(millis: i64) -> String {
    if millis <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(millis).map_or_else(
        || "unknown".to_string(),
        |t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        },
    )
}

/// Shorten text for one-line display.
pub fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max_chars || line.len() < text.len() {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
