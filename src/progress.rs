//! Formatting helpers for the per-second crawl progress line.
//!
//! The engine reports raw counters through its progress callback; rendering
//! them is the host's concern. These helpers produce the single overwritten
//! terminal line the bundled CLI uses.

use crate::dht::CrawlStats;

/// Carriage return plus clear-to-end-of-line.
pub const CLEAR_LINE: &str = "\r\x1b[K";

/// Formats elapsed seconds as `HH:MM:SS`.
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Discovery rate in items per minute; zero when no time has passed.
pub fn per_minute(count: usize, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    count as f64 / elapsed_secs * 60.0
}

/// Renders one progress line from a stats snapshot.
pub fn format_progress_line(stats: &CrawlStats) -> String {
    format!(
        "[{}] Unique: {:4} | Rate: {:5.1}/min | Requests: {:5} | Nodes: {:3} | Samples: {} sent, {} recv",
        format_elapsed(stats.elapsed.as_secs()),
        stats.unique_info_hashes,
        stats.per_minute,
        stats.total_requests,
        stats.table_size,
        stats.samples_sent,
        stats.samples_received,
    )
}
