//! Upload progress lines and human-readable sizes and durations.

use std::time::{Duration, Instant};

/// Counts finished transfers of a batch against its expected totals.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    expected_bytes: u64,
    expected_files: usize,
    done_bytes: u64,
    done_files: usize,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            started: Instant::now(),
            expected_bytes: total_bytes,
            expected_files: total_files,
            done_bytes: 0,
            done_files: 0,
        }
    }

    /// Record one finished transfer of `bytes`.
    pub fn record(&mut self, bytes: u64) {
        self.done_bytes += bytes;
        self.done_files += 1;
    }

    /// Share of the expected bytes done so far, 0-100. An empty batch reports 0.
    pub fn percent(&self) -> f64 {
        match self.expected_bytes {
            0 => 0.0,
            expected => self.done_bytes as f64 * 100.0 / expected as f64,
        }
    }

    /// Bytes per second since the tracker was created.
    pub fn rate(&self) -> u64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.done_bytes as f64 / secs) as u64
    }

    /// `"<verb> <name> (done/total, pct%, rate)"` for the transfer just recorded.
    pub fn describe(&self, verb: &str, name: &str) -> String {
        format!(
            "{} {} ({}/{}, {:.0}%, {})",
            verb,
            name,
            self.done_files,
            self.expected_files,
            self.percent(),
            format_speed(self.rate())
        )
    }
}

/// `1536` -> `"1.50 KB"`. Binary units up to TB.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Seconds below a minute, minutes and seconds below an hour, else hours and minutes.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, secs % 3600 / 60),
    }
}
