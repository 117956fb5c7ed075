//! Throughput and remaining-time estimation.
//!
//! Keeps a sliding window of per-chunk speeds (bytes per millisecond, scaled
//! by the working thread count). Bytes resolved by checksum-deploy are left
//! out because they say nothing about bandwidth.

use crate::config::MAX_BUILD_INFO_THREADS;
use crate::transfer::chunk::{ChunkStatus, FileStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Speed samples kept per working thread
pub const SPEEDS_PER_WORKING_THREAD: usize = 10;

/// Average indexing cost of one build-info file, in seconds
pub const BUILD_INFO_AVERAGE_INDEX_SECS: f64 = 1.25;

/// A run must be at least this old before an estimate is shown
pub const MIN_TIME_TO_SHOW_ESTIMATION: Duration = Duration::from_secs(5 * 60);

const BYTES_IN_MIB: f64 = 1024.0 * 1024.0;
const NOT_AVAILABLE: &str = "Not available yet";

const SECS_IN_MINUTE: u64 = 60;
const SECS_IN_HOUR: u64 = 60 * SECS_IN_MINUTE;
const SECS_IN_DAY: u64 = 24 * SECS_IN_HOUR;

/// Estimator state, persisted inside the run status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimation {
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub last_speeds: VecDeque<f64>,
    #[serde(default)]
    pub last_speeds_sum: f64,
    #[serde(default)]
    pub speeds_average: f64,
    #[serde(default)]
    pub current_total_transferred_bytes: u64,
}

impl TimeEstimation {
    /// Account for a finished chunk that took `duration_millis` to process.
    pub fn add_chunk_status(
        &mut self,
        status: &ChunkStatus,
        duration_millis: u64,
        working_threads: usize,
    ) {
        if duration_millis == 0 {
            return;
        }

        let mut chunk_bytes = 0u64;
        for file in &status.files {
            if file.status != FileStatus::Fail {
                self.current_total_transferred_bytes += file.size_bytes;
            }
            chunk_bytes += file.transferred_bytes();
        }
        if chunk_bytes == 0 {
            return;
        }

        let threads = working_threads.max(1);
        let speed = threads as f64 * chunk_bytes as f64 / duration_millis as f64;
        self.last_speeds.push_back(speed);
        self.last_speeds_sum += speed;

        let window = threads * SPEEDS_PER_WORKING_THREAD;
        while self.last_speeds.len() > window {
            if let Some(oldest) = self.last_speeds.pop_front() {
                self.last_speeds_sum -= oldest;
            }
        }
        self.speeds_average = if self.last_speeds.is_empty() {
            0.0
        } else {
            self.last_speeds_sum / self.last_speeds.len() as f64
        };
    }

    /// Speed in MiB per second.
    pub fn speed_mb_per_sec(&self) -> f64 {
        self.speeds_average * 1000.0 / BYTES_IN_MIB
    }

    pub fn speed_string(&self) -> String {
        if self.last_speeds.is_empty() {
            return NOT_AVAILABLE.to_string();
        }
        format!("{:.3} MB/s", self.speed_mb_per_sec())
    }

    /// Remaining seconds for `remaining_bytes`, or `None` while the estimate is
    /// not meaningful yet.
    pub fn remaining_secs(&self, remaining_bytes: u64, running_for: Duration) -> Option<u64> {
        if self.current_total_transferred_bytes == 0 || running_for < MIN_TIME_TO_SHOW_ESTIMATION {
            return None;
        }
        if self.speeds_average <= 0.0 {
            return None;
        }
        let millis = remaining_bytes as f64 / self.speeds_average;
        let secs = (millis / 1000.0) as u64;
        (secs > 0).then_some(secs)
    }

    /// Remaining-time text for a regular repository.
    pub fn remaining_time_string(&self, remaining_bytes: u64, running_for: Duration) -> String {
        match self.remaining_secs(remaining_bytes, running_for) {
            Some(secs) => seconds_to_literal_time(secs, "About "),
            None => NOT_AVAILABLE.to_string(),
        }
    }
}

/// Remaining-time text while build-info files are being indexed.
pub fn build_info_remaining_time_string(remaining_files: u64, working_threads: usize) -> String {
    let threads = working_threads.clamp(1, MAX_BUILD_INFO_THREADS);
    let secs = (remaining_files as f64 * BUILD_INFO_AVERAGE_INDEX_SECS / threads as f64) as u64;
    seconds_to_literal_time(secs, "About ")
}

/// "2 hours and 1 minute" style text. The prefix is dropped under a minute.
pub fn seconds_to_literal_time(secs: u64, prefix: &str) -> String {
    let days = secs / SECS_IN_DAY;
    let hours = (secs % SECS_IN_DAY) / SECS_IN_HOUR;
    if days >= 1 {
        return with_remainder(prefix, days, "day", hours, "hour");
    }
    let minutes = (secs % SECS_IN_HOUR) / SECS_IN_MINUTE;
    if hours >= 1 {
        return with_remainder(prefix, hours, "hour", minutes, "minute");
    }
    if minutes >= 1 {
        return with_remainder(prefix, minutes, "minute", 0, "");
    }
    "Less than a minute".to_string()
}

fn with_remainder(prefix: &str, main: u64, main_unit: &str, rest: u64, rest_unit: &str) -> String {
    let mut text = format!("{prefix}{}", amount(main, main_unit));
    if rest > 0 {
        text.push_str(" and ");
        text.push_str(&amount(rest, rest_unit));
    }
    text
}

fn amount(value: u64, unit: &str) -> String {
    if value > 1 {
        format!("{value} {unit}s")
    } else {
        format!("{value} {unit}")
    }
}
