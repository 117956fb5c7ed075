//! `status` command output.

use super::phase::PhaseId;
use crate::error::Result;
use crate::state::estimate::build_info_remaining_time_string;
use crate::state::estimate::seconds_to_literal_time;
use crate::state::{ProgressState, StateManager, TransferRunStatus, RUN_STATUS_FILE, STOP_FILE};
use chrono::Utc;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

/// "1.5 GiB" style size.
pub fn size_to_string(bytes: u64) -> String {
    const UNITS: &[&str] = &["bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} bytes");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

fn percent(done: u64, total: u64) -> String {
    if total == 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", done as f64 * 100.0 / total as f64)
}

fn storage_line(progress: &ProgressState) -> String {
    format!(
        "{} / {} ({})",
        size_to_string(progress.transferred_size_bytes),
        size_to_string(progress.total_size_bytes),
        percent(progress.transferred_size_bytes, progress.total_size_bytes)
    )
}

fn units_line(progress: &ProgressState) -> String {
    format!(
        "{} / {} ({})",
        progress.transferred_units,
        progress.total_units,
        percent(progress.transferred_units, progress.total_units)
    )
}

fn field(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{:<28}{}", format!("{name}:").bold(), value);
}

/// Human-readable status of the transfer running from `working_dir`.
pub fn status_report(working_dir: &Path) -> Result<String> {
    let mut out = String::new();
    let Some(started) = StateManager::running_since(working_dir)? else {
        field(&mut out, "Status", "Not running".yellow());
        return Ok(out);
    };
    let run = TransferRunStatus::load(&working_dir.join(RUN_STATUS_FILE))?.unwrap_or_default();

    let _ = writeln!(out, "{}", "Overview".bold().underline());
    if working_dir.join(STOP_FILE).exists() {
        field(&mut out, "Status", "Stopping".yellow());
    } else {
        field(&mut out, "Status", "Running".green());
    }
    let running_for = (Utc::now() - started).to_std().unwrap_or_default();
    field(&mut out, "Start time", started.format("%b %e %Y %H:%M:%S"));
    field(
        &mut out,
        "Running for",
        seconds_to_literal_time(running_for.as_secs(), ""),
    );
    field(&mut out, "Storage", storage_line(&run.overall_transfer));
    field(&mut out, "Repositories", units_line(&run.total_repositories));
    field(&mut out, "Working threads", run.working_threads);
    field(&mut out, "Transfer speed", run.time_estimation.speed_string());
    field(&mut out, "Estimated time remaining", remaining_time(&run, running_for));
    let failures = if run.transfer_failures > 0 {
        run.transfer_failures.to_string().red()
    } else {
        run.transfer_failures.to_string().normal()
    };
    field(&mut out, "Transfer failures", failures);

    if !run.current_repo.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Current repository".bold().underline());
        field(&mut out, "Name", &run.current_repo);
        if let Some(phase) = PhaseId::from_index(run.current_repo_phase) {
            field(&mut out, "Phase", phase);
        }
    }

    let stale = run.stale_chunk_count();
    if stale > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Stale chunks".bold().underline());
        field(&mut out, "Count", stale.to_string().yellow());
        for node in &run.stale_chunks {
            for chunk in &node.chunks {
                let _ = writeln!(
                    out,
                    "  {} on node {} ({} files)",
                    chunk.chunk_id,
                    node.node_id,
                    chunk.files.len()
                );
            }
        }
    }
    Ok(out)
}

fn remaining_time(run: &TransferRunStatus, running_for: Duration) -> String {
    if run.build_info_repo {
        let bi = &run.overall_bi_files;
        return build_info_remaining_time_string(
            bi.total_units.saturating_sub(bi.transferred_units),
            run.working_threads,
        );
    }
    let overall = &run.overall_transfer;
    run.time_estimation.remaining_time_string(
        overall
            .total_size_bytes
            .saturating_sub(overall.transferred_size_bytes),
        running_for,
    )
}
