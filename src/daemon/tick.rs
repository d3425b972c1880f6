//! One scan tick: list candidates, run each through the eligibility engine,
//! hand eligible jobs to the download executor, then persist state and emit
//! a summary log line.

use super::{download_executor, Shared, TickCounters};
use crate::eligibility::EligibilityEngine;
use crate::scan::ScanMonitor;
use crate::types::Event;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub(super) async fn run_tick(shared: &Shared, cancel: &CancellationToken) {
    let started = Instant::now();
    let config = shared.config.read().await.clone();

    let scan_monitor = ScanMonitor::new(&shared.remote);
    let scan_result = match scan_monitor.scan(cancel, &config, &shared.state).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(sid = %shared.profile.sid, error = %e, "scan failed, will retry next poll");
            *shared.last_error.write().await = Some(e.to_string());
            return;
        }
    };

    *shared.last_reject_counters.write().await = scan_result.reject_counters;

    let eligibility = EligibilityEngine::new(&shared.remote);
    let mut counters = TickCounters::default();

    for job in &scan_result.candidates {
        let verdict = match eligibility
            .evaluate(cancel, &job.id, &config.auto_download_tag)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(sid = %shared.profile.sid, job_id = %job.id, error = %e, "eligibility check failed, skipping this tick");
                continue;
            }
        };

        if !verdict.should_log {
            counters.filtered += 1;
            continue;
        }

        if !verdict.eligible {
            tracing::info!(
                sid = %shared.profile.sid,
                job_id = %job.id,
                reason = %verdict.reason,
                "SKIP: {} [{}] - {}", job.name, job.id, verdict.reason
            );
            counters.skipped += 1;
            continue;
        }

        tracing::info!(
            sid = %shared.profile.sid,
            job_id = %job.id,
            reason = %verdict.reason,
            "DOWNLOAD: {} [{}] - {}", job.name, job.id, verdict.reason
        );

        match download_executor::download_job(shared, cancel, job, &config, &eligibility).await {
            Ok(outcome) => {
                counters.downloaded += 1;
                shared.jobs_downloaded.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    sid = %shared.profile.sid,
                    job_id = %job.id,
                    "COMPLETED: {} [{}] - {} files, {}",
                    job.name, job.id, outcome.file_count, human_bytes(outcome.total_bytes)
                );
                let _ = shared.events.send(Event::DownloadCompleted {
                    sid: shared.profile.sid.clone(),
                    job_id: job.id.clone(),
                });
            }
            Err(e) => {
                tracing::error!(sid = %shared.profile.sid, job_id = %job.id, error = %e, "download failed, will retry next poll");
                shared.state.mark_failed(&job.id, &job.name, &e.to_string()).await;
            }
        }
    }

    shared.state.update_last_poll().await;
    if let Err(e) = shared.state.save().await {
        tracing::error!(sid = %shared.profile.sid, error = %e, "failed to persist download state");
    }
    *shared.last_scan_time.write().await = shared.state.last_poll().await;
    *shared.last_tick_counters.write().await = counters;
    *shared.last_error.write().await = None;

    let _ = shared.events.send(Event::ScanCompleted {
        sid: shared.profile.sid.clone(),
        candidates: scan_result.candidates.len(),
        downloaded: counters.downloaded as usize,
    });

    tracing::info!(
        sid = %shared.profile.sid,
        total_scanned = scan_result.total_scanned,
        downloaded = counters.downloaded,
        skipped = counters.skipped,
        filtered = counters.filtered,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "scan tick summary"
    );
}

/// Human-readable byte count, e.g. `12.0 MB`, matching the summary log's
/// `COMPLETED: ... - N files, human-bytes` format.
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit_index = 0;
    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }
    format!("{:.1} {}", value, UNITS[unit_index])
}
