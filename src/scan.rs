//! Lists candidate jobs for one daemon's scan tick: creation-cutoff
//! pagination, status/name/lookback filtering, and per-tick reject counters
//! for operator diagnosis.

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::remote::{PaginationOptions, RemoteClient};
use crate::state_store::DownloadStateStore;
use crate::types::Job;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

/// Completion-time lookback carries a 30-day buffer on top of the
/// configured window, because lookback is semantically about *completion*
/// time but the remote's efficient ordering is by *creation* time.
const CREATION_CUTOFF_BUFFER_DAYS: i64 = 30;

/// Per-tick counts of why jobs were rejected, surfaced via `GetStatus` for
/// "why isn't anything downloading" diagnosis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectCounters {
    /// Status was not `"Completed"`
    pub not_completed: u64,
    /// Already recorded as downloaded in local state
    pub already_downloaded: u64,
    /// Creation date older than the creation cutoff
    pub too_old: u64,
    /// Rejected by name filters
    pub filtered_by_name: u64,
    /// Rejected by the completion-time lookback window
    pub outside_lookback: u64,
}

impl RejectCounters {
    /// Total jobs rejected across every reason.
    pub fn total(&self) -> u64 {
        self.not_completed
            + self.already_downloaded
            + self.too_old
            + self.filtered_by_name
            + self.outside_lookback
    }
}

/// Result of one scan tick's candidate search.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Jobs that passed every filter, ready for the eligibility engine
    pub candidates: Vec<Job>,
    /// Total jobs the remote returned for this tick, before filtering
    pub total_scanned: usize,
    /// Why the non-candidates were rejected
    pub reject_counters: RejectCounters,
}

/// Produces the candidate set for one daemon's scan tick.
pub struct ScanMonitor<'a> {
    remote: &'a RemoteClient,
}

impl<'a> ScanMonitor<'a> {
    /// Build a monitor backed by `remote`.
    pub fn new(remote: &'a RemoteClient) -> Self {
        Self { remote }
    }

    /// Run the scan pipeline: list jobs newest-first with an early
    /// termination cutoff, then filter by status, local state,
    /// completion-date lookback, and name filters.
    pub async fn scan(
        &self,
        cancel: &CancellationToken,
        config: &DaemonConfig,
        state: &DownloadStateStore,
    ) -> Result<ScanResult> {
        let now = Utc::now();
        let creation_cutoff =
            now - ChronoDuration::days(i64::from(config.lookback_days) + CREATION_CUTOFF_BUFFER_DAYS);
        let lookback_cutoff = now - ChronoDuration::days(i64::from(config.lookback_days));

        let page = self
            .remote
            .list_jobs(cancel, PaginationOptions::newest_first_until(creation_cutoff))
            .await?;

        let mut result = ScanResult {
            total_scanned: page.items.len(),
            ..Default::default()
        };

        for job in page.items {
            if !job.is_completed() {
                result.reject_counters.not_completed += 1;
                continue;
            }
            if state.is_downloaded(&job.id).await {
                result.reject_counters.already_downloaded += 1;
                continue;
            }
            if job.date_inserted < creation_cutoff {
                result.reject_counters.too_old += 1;
                continue;
            }
            if let Some(filters) = &config.filters {
                if !filters.matches(&job.name) {
                    result.reject_counters.filtered_by_name += 1;
                    continue;
                }
            }

            let completed_at = self.resolve_completion_time(cancel, &job).await;
            if completed_at < lookback_cutoff {
                result.reject_counters.outside_lookback += 1;
                continue;
            }

            result.candidates.push(job);
        }

        Ok(result)
    }

    /// Fetch status history and find the `"Completed"` entry's timestamp,
    /// falling back to the job's creation time if history is unavailable or
    /// the completion entry can't be found/parsed.
    async fn resolve_completion_time(&self, cancel: &CancellationToken, job: &Job) -> DateTime<Utc> {
        if let Some(completed) = job.date_completed {
            return completed;
        }

        match self.remote.get_job_statuses(cancel, &job.id).await {
            Ok(history) => history
                .iter()
                .find(|entry| entry.status.eq_ignore_ascii_case("completed"))
                .and_then(|entry| parse_server_timestamp(&entry.timestamp))
                .unwrap_or(job.date_inserted),
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "could not fetch status history, falling back to creation time");
                job.date_inserted
            }
        }
    }
}

/// Parse a server timestamp accepting both RFC3339 and a microsecond-
/// precision variant (`%Y-%m-%dT%H:%M:%S%.6f`), as the remote's status
/// history uses either depending on endpoint version.
fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_timestamp() {
        let ts = parse_server_timestamp("2026-01-15T10:30:00Z");
        assert!(ts.is_some());
    }

    #[test]
    fn parses_microsecond_precision_variant() {
        let ts = parse_server_timestamp("2026-01-15T10:30:00.123456");
        assert!(ts.is_some());
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_server_timestamp("not-a-timestamp").is_none());
    }

    #[test]
    fn reject_counters_total_sums_all_reasons() {
        let counters = RejectCounters {
            not_completed: 1,
            already_downloaded: 2,
            too_old: 3,
            filtered_by_name: 4,
            outside_lookback: 5,
        };
        assert_eq!(counters.total(), 15);
    }
}
