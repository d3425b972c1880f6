//! Cursor pagination with early-termination.
//!
//! The remote's pagination is cursor-based: each page carries a `next` URL.
//! When a creation cutoff is configured and pages are requested newest-first
//! (used by the scan monitor), the loop in [`super::RemoteClient::list_jobs`]
//! stops as soon as every item on a page is older than the cutoff — the last
//! such page is still kept so the caller can apply its own completion-time
//! filter. The client never silently drops records.

use chrono::{DateTime, Utc};

/// Options controlling one paginated fetch.
#[derive(Clone, Copy, Debug, Default)]
pub struct PaginationOptions {
    /// Request pages ordered newest-first (required for `cutoff` to have
    /// any early-termination effect)
    pub newest_first: bool,
    /// Stop once a full page is older than this timestamp
    pub cutoff: Option<DateTime<Utc>>,
}

impl PaginationOptions {
    /// No cutoff, natural server ordering.
    pub fn none() -> Self {
        Self::default()
    }

    /// Newest-first ordering with an early-termination cutoff, used by the
    /// scan monitor's creation-date cutoff.
    pub fn newest_first_until(cutoff: DateTime<Utc>) -> Self {
        Self {
            newest_first: true,
            cutoff: Some(cutoff),
        }
    }
}

/// The concatenated result of a paginated fetch.
#[derive(Clone, Debug)]
pub struct Page<T> {
    /// All items returned across every fetched page
    pub items: Vec<T>,
    /// Number of pages actually fetched
    pub pages_fetched: u32,
}

/// Lets the pagination loop inspect an item's creation time without the
/// remote client needing a type-specific field name.
pub trait CreatedAt {
    /// This item's creation timestamp, used for early-termination only.
    fn created_at(&self) -> DateTime<Utc>;
}

impl CreatedAt for crate::types::Job {
    fn created_at(&self) -> DateTime<Utc> {
        self.date_inserted
    }
}

impl CreatedAt for crate::types::RemoteFile {
    fn created_at(&self) -> DateTime<Utc> {
        // Files are never paginated with a cutoff; this is never consulted.
        DateTime::<Utc>::MAX_UTC
    }
}

impl CreatedAt for crate::types::JobStatusEntry {
    fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::MAX_UTC
    }
}

impl CreatedAt for serde_json::Value {
    fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::MAX_UTC
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Job;
    use chrono::TimeZone;

    fn job_at(days_ago: i64) -> Job {
        Job {
            id: "j".into(),
            name: "n".into(),
            status: "Completed".into(),
            owner: "o".into(),
            date_inserted: Utc::now() - chrono::Duration::days(days_ago),
            date_completed: None,
        }
    }

    #[test]
    fn created_at_matches_date_inserted() {
        let job = job_at(3);
        assert_eq!(job.created_at(), job.date_inserted);
    }

    #[test]
    fn pagination_options_none_has_no_cutoff() {
        let options = PaginationOptions::none();
        assert!(!options.newest_first);
        assert!(options.cutoff.is_none());
    }

    #[test]
    fn pagination_options_newest_first_until_sets_cutoff() {
        let cutoff = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let options = PaginationOptions::newest_first_until(cutoff);
        assert!(options.newest_first);
        assert_eq!(options.cutoff, Some(cutoff));
    }
}
