//! Deterministic "best item" selection, shared by asset resolution and stack
//! generation. The ordering must be total: regeneration output is only
//! reproducible if ties always break the same way.

use crate::catalog::MediaRecord;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub media_id: String,
    pub resolution: u64,
    pub capture_timestamp: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn from_record(record: &MediaRecord) -> Self {
        Self {
            media_id: record.id.clone(),
            resolution: record.resolution(),
            capture_timestamp: record.capture_timestamp,
        }
    }

    /// Fallback for media the catalog no longer knows about; loses every
    /// tie-break except the media id, which keeps the ordering total.
    pub fn unknown(media_id: &str) -> Self {
        Self {
            media_id: media_id.to_string(),
            resolution: 0,
            capture_timestamp: None,
        }
    }
}

/// Higher resolution first, then earlier capture timestamp (known beats
/// unknown), then lower media id.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.resolution
        .cmp(&a.resolution)
        .then_with(|| match (&a.capture_timestamp, &b.capture_timestamp) {
            (Some(ta), Some(tb)) => ta.cmp(tb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.media_id.cmp(&b.media_id))
}

pub fn select_representative<'a>(candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    candidates.iter().min_by(|a, b| compare(a, b))
}

/// Candidates in representative order: index 0 is the representative, so the
/// index doubles as the member rank.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare);
    candidates
}
