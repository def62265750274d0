//! Dataset acquisition from the OpenReview API v2.
//!
//! [`OpenReviewPager`] pages through a venue's submissions with their direct
//! replies attached; [`collect_records`] turns those notes into
//! [`HistoricalRecord`]s. Extraction is best-effort: submissions without a
//! final decision or without any parseable review score are counted and
//! dropped.

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use review_odds_core::{HistoricalRecord, ReviewOddsError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api2.openreview.net";
pub const DEFAULT_YEAR: i32 = 2025;
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const UNKNOWN_TITLE: &str = "Unknown Title";
const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FetchConfig {
    pub base_url: String,
    pub year: i32,
    pub venue_id: Option<String>,
    pub page_size: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            year: DEFAULT_YEAR,
            venue_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl FetchConfig {
    #[must_use]
    pub fn venue_id(&self) -> String {
        self.venue_id
            .clone()
            .unwrap_or_else(|| format!("ICLR.cc/{}/Conference", self.year))
    }

    #[must_use]
    pub fn submission_invitation(&self) -> String {
        format!("{}/-/Submission", self.venue_id())
    }

    pub fn validate(&self) -> Result<(), ReviewOddsError> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(ReviewOddsError::Configuration(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.venue_id.as_deref().is_some_and(|venue| venue.trim().is_empty()) {
            return Err(ReviewOddsError::Configuration(
                "venue_id must not be blank".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(ReviewOddsError::Configuration(
                "page_size must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ReviewOddsError::Configuration(
                "timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ReviewOddsError::Configuration(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub content: BTreeMap<String, Value>,
    #[serde(default)]
    pub details: Option<NoteDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct NoteDetails {
    #[serde(default, rename = "directReplies")]
    pub direct_replies: Vec<Reply>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default)]
    pub invitations: Vec<String>,
    #[serde(default)]
    pub content: BTreeMap<String, Value>,
}

impl Note {
    fn replies(&self) -> &[Reply] {
        self.details
            .as_ref()
            .map(|details| details.direct_replies.as_slice())
            .unwrap_or_default()
    }

    fn title(&self) -> String {
        field_value(&self.content, "title")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_TITLE)
            .to_string()
    }
}

impl Reply {
    #[must_use]
    pub fn is_decision(&self) -> bool {
        self.invitations.iter().any(|invitation| {
            invitation.contains("Decision")
                && !invitation.contains("Desk_Reject")
                && !invitation.contains("Withdrawn")
        })
    }

    #[must_use]
    pub fn is_review(&self) -> bool {
        self.invitations
            .iter()
            .any(|invitation| invitation.contains("Official_Review"))
    }

    #[must_use]
    pub fn decision(&self) -> Option<&str> {
        field_value(&self.content, "decision").and_then(Value::as_str)
    }

    /// `rating`, falling back to `recommendation`.
    #[must_use]
    pub fn score(&self) -> Option<f64> {
        field_value(&self.content, "rating")
            .or_else(|| field_value(&self.content, "recommendation"))
            .and_then(parse_score_value)
    }
}

#[derive(Debug, Deserialize)]
struct NotesPage {
    #[serde(default)]
    notes: Vec<Note>,
}

/// One page of submissions for an invitation.
pub trait NotePager {
    fn page(&self, invitation: &str, offset: usize, limit: usize) -> Result<Vec<Note>>;
}

pub struct OpenReviewPager {
    agent: ureq::Agent,
    base_url: String,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl OpenReviewPager {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        config.validate()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();

        Ok(Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
        })
    }

    fn request_page(&self, invitation: &str, offset: usize, limit: usize) -> AttemptResult<Vec<Note>> {
        let url = format!("{}/notes", self.base_url);
        let response = self
            .agent
            .get(&url)
            .query("invitation", invitation)
            .query("details", "directReplies")
            .query("offset", &offset.to_string())
            .query("limit", &limit.to_string())
            .call();

        match response {
            Ok(response) => response
                .into_json::<NotesPage>()
                .map(|page| page.notes)
                .map_err(|err| Attempt::Fatal(anyhow!("malformed notes page from {url}: {err}"))),
            Err(ureq::Error::Status(code, _)) if should_retry(Some(code)) => {
                Err(Attempt::Retryable(anyhow!("http status {code} from {url}")))
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(Attempt::Fatal(anyhow!("http status {code} from {url}")))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(Attempt::Retryable(anyhow!("http transport failure: {err}")))
            }
        }
    }
}

impl NotePager for OpenReviewPager {
    fn page(&self, invitation: &str, offset: usize, limit: usize) -> Result<Vec<Note>> {
        retry_with_backoff(self.max_retries, self.backoff_base_ms, std::thread::sleep, || {
            self.request_page(invitation, offset, limit)
        })
        .with_context(|| format!("failed to fetch notes for {invitation} at offset {offset}"))
    }
}

/// Outcome of one request attempt.
#[derive(Debug)]
pub enum Attempt {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

pub type AttemptResult<T> = std::result::Result<T, Attempt>;

/// Transport failures (`None`), 429 and 5xx are worth retrying.
#[must_use]
pub fn should_retry(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(code) => code == 429 || (500..600).contains(&code),
    }
}

/// `base_ms * 2^attempt`, saturating.
#[must_use]
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

pub fn retry_with_backoff<T>(
    max_retries: u32,
    backoff_base_ms: u64,
    mut sleep: impl FnMut(Duration),
    mut attempt: impl FnMut() -> AttemptResult<T>,
) -> Result<T> {
    let mut retries = 0_u32;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(err),
            Err(Attempt::Retryable(err)) if retries >= max_retries => {
                return Err(err.context(format!("giving up after {retries} retries")));
            }
            Err(Attempt::Retryable(err)) => {
                let delay = backoff_delay(backoff_base_ms, retries);
                warn!(error = %err, retry = retries + 1, delay = ?delay, "retrying request");
                sleep(delay);
                retries += 1;
            }
        }
    }
}

/// Walks pages until one comes back shorter than `page_size`.
pub fn fetch_all(pager: &dyn NotePager, invitation: &str, page_size: usize) -> Result<Vec<Note>> {
    if page_size == 0 {
        return Err(ReviewOddsError::Configuration("page_size must be at least 1".to_string()).into());
    }

    let mut notes = Vec::new();
    let mut offset = 0_usize;
    loop {
        let page = pager.page(invitation, offset, page_size)?;
        let received = page.len();
        debug!(invitation, offset, received, "fetched notes page");
        notes.extend(page);

        if received < page_size {
            break;
        }
        offset += received;
    }

    info!(invitation, submissions = notes.len(), "fetched submissions");
    Ok(notes)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Record(HistoricalRecord),
    /// No final decision: pending, withdrawn or desk rejected.
    Pending,
    Unscored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub decisions_found: usize,
    pub scores_parsed: usize,
    pub outcome: ExtractionOutcome,
}

#[must_use]
pub fn extract_record(note: &Note, year: i32) -> Extraction {
    let mut decision = None;
    let mut decisions_found = 0;
    let mut scores = Vec::new();

    for reply in note.replies() {
        if reply.is_decision() {
            if let Some(value) = reply.decision() {
                decision = Some(value.to_string());
                decisions_found += 1;
            }
        }
        if reply.is_review() {
            if let Some(score) = reply.score() {
                scores.push(score);
            }
        }
    }

    let scores_parsed = scores.len();
    let outcome = match decision {
        None => ExtractionOutcome::Pending,
        Some(_) if scores.is_empty() => ExtractionOutcome::Unscored,
        Some(raw_decision) => {
            match HistoricalRecord::from_review(note.id.clone(), note.title(), Some(year), scores, raw_decision) {
                Ok(record) => ExtractionOutcome::Record(record),
                Err(err) => {
                    warn!(id = %note.id, error = %err, "dropping submission");
                    ExtractionOutcome::Unscored
                }
            }
        }
    };

    Extraction {
        decisions_found,
        scores_parsed,
        outcome,
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FetchReport {
    pub submissions_seen: usize,
    pub decisions_found: usize,
    pub scores_parsed: usize,
    pub records_kept: usize,
    pub skipped_pending: usize,
    pub skipped_unscored: usize,
    #[serde(skip)]
    pub records: Vec<HistoricalRecord>,
}

#[must_use]
pub fn collect_records(notes: &[Note], year: i32) -> FetchReport {
    let mut report = FetchReport::default();
    for note in notes {
        report.submissions_seen += 1;
        let extraction = extract_record(note, year);
        report.decisions_found += extraction.decisions_found;
        report.scores_parsed += extraction.scores_parsed;

        match extraction.outcome {
            ExtractionOutcome::Record(record) => report.records.push(record),
            ExtractionOutcome::Pending => report.skipped_pending += 1,
            ExtractionOutcome::Unscored => report.skipped_unscored += 1,
        }
    }
    report.records_kept = report.records.len();

    info!(
        submissions = report.submissions_seen,
        decisions = report.decisions_found,
        scores = report.scores_parsed,
        kept = report.records_kept,
        "extracted records"
    );
    report
}

/// Fetches every submission of the configured venue and extracts records.
pub fn fetch_venue(pager: &dyn NotePager, config: &FetchConfig) -> Result<FetchReport> {
    config.validate()?;
    let notes = fetch_all(pager, &config.submission_invitation(), config.page_size)?;
    Ok(collect_records(&notes, config.year))
}

fn field_value<'a>(content: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a Value> {
    content.get(key).and_then(|field| field.get("value"))
}

/// Accepts a bare number or a string like `"8: accept, good paper"`.
fn parse_score_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|score| score.is_finite()),
        Value::String(text) => text
            .split(':')
            .next()
            .and_then(|head| head.trim().parse::<i64>().ok())
            .and_then(|score| i32::try_from(score).ok())
            .map(f64::from),
        _ => None,
    }
}
