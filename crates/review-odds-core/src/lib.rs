//! Historical review-score cohorts and acceptance-rate estimation.
//!
//! A [`RecordStore`] owns an immutable table of [`HistoricalRecord`]s together
//! with a signature index. Queries are pure functions over a store:
//! - [`exact_match`] selects records whose score multiset equals the user's.
//! - [`mean_proximity_match`] selects records whose stored mean falls inside a
//!   window around the user's mean.
//! - [`histogram`] and [`trend`] aggregate the whole table for display.
//! - [`analyze`] bundles all four for a single user query.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub const DEFAULT_MEAN_WINDOW: f64 = 0.15;
pub const DEFAULT_TREND_MIN_SAMPLES: usize = 6;

/// Scores and means are compared in hundredths.
const FIXED_POINT_SCALE: f64 = 100.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReviewOddsError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DecisionStatus {
    #[serde(rename = "Accept")]
    Accepted,
    #[serde(rename = "Reject")]
    Rejected,
}

impl DecisionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "Accept",
            Self::Rejected => "Reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Accept" => Some(Self::Accepted),
            "Reject" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Collapses a raw venue decision ("Accept (Oral)", "Reject", ...) to the
    /// binary outcome.
    #[must_use]
    pub fn from_decision(raw_decision: &str) -> Self {
        if raw_decision.contains("Accept") {
            Self::Accepted
        } else {
            Self::Rejected
        }
    }
}

impl Display for DecisionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical sorted form of a score multiset, in hundredths.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScoreSignature(Vec<i64>);

impl ScoreSignature {
    #[must_use]
    pub fn from_scores(scores: &[f64]) -> Self {
        let mut fixed = scores.iter().copied().map(to_fixed).collect::<Vec<_>>();
        fixed.sort_unstable();
        Self(fixed)
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.0.iter().copied().map(from_fixed).collect()
    }
}

impl Display for ScoreSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_score_list(&self.values()))
    }
}

impl Serialize for ScoreSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.values())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalRecord {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    pub scores: Vec<f64>,
    pub mean_score: f64,
    pub status: DecisionStatus,
    pub raw_decision: String,
}

impl HistoricalRecord {
    /// Builds a record at ingestion time: the mean is computed once and
    /// rounded to two decimals, the status is collapsed from `raw_decision`.
    ///
    /// # Errors
    /// Returns [`ReviewOddsError::Parse`] when `id` is blank or `scores` is
    /// empty or holds a non-finite value.
    pub fn from_review(
        id: impl Into<String>,
        title: impl Into<String>,
        year: Option<i32>,
        scores: Vec<f64>,
        raw_decision: impl Into<String>,
    ) -> Result<Self, ReviewOddsError> {
        let raw_decision = raw_decision.into();
        let Some(mean) = mean(&scores) else {
            return Err(ReviewOddsError::Parse(
                "scores MUST contain at least one value".to_string(),
            ));
        };

        let record = Self {
            id: id.into(),
            title: title.into(),
            year,
            mean_score: round_to_hundredths(mean),
            status: DecisionStatus::from_decision(&raw_decision),
            scores,
            raw_decision,
        };
        record.validate()?;
        Ok(record)
    }

    /// # Errors
    /// Returns [`ReviewOddsError::Parse`] when a field violates the record
    /// schema.
    pub fn validate(&self) -> Result<(), ReviewOddsError> {
        if self.id.trim().is_empty() {
            return Err(ReviewOddsError::Parse("id MUST be provided".to_string()));
        }

        validate_scores(&self.scores).map_err(ReviewOddsError::Parse)?;

        if !self.mean_score.is_finite() {
            return Err(ReviewOddsError::Parse(format!(
                "mean_score MUST be finite for record {}",
                self.id
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn signature(&self) -> ScoreSignature {
        ScoreSignature::from_scores(&self.scores)
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status == DecisionStatus::Accepted
    }
}

/// A user's own review scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserQuery {
    scores: Vec<f64>,
}

impl UserQuery {
    /// # Errors
    /// Returns [`ReviewOddsError::InvalidInput`] for an empty list or a
    /// non-finite score.
    pub fn new(scores: Vec<f64>) -> Result<Self, ReviewOddsError> {
        validate_scores(&scores).map_err(ReviewOddsError::InvalidInput)?;
        Ok(Self { scores })
    }

    /// Parses a comma separated list such as `"8, 6, 6, 3"`. Blank tokens are
    /// ignored; a single bad token rejects the whole input.
    ///
    /// # Errors
    /// Returns [`ReviewOddsError::InvalidInput`] when a token is not a finite
    /// number or no score remains.
    pub fn parse(raw: &str) -> Result<Self, ReviewOddsError> {
        let scores = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token.parse::<f64>().map_err(|_| {
                    ReviewOddsError::InvalidInput(format!("score is not a number: {token}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(scores)
    }

    #[must_use]
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    #[must_use]
    pub fn signature(&self) -> ScoreSignature {
        ScoreSignature::from_scores(&self.scores)
    }

    /// Unrounded arithmetic mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        mean(&self.scores).unwrap_or(0.0)
    }

    #[must_use]
    pub fn descending(&self) -> Vec<f64> {
        let mut sorted = self.scores.clone();
        sorted.sort_by(|lhs, rhs| rhs.total_cmp(lhs));
        sorted
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    MeanProximity,
}

impl MatchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::MeanProximity => "mean_proximity",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Outlook {
    HighChance,
    GoodChance,
    Borderline,
    Risky,
}

impl Outlook {
    #[must_use]
    pub fn from_rate(rate: f64) -> Self {
        if rate >= 80.0 {
            Self::HighChance
        } else if rate >= 50.0 {
            Self::GoodChance
        } else if rate >= 25.0 {
            Self::Borderline
        } else {
            Self::Risky
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::HighChance => "high chance",
            Self::GoodChance => "good chance",
            Self::Borderline => "borderline",
            Self::Risky => "risky",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub mode: MatchMode,
    pub rate: f64,
    pub total_count: usize,
    pub accepted_count: usize,
    pub matched_records: Vec<HistoricalRecord>,
}

impl MatchResult {
    fn from_matches(mode: MatchMode, matched_records: Vec<HistoricalRecord>) -> Self {
        let total_count = matched_records.len();
        let accepted_count = matched_records
            .iter()
            .filter(|record| record.is_accepted())
            .count();

        Self {
            mode,
            rate: acceptance_rate(accepted_count, total_count),
            total_count,
            accepted_count,
            matched_records,
        }
    }

    /// `false` means the rate is a placeholder zero, not an observed 0%.
    #[must_use]
    pub fn has_matches(&self) -> bool {
        self.total_count > 0
    }

    #[must_use]
    pub fn outlook(&self) -> Option<Outlook> {
        self.has_matches().then(|| Outlook::from_rate(self.rate))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HistogramBucket {
    pub mean_score: f64,
    pub status: DecisionStatus,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrendPoint {
    pub mean_score: f64,
    pub accept_fraction: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub total_records: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub acceptance_rate: f64,
    pub distinct_signatures: usize,
    pub years: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MatchConfig {
    pub mean_window: f64,
    pub trend_min_samples: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            mean_window: DEFAULT_MEAN_WINDOW,
            trend_min_samples: DEFAULT_TREND_MIN_SAMPLES,
        }
    }
}

impl MatchConfig {
    /// # Errors
    /// Returns [`ReviewOddsError::Configuration`] when the window is negative
    /// or non-finite, or the trend sample floor is zero.
    pub fn validate(&self) -> Result<(), ReviewOddsError> {
        if !self.mean_window.is_finite() || self.mean_window < 0.0 {
            return Err(ReviewOddsError::Configuration(
                "mean_window MUST be a finite value >= 0.0".to_string(),
            ));
        }

        if self.trend_min_samples == 0 {
            return Err(ReviewOddsError::Configuration(
                "trend_min_samples MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config object. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns [`ReviewOddsError::Configuration`] when decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, ReviewOddsError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ReviewOddsError::Configuration(format!("invalid match config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Immutable historical table plus its signature index.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<HistoricalRecord>,
    signatures: Vec<ScoreSignature>,
    index: BTreeMap<ScoreSignature, Vec<usize>>,
}

impl RecordStore {
    #[must_use]
    pub fn from_records(records: Vec<HistoricalRecord>) -> Self {
        let signatures = records
            .iter()
            .map(HistoricalRecord::signature)
            .collect::<Vec<_>>();

        let mut index: BTreeMap<ScoreSignature, Vec<usize>> = BTreeMap::new();
        for (position, signature) in signatures.iter().enumerate() {
            index.entry(signature.clone()).or_default().push(position);
        }

        Self {
            records,
            signatures,
            index,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[HistoricalRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&HistoricalRecord> {
        self.records.get(position)
    }

    #[must_use]
    pub fn signature_of(&self, position: usize) -> Option<&ScoreSignature> {
        self.signatures.get(position)
    }

    /// Positions of every record with `signature`, ascending.
    #[must_use]
    pub fn indices_for(&self, signature: &ScoreSignature) -> &[usize] {
        self.index.get(signature).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn summary(&self) -> DatasetSummary {
        let accepted = self
            .records
            .iter()
            .filter(|record| record.is_accepted())
            .count();
        let years = self
            .records
            .iter()
            .filter_map(|record| record.year)
            .collect::<BTreeSet<_>>();

        DatasetSummary {
            total_records: self.records.len(),
            accepted,
            rejected: self.records.len() - accepted,
            acceptance_rate: acceptance_rate(accepted, self.records.len()),
            distinct_signatures: self.index.len(),
            years: years.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Analysis {
    pub user_scores: Vec<f64>,
    pub user_mean: f64,
    pub user_signature: ScoreSignature,
    pub mean_window: f64,
    pub exact: MatchResult,
    pub mean_proximity: MatchResult,
    pub histogram: Vec<HistogramBucket>,
    pub trend: Vec<TrendPoint>,
}

#[must_use]
pub fn exact_match(store: &RecordStore, query: &UserQuery) -> MatchResult {
    let matched = store
        .indices_for(&query.signature())
        .iter()
        .filter_map(|position| store.get(*position))
        .cloned()
        .collect();

    MatchResult::from_matches(MatchMode::Exact, matched)
}

/// Selects records whose stored (pre-rounded) mean lies in
/// `[user_mean - window, user_mean + window]`.
#[must_use]
pub fn mean_proximity_match(store: &RecordStore, query: &UserQuery, window: f64) -> MatchResult {
    let user_mean = query.mean();
    let lower = user_mean - window;
    let upper = user_mean + window;

    let matched = store
        .records()
        .iter()
        .filter(|record| (lower..=upper).contains(&record.mean_score))
        .cloned()
        .collect();

    MatchResult::from_matches(MatchMode::MeanProximity, matched)
}

#[must_use]
pub fn histogram(store: &RecordStore) -> Vec<HistogramBucket> {
    let mut buckets: BTreeMap<(MeanKey, DecisionStatus), usize> = BTreeMap::new();
    for record in store.records() {
        *buckets
            .entry((MeanKey(record.mean_score), record.status))
            .or_default() += 1;
    }

    buckets
        .into_iter()
        .map(|((mean_key, status), count)| HistogramBucket {
            mean_score: mean_key.0,
            status,
            count,
        })
        .collect()
}

/// Accept fraction per distinct mean, keeping only means backed by at least
/// `min_samples` records.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn trend(store: &RecordStore, min_samples: usize) -> Vec<TrendPoint> {
    let mut groups: BTreeMap<MeanKey, (usize, usize)> = BTreeMap::new();
    for record in store.records() {
        let entry = groups.entry(MeanKey(record.mean_score)).or_default();
        entry.0 += 1;
        if record.is_accepted() {
            entry.1 += 1;
        }
    }

    groups
        .into_iter()
        .filter(|(_, (total, _))| *total >= min_samples)
        .map(|(mean_key, (total, accepted))| TrendPoint {
            mean_score: mean_key.0,
            accept_fraction: accepted as f64 / total as f64,
            sample_count: total,
        })
        .collect()
}

#[must_use]
pub fn analyze(store: &RecordStore, query: &UserQuery, config: &MatchConfig) -> Analysis {
    Analysis {
        user_scores: query.scores().to_vec(),
        user_mean: query.mean(),
        user_signature: query.signature(),
        mean_window: config.mean_window,
        exact: exact_match(store, query),
        mean_proximity: mean_proximity_match(store, query, config.mean_window),
        histogram: histogram(store),
        trend: trend(store, config.trend_min_samples),
    }
}

/// `100 * accepted / total`, or `0.0` for an empty selection.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn acceptance_rate(accepted: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * accepted as f64 / total as f64
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Ties go to the even neighbour: `6.125` becomes `6.12`.
#[must_use]
pub fn round_to_hundredths(value: f64) -> f64 {
    (value * FIXED_POINT_SCALE).round_ties_even() / FIXED_POINT_SCALE
}

/// Renders scores the way the dataset file stores them: `[8, 6, 5.5]`.
#[must_use]
pub fn format_score_list(scores: &[f64]) -> String {
    let body = scores
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{body}]")
}

/// Parses the dataset's textual score list, e.g. `"[8, 6, 5]"`.
///
/// # Errors
/// Returns [`ReviewOddsError::Parse`] when the text is not a numeric list or
/// the list is empty.
pub fn parse_score_list(raw: &str) -> Result<Vec<f64>, ReviewOddsError> {
    let scores: Vec<f64> = serde_json::from_str(raw.trim())
        .map_err(|err| ReviewOddsError::Parse(format!("malformed score list {raw:?}: {err}")))?;
    validate_scores(&scores).map_err(ReviewOddsError::Parse)?;
    Ok(scores)
}

fn validate_scores(scores: &[f64]) -> Result<(), String> {
    if scores.is_empty() {
        return Err("scores MUST contain at least one value".to_string());
    }
    if let Some(bad) = scores.iter().find(|value| !value.is_finite()) {
        return Err(format!("scores MUST be finite, got {bad}"));
    }
    Ok(())
}

/// Stored mean used as a grouping key, compared exactly.
#[derive(Debug, Clone, Copy)]
struct MeanKey(f64);

impl PartialEq for MeanKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for MeanKey {}

impl PartialOrd for MeanKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MeanKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_fixed(value: f64) -> i64 {
    (value * FIXED_POINT_SCALE).round() as i64
}

#[allow(clippy::cast_precision_loss)]
fn from_fixed(value: i64) -> f64 {
    value as f64 / FIXED_POINT_SCALE
}

/// Formats a UTC timestamp as RFC3339.
///
/// # Errors
/// Returns [`ReviewOddsError::Parse`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ReviewOddsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ReviewOddsError::Parse(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
