//! Embeddable command surface for the `review-odds` binary.
//!
//! Hosts can drive the tool through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for a single [`Command`] against an existing [`Session`].
//!
//! Data commands never fail because the dataset is missing or empty; they print
//! a `no_data.v1` notice instead so scripted callers can branch on it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use review_odds_core::{
    analyze, format_score_list, histogram, trend, Analysis, DatasetSummary, HistogramBucket,
    HistoricalRecord, MatchConfig, MatchMode, MatchResult, Outlook, ReviewOddsError,
    ScoreSignature, TrendPoint, UserQuery,
};
use review_odds_fetch::{
    fetch_venue, FetchConfig, FetchReport, NotePager, OpenReviewPager, DEFAULT_BACKOFF_BASE_MS,
    DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
    DEFAULT_PAGE_SIZE, DEFAULT_YEAR,
};
use review_odds_store::{write_csv, DatasetCache, ImportReport, LoadReport, SqliteRecordArchive};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_DATASET: &str = "./iclr_2025_real_data.csv";
pub const LOG_ENV: &str = "REVIEW_ODDS_LOG";

static INIT_TRACING: Once = Once::new();

/// Installs the stderr log subscriber, filtered by `REVIEW_ODDS_LOG`.
/// Stdout is reserved for command output.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
            EnvFilter::new("review_odds_cli=info,review_odds_store=info,review_odds_fetch=info")
        });

        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    });
}

#[derive(Debug, Parser)]
#[command(name = "review-odds")]
#[command(about = "Acceptance odds from historical peer-review scores")]
pub struct Cli {
    /// Dataset CSV, or a `SQLite` archive (.sqlite3/.sqlite/.db).
    #[arg(long, global = true, default_value = DEFAULT_DATASET)]
    dataset: PathBuf,

    /// JSON file with `mean_window` and `trend_min_samples`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Estimate acceptance odds for a set of review scores.
    Estimate(EstimateArgs),
    /// Count records per (mean score, status).
    Histogram(JsonArgs),
    /// Accept fraction per mean score.
    Trend(TrendArgs),
    /// Dataset totals.
    Summary(JsonArgs),
    /// Copy the dataset into a `SQLite` archive.
    Import(ImportArgs),
    /// Download a venue's decided submissions from OpenReview.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EstimateArgs {
    /// Comma separated, e.g. "8, 6, 6, 3".
    #[arg(long)]
    scores: String,
    #[arg(long)]
    window: Option<f64>,
    /// Minimum samples per trend point shown alongside the estimate.
    #[arg(long)]
    min_samples: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TrendArgs {
    #[arg(long)]
    min_samples: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    into: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[arg(long, default_value_t = DEFAULT_YEAR)]
    year: i32,
    /// Defaults to `iclr_<year>_real_data.csv`.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,
    #[arg(long)]
    venue_id: Option<String>,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// Per-request timeout.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,
    /// Retries after a transient failure (timeouts, 429, 5xx).
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    backoff_base_ms: u64,
    #[arg(long)]
    json: bool,
}

impl FetchArgs {
    fn to_config(&self) -> FetchConfig {
        FetchConfig {
            base_url: self.base_url.clone(),
            year: self.year,
            venue_id: self.venue_id.clone(),
            page_size: self.page_size,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }
}

/// Per-process state: the dataset location, the validated match config and
/// the memoized dataset load.
#[derive(Debug)]
pub struct Session {
    dataset: PathBuf,
    config: MatchConfig,
    cache: DatasetCache,
}

enum DatasetState {
    Ready(Arc<LoadReport>),
    NoData(String),
}

impl Session {
    pub fn new(dataset: impl Into<PathBuf>, config: MatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dataset: dataset.into(),
            config,
            cache: DatasetCache::new(),
        })
    }

    #[must_use]
    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    #[must_use]
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    fn load(&self) -> Result<DatasetState> {
        match self.cache.get_or_load(&self.dataset) {
            Ok(report) if report.store.is_empty() => {
                Ok(DatasetState::NoData("dataset contains no records".to_string()))
            }
            Ok(report) => Ok(DatasetState::Ready(report)),
            Err(err) => match err.downcast_ref::<ReviewOddsError>() {
                Some(ReviewOddsError::DataUnavailable(reason)) => {
                    warn!(dataset = %self.dataset.display(), %reason, "dataset unavailable");
                    Ok(DatasetState::NoData(reason.clone()))
                }
                _ => Err(err),
            },
        }
    }
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the config file is invalid, the user's scores do not
/// parse, or a storage or network operation fails. A missing or empty dataset
/// is reported on stdout instead.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_match_config(cli.config.as_deref())?;
    let session = Session::new(cli.dataset, config)?;
    run_command(cli.command, &session)
}

/// Executes one command against `session`.
///
/// # Errors
/// See [`run_cli`].
pub fn run_command(command: Command, session: &Session) -> Result<()> {
    match command {
        Command::Estimate(args) => run_estimate(&args, session),
        Command::Histogram(args) => run_histogram(&args, session),
        Command::Trend(args) => run_trend(&args, session),
        Command::Summary(args) => run_summary(&args, session),
        Command::Import(args) => run_import(&args, session),
        Command::Fetch(args) => {
            let config = args.to_config();
            let pager = OpenReviewPager::new(&config)?;
            run_fetch(&pager, &config, args.output.as_deref(), args.json)
        }
    }
}

/// Reads `--config`; without one the defaults apply.
///
/// # Errors
/// Returns an error when the file cannot be read, is not JSON, or holds
/// out-of-range values.
pub fn load_match_config(path: Option<&Path>) -> Result<MatchConfig> {
    let Some(path) = path else {
        return Ok(MatchConfig::default());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
        ReviewOddsError::Configuration(format!("config file {} is not JSON: {err}", path.display()))
    })?;
    Ok(MatchConfig::from_json(&value)?)
}

fn run_estimate(args: &EstimateArgs, session: &Session) -> Result<()> {
    let query = UserQuery::parse(&args.scores)?;
    let config = MatchConfig {
        mean_window: args.window.unwrap_or(session.config.mean_window),
        trend_min_samples: args
            .min_samples
            .unwrap_or(session.config.trend_min_samples),
    };
    config.validate()?;

    let report = match session.load()? {
        DatasetState::Ready(report) => report,
        DatasetState::NoData(reason) => return print_no_data(session.dataset(), &reason, args.json),
    };

    let analysis = analyze(&report.store, &query, &config);
    info!(
        exact = analysis.exact.total_count,
        mean_proximity = analysis.mean_proximity.total_count,
        "estimated acceptance odds"
    );

    if args.json {
        let payload = build_estimate_json_payload(&report, analysis, config.trend_min_samples);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_estimate(&report, &query, &analysis, config.trend_min_samples);
    }
    Ok(())
}

fn run_histogram(args: &JsonArgs, session: &Session) -> Result<()> {
    let report = match session.load()? {
        DatasetState::Ready(report) => report,
        DatasetState::NoData(reason) => return print_no_data(session.dataset(), &reason, args.json),
    };

    let buckets = histogram(&report.store);
    if args.json {
        let payload = HistogramJsonPayload {
            contract_version: "histogram.v1".to_string(),
            dataset: report.source.display().to_string(),
            buckets,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_histogram(&buckets, None);
    }
    Ok(())
}

fn run_trend(args: &TrendArgs, session: &Session) -> Result<()> {
    let config = MatchConfig {
        trend_min_samples: args
            .min_samples
            .unwrap_or(session.config.trend_min_samples),
        ..session.config.clone()
    };
    config.validate()?;

    let report = match session.load()? {
        DatasetState::Ready(report) => report,
        DatasetState::NoData(reason) => return print_no_data(session.dataset(), &reason, args.json),
    };

    let points = trend(&report.store, config.trend_min_samples);
    if args.json {
        let payload = TrendJsonPayload {
            contract_version: "trend.v1".to_string(),
            dataset: report.source.display().to_string(),
            min_samples: config.trend_min_samples,
            points,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_trend(config.trend_min_samples, &points, None);
    }
    Ok(())
}

fn run_summary(args: &JsonArgs, session: &Session) -> Result<()> {
    let report = match session.load()? {
        DatasetState::Ready(report) => report,
        DatasetState::NoData(reason) => return print_no_data(session.dataset(), &reason, args.json),
    };

    let payload = SummaryJsonPayload {
        contract_version: "summary.v1".to_string(),
        dataset: report.source.display().to_string(),
        skipped_rows: report.skipped_rows.len(),
        summary: report.store.summary(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_summary(&payload);
    }
    Ok(())
}

fn run_import(args: &ImportArgs, session: &Session) -> Result<()> {
    let report = match session.load()? {
        DatasetState::Ready(report) => report,
        DatasetState::NoData(reason) => return print_no_data(session.dataset(), &reason, args.json),
    };

    let mut archive = SqliteRecordArchive::open(&args.into)?;
    archive.migrate()?;
    let import = archive.import_records(
        report.store.records(),
        &report.source.display().to_string(),
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&import)?);
    } else {
        print_import(&args.into, &import);
    }
    Ok(())
}

/// Fetches a venue through `pager` and writes the extracted records as a
/// dataset CSV. Nothing is written when no record survives extraction.
///
/// # Errors
/// Returns an error when the config is invalid, paging fails, or the output
/// file cannot be written.
pub fn run_fetch(
    pager: &dyn NotePager,
    config: &FetchConfig,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let report = fetch_venue(pager, config)?;
    let output = output.map_or_else(
        || PathBuf::from(format!("iclr_{}_real_data.csv", config.year)),
        Path::to_path_buf,
    );

    let written = if report.records.is_empty() {
        warn!(venue = %config.venue_id(), "no records extracted, nothing written");
        None
    } else {
        write_csv(&output, &report.records)?;
        Some(output.display().to_string())
    };

    let payload = FetchJsonPayload {
        contract_version: "fetch.v1".to_string(),
        venue_id: config.venue_id(),
        year: config.year,
        output: written,
        config: config.clone(),
        report,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_fetch(&payload);
    }
    Ok(())
}

fn print_no_data(dataset: &Path, reason: &str, json: bool) -> Result<()> {
    if json {
        let payload = NoDataJsonPayload {
            contract_version: "no_data.v1".to_string(),
            dataset: dataset.display().to_string(),
            reason: reason.to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("no data: {reason}");
        println!("hint=run `review-odds fetch --year {DEFAULT_YEAR}` to download a dataset");
    }
    Ok(())
}

fn print_estimate(
    report: &LoadReport,
    query: &UserQuery,
    analysis: &Analysis,
    min_samples: usize,
) {
    println!(
        "dataset={} records={} skipped_rows={}",
        report.source.display(),
        report.store.len(),
        report.skipped_rows.len()
    );
    println!(
        "user_mean={:.2} scores={}",
        analysis.user_mean,
        format_score_list(&query.descending())
    );

    println!();
    println!("[exact match] signature={}", analysis.user_signature);
    if analysis.exact.has_matches() {
        print_match_line(&analysis.exact);
        print_record_table(&analysis.exact.matched_records);
    } else {
        println!(
            "no historical paper has exactly these scores; see the mean-proximity estimate below"
        );
    }

    println!();
    println!(
        "[mean proximity] mean={:.2} window={}",
        analysis.user_mean, analysis.mean_window
    );
    print_match_line(&analysis.mean_proximity);

    let marker = UserMarker::locate(analysis);
    println!();
    println!("[histogram] your mean is marked with <-");
    print_histogram(&analysis.histogram, marker.histogram_mean);
    println!();
    println!("[trend]");
    print_trend(
        min_samples,
        &analysis.trend,
        marker.trend_point.map(|point| point.mean_score),
    );
}

fn print_match_line(result: &MatchResult) {
    println!(
        "rate={:.1}% samples={} accepted={} outlook={}",
        result.rate,
        result.total_count,
        result.accepted_count,
        result.outlook().map_or("n/a", Outlook::label)
    );
}

fn print_record_table(records: &[HistoricalRecord]) {
    println!(
        "{:<14} {:<20} {:<7} {:<20} title",
        "id", "scores", "status", "decision"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<14} {:<20} {:<7} {:<20} {}",
            record.id,
            format_score_list(&record.scores),
            record.status,
            record.raw_decision,
            record.title.chars().take(60).collect::<String>()
        );
    }
}

fn marker_suffix(mean_score: f64, marker: Option<f64>) -> &'static str {
    if marker.is_some_and(|value| value.total_cmp(&mean_score).is_eq()) {
        " <-"
    } else {
        ""
    }
}

fn print_histogram(buckets: &[HistogramBucket], marker: Option<f64>) {
    println!("{:<10} {:<7} count", "mean", "status");
    println!("{}", "-".repeat(30));
    for bucket in buckets {
        println!(
            "{:<10} {:<7} {}{}",
            bucket.mean_score,
            bucket.status,
            bucket.count,
            marker_suffix(bucket.mean_score, marker)
        );
    }
}

fn print_trend(min_samples: usize, points: &[TrendPoint], marker: Option<f64>) {
    println!("min_samples={min_samples}");
    println!("{:<10} {:<16} samples", "mean", "accept_fraction");
    println!("{}", "-".repeat(36));
    for point in points {
        println!(
            "{:<10} {:<16.3} {}{}",
            point.mean_score,
            point.accept_fraction,
            point.sample_count,
            marker_suffix(point.mean_score, marker)
        );
    }
}

fn print_summary(payload: &SummaryJsonPayload) {
    let summary = &payload.summary;
    println!(
        "dataset={} records={} skipped_rows={}",
        payload.dataset, summary.total_records, payload.skipped_rows
    );
    println!(
        "accepted={} rejected={} acceptance_rate={:.1}% distinct_signatures={}",
        summary.accepted, summary.rejected, summary.acceptance_rate, summary.distinct_signatures
    );
    let years = summary
        .years
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    println!("years={}", if years.is_empty() { "n/a" } else { years.as_str() });
}

fn print_import(archive: &Path, report: &ImportReport) {
    println!(
        "archive={} import_id={} source={} imported_at={}",
        archive.display(),
        report.import_id,
        report.source,
        report.imported_at
    );
    println!(
        "records={} inserted={} updated={} total_records={}",
        report.record_count, report.inserted, report.updated, report.total_records
    );
}

fn print_fetch(payload: &FetchJsonPayload) {
    let report = &payload.report;
    println!("venue={} year={}", payload.venue_id, payload.year);
    println!(
        "submissions={} decisions={} scores={} kept={} pending={} unscored={}",
        report.submissions_seen,
        report.decisions_found,
        report.scores_parsed,
        report.records_kept,
        report.skipped_pending,
        report.skipped_unscored
    );
    println!("output={}", payload.output.as_deref().unwrap_or("none"));
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MatchJson {
    mode: MatchMode,
    rate: f64,
    total_count: usize,
    accepted_count: usize,
    outlook: Option<Outlook>,
    matched_records: Vec<HistoricalRecord>,
}

impl From<MatchResult> for MatchJson {
    fn from(result: MatchResult) -> Self {
        Self {
            outlook: result.outlook(),
            mode: result.mode,
            rate: result.rate,
            total_count: result.total_count,
            accepted_count: result.accepted_count,
            matched_records: result.matched_records,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EstimateJsonPayload {
    contract_version: String,
    dataset: String,
    records: usize,
    skipped_rows: usize,
    user_scores: Vec<f64>,
    user_mean: f64,
    user_signature: ScoreSignature,
    mean_window: f64,
    exact: MatchJson,
    mean_proximity: MatchJson,
    trend_min_samples: usize,
    histogram: Vec<HistogramBucket>,
    trend: Vec<TrendPoint>,
    user_marker: UserMarker,
}

/// Where the user's mean lands on the two aggregate views: the closest
/// histogram mean and the closest trend point.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct UserMarker {
    mean: f64,
    histogram_mean: Option<f64>,
    trend_point: Option<TrendPoint>,
}

impl UserMarker {
    fn locate(analysis: &Analysis) -> Self {
        let user_mean = analysis.user_mean;
        let histogram_mean = nearest_by_mean(&analysis.histogram, user_mean, |bucket| {
            bucket.mean_score
        })
        .map(|bucket| bucket.mean_score);
        let trend_point =
            nearest_by_mean(&analysis.trend, user_mean, |point| point.mean_score).copied();

        Self {
            mean: user_mean,
            histogram_mean,
            trend_point,
        }
    }
}

/// First item whose mean is closest to `target`; ties keep the lower mean.
fn nearest_by_mean<T>(items: &[T], target: f64, mean_of: impl Fn(&T) -> f64) -> Option<&T> {
    items.iter().fold(None, |best: Option<&T>, item| match best {
        Some(current)
            if (mean_of(current) - target).abs() <= (mean_of(item) - target).abs() =>
        {
            Some(current)
        }
        _ => Some(item),
    })
}

fn build_estimate_json_payload(
    report: &LoadReport,
    analysis: Analysis,
    trend_min_samples: usize,
) -> EstimateJsonPayload {
    let user_marker = UserMarker::locate(&analysis);
    EstimateJsonPayload {
        contract_version: "estimate.v1".to_string(),
        dataset: report.source.display().to_string(),
        records: report.store.len(),
        skipped_rows: report.skipped_rows.len(),
        user_scores: analysis.user_scores,
        user_mean: analysis.user_mean,
        user_signature: analysis.user_signature,
        mean_window: analysis.mean_window,
        exact: analysis.exact.into(),
        mean_proximity: analysis.mean_proximity.into(),
        trend_min_samples,
        histogram: analysis.histogram,
        trend: analysis.trend,
        user_marker,
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HistogramJsonPayload {
    contract_version: String,
    dataset: String,
    buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TrendJsonPayload {
    contract_version: String,
    dataset: String,
    min_samples: usize,
    points: Vec<TrendPoint>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SummaryJsonPayload {
    contract_version: String,
    dataset: String,
    skipped_rows: usize,
    #[serde(flatten)]
    summary: DatasetSummary,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FetchJsonPayload {
    contract_version: String,
    venue_id: String,
    year: i32,
    output: Option<String>,
    config: FetchConfig,
    #[serde(flatten)]
    report: FetchReport,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct NoDataJsonPayload {
    contract_version: String,
    dataset: String,
    reason: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::float_cmp)]

    use super::*;
    use review_odds_core::DEFAULT_MEAN_WINDOW;
    use review_odds_fetch::Note;
    use review_odds_store::{load_csv, load_dataset};
    use serde_json::json;
    use std::fs;
    use ulid::Ulid;

    const FIXTURE: &str = "id,title,year,scores,mean_score,status,raw_decision\n\
        a1,Alpha,2024,\"[8, 6, 6, 3]\",5.75,Accept,Accept (Poster)\n\
        a2,Beta,2024,\"[3, 6, 8, 6]\",5.75,Reject,Reject\n\
        a3,Gamma,2024,\"[6, 6, 6, 3]\",5.25,Reject,Reject\n\
        a4,Delta,2025,\"[6, 6, 5, 6]\",5.75,Accept,Accept (Spotlight)\n";

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
    }

    fn write_fixture(body: &str) -> PathBuf {
        let path = temp_path("review-odds-cli", "csv");
        must(fs::write(&path, body).map_err(Into::into));
        path
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let mut argv = vec!["review-odds"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        run_cli(cli)
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = must(
            Cli::try_parse_from(["review-odds", "summary", "--dataset", "other.csv", "--json"])
                .map_err(Into::into),
        );
        assert_eq!(cli.dataset, PathBuf::from("other.csv"));
        assert!(matches!(cli.command, Command::Summary(JsonArgs { json: true })));

        let cli = must(Cli::try_parse_from(["review-odds", "histogram"]).map_err(Into::into));
        assert_eq!(cli.dataset, PathBuf::from(DEFAULT_DATASET));
        assert!(cli.config.is_none());
    }

    #[test]
    fn estimate_payload_reports_both_match_modes() {
        let path = write_fixture(FIXTURE);
        let report = must(load_csv(&path));
        let query = must(UserQuery::parse("8, 6, 6, 3").map_err(Into::into));
        let analysis = analyze(&report.store, &query, &MatchConfig::default());

        let payload = build_estimate_json_payload(&report, analysis, 6);
        let value = must(serde_json::to_value(&payload).map_err(Into::into));

        assert_eq!(value["contract_version"], json!("estimate.v1"));
        assert_eq!(value["records"], json!(4));
        assert_eq!(value["user_signature"], json!([3.0, 6.0, 6.0, 8.0]));
        assert_eq!(value["mean_window"], json!(DEFAULT_MEAN_WINDOW));
        assert_eq!(value["exact"]["mode"], json!("exact"));
        assert_eq!(value["exact"]["total_count"], json!(2));
        assert_eq!(value["exact"]["accepted_count"], json!(1));
        assert_eq!(value["exact"]["rate"], json!(50.0));
        assert_eq!(value["exact"]["outlook"], json!("good_chance"));
        assert_eq!(value["mean_proximity"]["mode"], json!("mean_proximity"));
        assert_eq!(value["mean_proximity"]["total_count"], json!(3));
        assert_eq!(
            value["exact"]["matched_records"][0]["status"],
            json!("Accept")
        );

        assert_eq!(value["trend_min_samples"], json!(6));
        assert_eq!(
            value["histogram"],
            json!([
                { "mean_score": 5.25, "status": "Reject", "count": 1 },
                { "mean_score": 5.75, "status": "Accept", "count": 2 },
                { "mean_score": 5.75, "status": "Reject", "count": 1 }
            ])
        );
        assert_eq!(value["trend"], json!([]));
        assert_eq!(
            value["user_marker"],
            json!({ "mean": 5.75, "histogram_mean": 5.75, "trend_point": null })
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn estimate_payload_marks_the_nearest_trend_point() {
        let path = write_fixture(FIXTURE);
        let report = must(load_csv(&path));
        let query = must(UserQuery::parse("6, 6, 5, 5").map_err(Into::into));
        let config = MatchConfig {
            trend_min_samples: 1,
            ..MatchConfig::default()
        };
        let analysis = analyze(&report.store, &query, &config);

        let payload = build_estimate_json_payload(&report, analysis, config.trend_min_samples);
        assert_eq!(payload.trend.len(), 2);
        assert_eq!(payload.user_marker.mean, 5.5);
        // 5.25 and 5.75 are equally far from 5.5; the lower mean wins.
        assert_eq!(payload.user_marker.histogram_mean, Some(5.25));
        let point = payload.user_marker.trend_point.map(|point| point.mean_score);
        assert_eq!(point, Some(5.25));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unmatched_estimate_has_zero_rate_and_no_outlook() {
        let path = write_fixture(FIXTURE);
        let report = must(load_csv(&path));
        let query = must(UserQuery::parse("1, 1").map_err(Into::into));
        let analysis = analyze(&report.store, &query, &MatchConfig::default());

        let payload = build_estimate_json_payload(&report, analysis, 6);
        assert_eq!(payload.exact.total_count, 0);
        assert_eq!(payload.exact.rate, 0.0);
        assert_eq!(payload.exact.outlook, None);
        assert!(payload.mean_proximity.matched_records.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn data_commands_succeed_without_a_dataset() {
        let missing = temp_path("review-odds-missing", "csv");
        let missing = missing.display().to_string();
        for args in [
            vec!["estimate", "--scores", "8, 6", "--json"],
            vec!["histogram"],
            vec!["trend", "--json"],
            vec!["summary"],
        ] {
            let mut argv = vec!["--dataset", missing.as_str()];
            argv.extend(args);
            must(execute_cli(&argv));
        }

        let session = must(Session::new(&missing, MatchConfig::default()));
        assert!(matches!(must(session.load()), DatasetState::NoData(_)));
    }

    #[test]
    fn empty_dataset_is_reported_as_no_data() {
        let path = write_fixture("id,title,year,scores,mean_score,status,raw_decision\n");
        let session = must(Session::new(&path, MatchConfig::default()));
        match must(session.load()) {
            DatasetState::NoData(reason) => assert!(reason.contains("no records")),
            DatasetState::Ready(_) => panic!("expected no data"),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn invalid_scores_are_rejected_before_loading() {
        let missing = temp_path("review-odds-missing", "csv");
        let missing = missing.display().to_string();
        let err = match execute_cli(&["--dataset", &missing, "estimate", "--scores", "8, six"]) {
            Ok(()) => panic!("expected invalid input"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ReviewOddsError>(),
            Some(ReviewOddsError::InvalidInput(_))
        ));
    }

    #[test]
    fn window_override_and_config_file_are_validated() {
        let path = write_fixture(FIXTURE);
        let dataset = path.display().to_string();

        let err = match execute_cli(&[
            "--dataset",
            &dataset,
            "estimate",
            "--scores",
            "8, 6",
            "--window=-0.5",
        ]) {
            Ok(()) => panic!("expected negative window to fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ReviewOddsError>(),
            Some(ReviewOddsError::Configuration(_))
        ));

        let config_path = temp_path("review-odds-config", "json");
        must(fs::write(&config_path, r#"{"mean_window": 0.5}"#).map_err(Into::into));
        let config = must(load_match_config(Some(&config_path)));
        assert_eq!(config.mean_window, 0.5);
        assert_eq!(config.trend_min_samples, MatchConfig::default().trend_min_samples);

        must(fs::write(&config_path, r#"{"trend_min_samples": 0}"#).map_err(Into::into));
        assert!(load_match_config(Some(&config_path)).is_err());

        must(fs::write(&config_path, "not json").map_err(Into::into));
        assert!(load_match_config(Some(&config_path)).is_err());

        let _ = fs::remove_file(&config_path);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn import_command_writes_archive_that_loads_back() {
        let path = write_fixture(FIXTURE);
        let archive = temp_path("review-odds-cli-archive", "sqlite3");
        let dataset = path.display().to_string();
        let into = archive.display().to_string();

        must(execute_cli(&["--dataset", &dataset, "import", "--into", &into, "--json"]));
        must(execute_cli(&["--dataset", &dataset, "import", "--into", &into]));

        let from_archive = must(load_dataset(&archive));
        let from_csv = must(load_csv(&path));
        assert_eq!(from_archive.store.records(), from_csv.store.records());

        must(execute_cli(&["--dataset", &into, "summary", "--json"]));

        let _ = fs::remove_file(&archive);
        let _ = fs::remove_file(&path);
    }

    struct FixedPager {
        notes: Vec<Note>,
    }

    impl NotePager for FixedPager {
        fn page(&self, _invitation: &str, offset: usize, limit: usize) -> Result<Vec<Note>> {
            Ok(self.notes.iter().skip(offset).take(limit).cloned().collect())
        }
    }

    fn fetched_note(id: &str, rating: serde_json::Value, decision: Option<&str>) -> Note {
        let mut replies = vec![json!({
            "invitations": [format!("ICLR.cc/2024/Conference/Submission{id}/-/Official_Review")],
            "content": { "rating": { "value": rating } }
        })];
        if let Some(decision) = decision {
            replies.push(json!({
                "invitations": [format!("ICLR.cc/2024/Conference/Submission{id}/-/Decision")],
                "content": { "decision": { "value": decision } }
            }));
        }
        match serde_json::from_value(json!({
            "id": id,
            "content": { "title": { "value": format!("Title {id}") } },
            "details": { "directReplies": replies }
        })) {
            Ok(note) => note,
            Err(err) => panic!("invalid note fixture: {err}"),
        }
    }

    #[test]
    fn fetch_writes_a_loadable_dataset() {
        let pager = FixedPager {
            notes: vec![
                fetched_note("n1", json!("8: accept, good paper"), Some("Accept (Oral)")),
                fetched_note("n2", json!(3), Some("Reject")),
                fetched_note("n3", json!(5), None),
            ],
        };
        let config = FetchConfig {
            year: 2024,
            page_size: 2,
            ..FetchConfig::default()
        };
        let output = temp_path("review-odds-fetched", "csv");

        must(run_fetch(&pager, &config, Some(&output), true));

        let report = must(load_csv(&output));
        assert!(report.skipped_rows.is_empty());
        assert_eq!(report.store.len(), 2);
        assert_eq!(report.store.records()[0].scores, vec![8.0]);
        assert_eq!(report.store.records()[0].year, Some(2024));
        assert!(report.store.records()[0].is_accepted());

        let _ = fs::remove_file(&output);
    }

    #[test]
    fn fetch_without_records_writes_nothing() {
        let pager = FixedPager {
            notes: vec![fetched_note("n1", json!(5), None)],
        };
        let output = temp_path("review-odds-fetched-empty", "csv");
        must(run_fetch(&pager, &FetchConfig::default(), Some(&output), false));
        assert!(!output.exists());
    }

    #[test]
    fn fetch_flags_tune_the_client() {
        let defaults = must(Cli::try_parse_from(["review-odds", "fetch"]).map_err(Into::into));
        let Command::Fetch(args) = defaults.command else {
            panic!("expected fetch command");
        };
        assert_eq!(args.to_config(), FetchConfig::default());

        let tuned = must(
            Cli::try_parse_from([
                "review-odds",
                "fetch",
                "--year",
                "2024",
                "--timeout-ms",
                "1500",
                "--max-retries",
                "0",
                "--backoff-base-ms",
                "50",
            ])
            .map_err(Into::into),
        );
        let Command::Fetch(args) = tuned.command else {
            panic!("expected fetch command");
        };
        let config = args.to_config();
        assert_eq!(config.year, 2024);
        assert_eq!(config.timeout_ms, 1500);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_base_ms, 50);
        assert!(config.validate().is_ok());

        // Rejected before any request is made.
        let err = match execute_cli(&["fetch", "--timeout-ms", "0"]) {
            Ok(()) => panic!("zero timeout must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("timeout_ms"), "err={err}");
        assert!(execute_cli(&["fetch", "--max-retries", "11"]).is_err());
    }

    #[test]
    fn no_data_payload_is_stable_v1() {
        let payload = NoDataJsonPayload {
            contract_version: "no_data.v1".to_string(),
            dataset: "missing.csv".to_string(),
            reason: "dataset contains no records".to_string(),
        };
        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "no_data.v1",
                "dataset": "missing.csv",
                "reason": "dataset contains no records"
            })
        );
    }
}
