//! Command surface for the profile frecency cache.
//!
//! Hosts embed the cache through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`init_logging`] to route `tracing` events to stderr, filtered by `PFR_LOG`.
//!
//! `rank`, `select` and `record` never fail because of the cache itself: an
//! unreadable store degrades to alphabetical ordering.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use profile_frecency_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, rank_candidates, record_selection,
    FrecencyRuleset, UsageLedger, DEFAULT_STORE_KEY,
};
use profile_frecency_store_sqlite::SqliteFrecencyStore;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "PFR_LOG";

#[derive(Debug, Parser)]
#[command(name = "pfr")]
#[command(about = "Profile frecency ranking CLI")]
pub struct Cli {
    #[arg(long, default_value = "./profile_frecency.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_STORE_KEY)]
    store_key: String,

    /// JSON file overriding the default scoring ruleset.
    #[arg(long)]
    ruleset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print candidates with frecent entries first.
    Rank(RankArgs),
    /// Rank candidates, then record the chosen one.
    Select(SelectArgs),
    /// Record a use without ranking.
    Record(RecordArgs),
    /// List stored usage records.
    Show(ShowArgs),
    /// Delete usage records.
    Forget(ForgetArgs),
}

#[derive(Debug, Args)]
pub struct RankArgs {
    #[arg(long = "candidate")]
    candidates: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SelectArgs {
    #[arg(long = "candidate")]
    candidates: Vec<String>,
    #[arg(long)]
    choice: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    identifier: String,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ForgetArgs {
    #[arg(required = true)]
    identifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RankPayload {
    pub contract_version: &'static str,
    pub store_key: String,
    pub ranked: Vec<String>,
    pub stale: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordView {
    pub identifier: String,
    pub use_count: u32,
    pub first_used_at: String,
    pub last_used_at: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordsPayload {
    pub contract_version: &'static str,
    pub store_key: String,
    pub as_of: String,
    pub records: Vec<RecordView>,
}

/// Installs a stderr `tracing` subscriber filtered by `PFR_LOG` (default
/// `warn`). Calling it more than once is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Executes the parsed CLI command.
///
/// # Errors
/// Returns an error for invalid arguments, and for `show`/`forget` when the
/// ruleset or the store cannot be read or written.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Rank(args) => {
            let ruleset = load_ruleset_or_default(cli.ruleset.as_deref());
            let store = SqliteFrecencyStore::load_or_empty(&cli.db, &cli.store_key, ruleset);
            let candidates = dedupe_candidates(args.candidates);
            let (update, ranked) = rank_candidates(store, &candidates);
            let payload = build_rank_payload(&cli.store_key, ranked, update.stale());
            print_ranked(&payload, args.json)
        }
        Command::Select(args) => {
            let ruleset = load_ruleset_or_default(cli.ruleset.as_deref());
            let store = SqliteFrecencyStore::load_or_empty(&cli.db, &cli.store_key, ruleset);
            let candidates = dedupe_candidates(args.candidates);
            let (update, ranked) = rank_candidates(store, &candidates);
            if !ranked.iter().any(|candidate| *candidate == args.choice) {
                return Err(anyhow!(
                    "choice {:?} is not one of the candidates",
                    args.choice
                ));
            }

            let payload = build_rank_payload(&cli.store_key, ranked, update.stale());
            let handle = update.apply_in_background(args.choice);
            print_ranked(&payload, args.json)?;

            if handle.join().is_err() {
                debug!("frecency update thread panicked");
            }
            Ok(())
        }
        Command::Record(args) => {
            let ruleset = load_ruleset_or_default(cli.ruleset.as_deref());
            let mut store = SqliteFrecencyStore::load_or_empty(&cli.db, &cli.store_key, ruleset);
            record_selection(&mut store, &args.identifier);
            Ok(())
        }
        Command::Show(args) => {
            let ruleset = load_ruleset(cli.ruleset.as_deref())?;
            let store = SqliteFrecencyStore::load(&cli.db, &cli.store_key, ruleset)?;
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            let payload = build_records_payload(&store, as_of)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_records_table(&payload);
            }
            Ok(())
        }
        Command::Forget(args) => {
            let ruleset = load_ruleset(cli.ruleset.as_deref())?;
            let mut store = SqliteFrecencyStore::load(&cli.db, &cli.store_key, ruleset)?;
            let targets: BTreeSet<String> = args.identifiers.into_iter().collect();
            store
                .delete_all(&targets)
                .context("failed to delete frecency records")?;
            Ok(())
        }
    }
}

fn load_ruleset(path: Option<&Path>) -> Result<FrecencyRuleset> {
    let Some(path) = path else {
        return Ok(FrecencyRuleset::v1());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ruleset file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("ruleset file must be valid JSON: {}", path.display()))?;
    FrecencyRuleset::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
}

/// Best-effort variant of [`load_ruleset`] for the commands that must not fail.
fn load_ruleset_or_default(path: Option<&Path>) -> FrecencyRuleset {
    match load_ruleset(path) {
        Ok(ruleset) => ruleset,
        Err(err) => {
            debug!(
                error = %format!("{err:#}"),
                "ruleset unavailable, falling back to v1 defaults"
            );
            FrecencyRuleset::v1()
        }
    }
}

/// Drops repeated identifiers, keeping the first occurrence.
fn dedupe_candidates(candidates: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.clone()))
        .collect()
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn build_rank_payload<'a>(
    store_key: &str,
    ranked: Vec<String>,
    stale: impl IntoIterator<Item = &'a String>,
) -> RankPayload {
    RankPayload {
        contract_version: "rank.v1",
        store_key: store_key.to_string(),
        ranked,
        stale: stale.into_iter().cloned().collect(),
    }
}

fn build_records_payload(
    store: &SqliteFrecencyStore,
    as_of: OffsetDateTime,
) -> Result<RecordsPayload> {
    let ruleset = store.ruleset();
    let records = store
        .records()
        .iter()
        .map(|record| -> Result<RecordView> {
            Ok(RecordView {
                identifier: record.identifier.clone(),
                use_count: record.use_count,
                first_used_at: format_rfc3339(record.first_used_at)
                    .map_err(|err| anyhow!(err.to_string()))?,
                last_used_at: format_rfc3339(record.last_used_at)
                    .map_err(|err| anyhow!(err.to_string()))?,
                score: ruleset.score_at(record, as_of),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordsPayload {
        contract_version: "records.v1",
        store_key: store.store_key().to_string(),
        as_of: format_rfc3339(as_of).map_err(|err| anyhow!(err.to_string()))?,
        records,
    })
}

fn print_ranked(payload: &RankPayload, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
    } else {
        for identifier in &payload.ranked {
            println!("{identifier}");
        }
    }
    Ok(())
}

fn print_records_table(payload: &RecordsPayload) {
    println!("store_key: {} as_of: {}", payload.store_key, payload.as_of);
    println!(
        "{:<32} {:<6} {:<10} last_used_at",
        "identifier", "uses", "score"
    );
    println!("{}", "-".repeat(80));

    for record in &payload.records {
        println!(
            "{:<32} {:<6} {:<10.4} {}",
            record.identifier, record.use_count, record.score, record.last_used_at
        );
    }
}
