//! Frecency ranking for a single list of opaque identifiers.
//!
//! The crate is split into three pieces:
//! - [`FrecencyRuleset`] turns a [`UsageRecord`] into a score and a stable ordering.
//! - [`FrecencyState`] is the in-memory record set of one store key.
//! - [`rank_candidates`] merges a ranked store with the live candidate list and
//!   returns a [`PendingUpdate`] that writes the user's choice back.
//!
//! Durable storage lives behind the [`UsageLedger`] trait so the merge step never
//! depends on how records are persisted.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::fmt::Display;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::debug;

/// Store key used for the profile ranking list.
pub const DEFAULT_STORE_KEY: &str = "aws_profiles_frecency";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FrecencyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub identifier: String,
    pub use_count: u32,
    pub first_used_at: OffsetDateTime,
    pub last_used_at: OffsetDateTime,
}

impl UsageRecord {
    #[must_use]
    pub fn first_use(identifier: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            identifier: identifier.into(),
            use_count: 1,
            first_used_at: at,
            last_used_at: at,
        }
    }

    /// Validates a record read back from storage.
    ///
    /// # Errors
    /// Returns [`FrecencyError::Decode`] when counters or timestamps are
    /// inconsistent.
    pub fn validate(&self) -> Result<(), FrecencyError> {
        if self.use_count == 0 {
            return Err(FrecencyError::Decode(format!(
                "use_count MUST be >= 1 for {:?}",
                self.identifier
            )));
        }

        if self.last_used_at < self.first_used_at {
            return Err(FrecencyError::Decode(format!(
                "last_used_at precedes first_used_at for {:?}",
                self.identifier
            )));
        }

        Ok(())
    }

    fn touch(&mut self, at: OffsetDateTime) {
        self.use_count = self.use_count.saturating_add(1);
        // A clock that steps backwards must not make a record look older.
        if at > self.last_used_at {
            self.last_used_at = at;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrecencyRuleset {
    pub ruleset_version: u32,
    pub half_life_days: f64,
    pub frequency_gain: f64,
    pub max_records: usize,
}

impl Default for FrecencyRuleset {
    fn default() -> Self {
        Self::v1()
    }
}

impl FrecencyRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            half_life_days: 14.0,
            frequency_gain: 1.0,
            max_records: 100,
        }
    }

    /// Validates numeric bounds of the ruleset.
    ///
    /// # Errors
    /// Returns [`FrecencyError::Configuration`] when a field is outside its
    /// allowed range.
    pub fn validate(&self) -> Result<(), FrecencyError> {
        if self.ruleset_version == 0 {
            return Err(FrecencyError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if !self.half_life_days.is_finite() || self.half_life_days <= 0.0 {
            return Err(FrecencyError::Configuration(
                "half_life_days MUST be a positive finite number".to_string(),
            ));
        }

        if !self.frequency_gain.is_finite() || self.frequency_gain < 0.0 {
            return Err(FrecencyError::Configuration(
                "frequency_gain MUST be a non-negative finite number".to_string(),
            ));
        }

        if self.max_records == 0 {
            return Err(FrecencyError::Configuration(
                "max_records MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`FrecencyError::Configuration`] when decoding fails or the
    /// decoded values are out of range.
    pub fn from_json(value: &Value) -> Result<Self, FrecencyError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FrecencyError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    #[must_use]
    pub fn frequency_weight(&self, use_count: u32) -> f64 {
        1.0 + self.frequency_gain * f64::from(use_count.max(1)).ln()
    }

    #[must_use]
    pub fn decay_rate_per_day(&self) -> f64 {
        std::f64::consts::LN_2 / self.half_life_days
    }

    /// Score of `record` as seen at `as_of`: frequency weight halved every
    /// `half_life_days` since the last use.
    #[must_use]
    pub fn score_at(&self, record: &UsageRecord, as_of: OffsetDateTime) -> f64 {
        let elapsed = f64::from(days_since(record.last_used_at, as_of));
        self.frequency_weight(record.use_count) * (-self.decay_rate_per_day() * elapsed).exp()
    }

    /// Log-space score anchored at the Unix epoch.
    ///
    /// `rank_key(a) - rank_key(b) == ln(score_at(a, t) / score_at(b, t))` for
    /// every `t`, so sorting by this key matches sorting by score without
    /// depending on the current time.
    #[must_use]
    pub fn rank_key(&self, record: &UsageRecord) -> f64 {
        let anchored_days = (record.last_used_at - OffsetDateTime::UNIX_EPOCH).as_seconds_f64()
            / Duration::DAY.as_seconds_f64();
        self.frequency_weight(record.use_count).ln() + self.decay_rate_per_day() * anchored_days
    }

    /// Descending frecency, then most recent use, then identifier.
    #[must_use]
    pub fn compare(&self, lhs: &UsageRecord, rhs: &UsageRecord) -> Ordering {
        self.rank_key(rhs)
            .total_cmp(&self.rank_key(lhs))
            .then_with(|| rhs.last_used_at.cmp(&lhs.last_used_at))
            .then_with(|| lhs.identifier.cmp(&rhs.identifier))
    }
}

/// In-memory record set for one store key, always kept in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrecencyState {
    store_key: String,
    ruleset: FrecencyRuleset,
    records: Vec<UsageRecord>,
}

impl FrecencyState {
    #[must_use]
    pub fn new(store_key: impl Into<String>, ruleset: FrecencyRuleset) -> Self {
        Self {
            store_key: store_key.into(),
            ruleset,
            records: Vec::new(),
        }
    }

    /// Builds a state from persisted records and sorts them.
    ///
    /// # Errors
    /// Returns [`FrecencyError::Decode`] when a record is invalid or an
    /// identifier appears twice.
    pub fn from_records(
        store_key: impl Into<String>,
        ruleset: FrecencyRuleset,
        records: Vec<UsageRecord>,
    ) -> Result<Self, FrecencyError> {
        let mut identifiers = HashSet::with_capacity(records.len());
        for record in &records {
            record.validate()?;
            if !identifiers.insert(record.identifier.as_str()) {
                return Err(FrecencyError::Decode(format!(
                    "duplicate identifier {:?}",
                    record.identifier
                )));
            }
        }

        let mut state = Self {
            store_key: store_key.into(),
            ruleset,
            records,
        };
        state.sort();
        Ok(state)
    }

    #[must_use]
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    #[must_use]
    pub fn ruleset(&self) -> &FrecencyRuleset {
        &self.ruleset
    }

    #[must_use]
    pub fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&UsageRecord> {
        self.records
            .iter()
            .find(|record| record.identifier == identifier)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records one use of `identifier` at `at` and returns the identifiers
    /// dropped by the `max_records` cap.
    pub fn record_use(&mut self, identifier: &str, at: OffsetDateTime) -> Vec<String> {
        match self
            .records
            .iter_mut()
            .find(|record| record.identifier == identifier)
        {
            Some(record) => record.touch(at),
            None => self.records.push(UsageRecord::first_use(identifier, at)),
        }
        self.sort();

        let mut evicted = Vec::new();
        while self.records.len() > self.ruleset.max_records {
            let Some(position) = self
                .records
                .iter()
                .rposition(|record| record.identifier != identifier)
            else {
                break;
            };
            evicted.push(self.records.remove(position).identifier);
        }
        evicted
    }

    /// Removes every record whose identifier is in `identifiers`; absent
    /// identifiers are ignored. Returns the number of records removed.
    pub fn remove_all(&mut self, identifiers: &BTreeSet<String>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|record| !identifiers.contains(&record.identifier));
        before - self.records.len()
    }

    fn sort(&mut self) {
        let ruleset = &self.ruleset;
        self.records.sort_by(|lhs, rhs| ruleset.compare(lhs, rhs));
    }
}

/// A ranked, mutable collection of usage records.
///
/// Implementations return [`UsageLedger::records`] in descending frecency
/// order and persist the full record set on every mutating call.
pub trait UsageLedger {
    type Error: Display;

    fn records(&self) -> &[UsageRecord];

    /// Records one use of `identifier` now.
    ///
    /// # Errors
    /// Returns an implementation error when the update cannot be persisted.
    fn upsert(&mut self, identifier: &str) -> Result<(), Self::Error>;

    /// Removes the records of every identifier in the set.
    ///
    /// # Errors
    /// Returns an implementation error when the update cannot be persisted.
    fn delete_all(&mut self, identifiers: &BTreeSet<String>) -> Result<(), Self::Error>;
}

impl UsageLedger for FrecencyState {
    type Error = Infallible;

    fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    fn upsert(&mut self, identifier: &str) -> Result<(), Self::Error> {
        let evicted = self.record_use(identifier, now_utc());
        if !evicted.is_empty() {
            debug!(
                store_key = self.store_key(),
                evicted = ?evicted,
                "dropped frecency records beyond max_records"
            );
        }
        Ok(())
    }

    fn delete_all(&mut self, identifiers: &BTreeSet<String>) -> Result<(), Self::Error> {
        let removed = self.remove_all(identifiers);
        debug!(
            store_key = self.store_key(),
            removed,
            "removed stale frecency records"
        );
        Ok(())
    }
}

/// Post-selection write-back produced by [`rank_candidates`].
///
/// Consuming `apply` makes the update single-use.
#[derive(Debug)]
pub struct PendingUpdate<S> {
    store: S,
    stale: BTreeSet<String>,
}

impl<S: UsageLedger> PendingUpdate<S> {
    /// Identifiers present in the store but missing from the candidate list.
    #[must_use]
    pub fn stale(&self) -> &BTreeSet<String> {
        &self.stale
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Prunes stale records, then records `selected`. Failures of either step
    /// are logged and do not stop the other.
    pub fn apply(mut self, selected: &str) -> S {
        if !self.stale.is_empty() {
            match self.store.delete_all(&self.stale) {
                Ok(()) => debug!(count = self.stale.len(), "pruned stale frecency entries"),
                Err(err) => debug!(error = %err, "removing entries from frecency store failed"),
            }
        }

        if let Err(err) = self.store.upsert(selected) {
            debug!(error = %err, identifier = selected, "upserting entry to frecency store failed");
        }

        self.store
    }

    /// Runs [`PendingUpdate::apply`] on a worker thread. The handle may be
    /// joined or dropped.
    pub fn apply_in_background(self, selected: impl Into<String>) -> JoinHandle<S>
    where
        S: Send + 'static,
    {
        let selected = selected.into();
        std::thread::spawn(move || self.apply(&selected))
    }
}

/// Orders `candidates` with frecent entries first (store order) followed by
/// the rest in ascending code-point order.
///
/// Store records whose identifier is not a candidate are never returned; they
/// are collected into the [`PendingUpdate`] stale set instead. Duplicate
/// candidates collapse into a single entry.
pub fn rank_candidates<S, T>(store: S, candidates: &[T]) -> (PendingUpdate<S>, Vec<String>)
where
    S: UsageLedger,
    T: AsRef<str>,
{
    let members: HashSet<&str> = candidates
        .iter()
        .map(|candidate| candidate.as_ref())
        .collect();

    let mut ranked = Vec::with_capacity(members.len());
    let mut seen = HashSet::new();
    let mut stale = BTreeSet::new();

    for record in store.records() {
        if members.contains(record.identifier.as_str()) {
            if seen.insert(record.identifier.clone()) {
                ranked.push(record.identifier.clone());
            }
        } else {
            stale.insert(record.identifier.clone());
        }
    }

    let remainder: BTreeSet<&str> = members
        .into_iter()
        .filter(|candidate| !seen.contains(*candidate))
        .collect();
    ranked.extend(remainder.into_iter().map(str::to_string));

    (PendingUpdate { store, stale }, ranked)
}

/// Records a use for an identifier chosen without a ranking pass.
pub fn record_selection<S: UsageLedger>(store: &mut S, identifier: &str) {
    if let Err(err) = store.upsert(identifier) {
        debug!(error = %err, identifier, "upserting entry to frecency store failed");
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FrecencyError::Decode`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FrecencyError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FrecencyError::Decode(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FrecencyError::Decode(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FrecencyError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FrecencyError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            FrecencyError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn days_since(earlier: OffsetDateTime, later: OffsetDateTime) -> f32 {
    if later <= earlier {
        return 0.0;
    }

    let elapsed = later - earlier;
    (elapsed.as_seconds_f64() / Duration::DAY.as_seconds_f64()) as f32
}
