//! Core fund data model, source-site contract, and ingestion tuning constants.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fundscope-core";

/// Default host the ingestion pipeline crawls.
pub const DEFAULT_SOURCE_HOST: &str = "https://www.ssga.com";

/// Fund finder listing, filtered to the equity asset class.
pub const LISTING_PATH: &str = "/us/en/individual/etfs/fund-finder?g=assetclass%3Aequity&tab=overview";

/// Upper bound on simultaneously in-flight fetch/extract/upsert pipelines.
///
/// Keeps a full equity listing (a few hundred funds) to a handful of admission
/// waves without opening hundreds of sockets against a single host at once.
pub const MAX_IN_FLIGHT: usize = 50;

/// Total tries for one scheduled cycle, the first try included.
///
/// Discovery depends on a client-rendered page; a couple of extra tries ride
/// out short site outages before the cycle is abandoned until the next period.
pub const MAX_CYCLE_ATTEMPTS: usize = 3;

/// Spacing between tries of a failed scheduled cycle.
pub const RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Period between scheduled cycles. Fund holdings are published once a day.
pub const CYCLE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// One constituent position of a fund. Values are kept as the source formats them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub name: String,
    pub shares_held: String,
    pub weight: String,
}

/// A (name, weight) pair, used for sector and geographic breakdowns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedCategory {
    pub name: String,
    pub weight: String,
}

impl WeightedCategory {
    pub fn new(name: impl Into<String>, weight: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: weight.into(),
        }
    }
}

/// Everything extracted from one fund page. `name` is the storage identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRecord {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub top_holdings: Vec<Holding>,
    #[serde(default)]
    pub countries: Vec<WeightedCategory>,
    #[serde(default)]
    pub sectors: Vec<WeightedCategory>,
}

impl FundRecord {
    pub fn identity(&self) -> &str {
        &self.name
    }

    /// Identity and description are required; every breakdown may be empty.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.description.trim().is_empty()
    }
}

/// Stored row as owned by the storage layer, timestamps included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFund {
    pub id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one path's fetch/extract/upsert pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    Stored(String),
    SkippedNoData(String),
    Failed(String),
}

/// Per-cycle aggregate of item outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: &IngestionOutcome) {
        self.attempted += 1;
        match outcome {
            IngestionOutcome::Stored(_) => self.stored += 1,
            IngestionOutcome::SkippedNoData(_) => self.skipped += 1,
            IngestionOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Strips a `#fragment` suffix from a discovered link target.
pub fn strip_fragment(href: &str) -> &str {
    match href.find('#') {
        Some(idx) => &href[..idx],
        None => href,
    }
}
