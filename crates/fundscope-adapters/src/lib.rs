//! Source-site strategies: fund page field extraction and listing path discovery.

use std::collections::BTreeSet;

use async_trait::async_trait;
use fundscope_core::{strip_fragment, FundRecord, Holding, WeightedCategory};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

mod browser;

pub use browser::{BrowserDiscoverer, BrowserOptions};

pub const CRATE_NAME: &str = "fundscope-adapters";

const TABLE_SELECTOR: &str = "table.data-table";
const ROW_SELECTOR: &str = "tr";
const LABEL_CELL_SELECTOR: &str = "td.label";
const DATA_CELL_SELECTOR: &str = "td.data";

const TICKER_SELECTOR: &str = "span.ticker";

const DESCRIPTION_HEADING_SELECTOR: &str = "h2.comp-title";
const DESCRIPTION_HEADING_MARKER: &str = "About this Benchmark";
const DESCRIPTION_SECTION_SELECTOR: &str = "section.comp-text";
const DESCRIPTION_BODY_SELECTOR: &str = "div.ssmp-richtext";

const BLOCK_HEADING_SELECTOR: &str = "h3";
const HOLDINGS_SECTION_SELECTOR: &str = "section";
const HOLDINGS_MARKER: &str = "Top Holdings";

// html5ever lowercases attribute names, so `data-fundComponent` is matched lowercase.
const FUND_COMPONENT_SELECTOR: &str = "div[data-fundcomponent='true']";

/// Tried in order; the first block found wins. "Fund Sector Breakdown" must precede
/// "Sector Breakdown" because the latter is a substring of the former.
pub const SECTOR_SECTION_MARKERS: [&str; 4] = [
    "Fund Sector Breakdown",
    "Sector Breakdown",
    "Fund Industry Allocation",
    "Fund Sub-Industry Allocation",
];

const GEOGRAPHICAL_SELECTOR: &str = "input#fund-geographical-breakdown";

/// Container on the fund finder page holding the client-rendered fund table.
pub const LISTING_CONTAINER_SELECTOR: &str = ".tab-content";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("fund ticker not found")]
    MissingIdentity,
    #[error("fund description not found")]
    MissingDescription,
    #[error("top holdings section has no data table")]
    MalformedHoldingsSection,
    #[error("malformed geographic breakdown: {0}")]
    MalformedGeoJson(#[from] serde_json::Error),
}

impl ExtractionError {
    /// True when the page simply is not a fund page, as opposed to a fund page
    /// whose sections could not be read.
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::MissingIdentity | Self::MissingDescription)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("launching browser: {0}")]
    Launch(String),
    #[error("navigating to {url}: {message}")]
    Navigation { url: String, message: String },
    #[error("waiting for listing to load: {0}")]
    Readiness(String),
    #[error("capturing listing markup: {0}")]
    Capture(String),
}

/// Turns one fund page into a [`FundRecord`].
pub trait FundExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<FundRecord, ExtractionError>;
}

/// Produces the set of item paths linked from the listing page.
#[async_trait]
pub trait PathDiscoverer: Send + Sync {
    async fn discover_paths(&self, listing_url: &str) -> Result<BTreeSet<String>, DiscoveryError>;
}

/// Extraction rules for SSGA fund detail pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct SsgaFundExtractor;

impl FundExtractor for SsgaFundExtractor {
    fn extract(&self, html: &str) -> Result<FundRecord, ExtractionError> {
        extract_fund(html)
    }
}

pub fn extract_fund(html: &str) -> Result<FundRecord, ExtractionError> {
    let document = Html::parse_document(html);

    let name = find_identity(&document)?;
    let description = find_description(&document)?;
    let top_holdings = find_holdings(&document)?;
    let sectors = find_sectors(&document)?;
    let countries = find_countries(&document)?;

    Ok(FundRecord {
        name,
        description,
        top_holdings,
        countries,
        sectors,
    })
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn find_identity(document: &Html) -> Result<String, ExtractionError> {
    let sel = selector(TICKER_SELECTOR)?;
    document
        .select(&sel)
        .next()
        .map(element_text)
        .filter(|name| !name.is_empty())
        .ok_or(ExtractionError::MissingIdentity)
}

fn find_description(document: &Html) -> Result<String, ExtractionError> {
    let sections = find_marked_blocks(
        document,
        DESCRIPTION_HEADING_SELECTOR,
        DESCRIPTION_HEADING_MARKER,
        DESCRIPTION_SECTION_SELECTOR,
    )?;

    let body = selector(DESCRIPTION_BODY_SELECTOR)?;
    let description = sections
        .iter()
        .flat_map(|section| section.select(&body))
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if description.is_empty() {
        return Err(ExtractionError::MissingDescription);
    }
    Ok(description)
}

/// Nearest `block_css` ancestor of every `heading_css` element whose text contains
/// `marker`, in document order and without duplicates.
fn find_marked_blocks<'a>(
    document: &'a Html,
    heading_css: &str,
    marker: &str,
    block_css: &str,
) -> Result<Vec<ElementRef<'a>>, ExtractionError> {
    let heading_sel = selector(heading_css)?;
    let block_sel = selector(block_css)?;

    let mut blocks: Vec<ElementRef<'a>> = Vec::new();
    for heading in document.select(&heading_sel) {
        if !heading.text().collect::<String>().contains(marker) {
            continue;
        }
        let block = heading
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|ancestor| block_sel.matches(ancestor));
        if let Some(block) = block {
            if !blocks.iter().any(|seen| seen.id() == block.id()) {
                blocks.push(block);
            }
        }
    }
    Ok(blocks)
}

struct TableRow {
    label: String,
    data: Vec<String>,
}

impl TableRow {
    fn data_cell(&self, idx: usize) -> &str {
        self.data.get(idx).map(String::as_str).unwrap_or_default()
    }
}

/// Rows of every data table inside `blocks`, taken together. The first row overall
/// is the header and is dropped once, as are label-less rows. `None` when no block
/// holds a data table.
fn labelled_rows(blocks: &[ElementRef<'_>]) -> Result<Option<Vec<TableRow>>, ExtractionError> {
    let table_sel = selector(TABLE_SELECTOR)?;
    let row_sel = selector(ROW_SELECTOR)?;
    let label_sel = selector(LABEL_CELL_SELECTOR)?;
    let data_sel = selector(DATA_CELL_SELECTOR)?;

    let tables = blocks
        .iter()
        .flat_map(|block| block.select(&table_sel))
        .collect::<Vec<_>>();
    if tables.is_empty() {
        return Ok(None);
    }

    let rows = tables
        .iter()
        .flat_map(|table| table.select(&row_sel))
        .skip(1)
        .filter_map(|row| {
            let label = row
                .select(&label_sel)
                .map(element_text)
                .collect::<Vec<_>>()
                .join(" ");
            if label.is_empty() {
                return None;
            }
            let data = row.select(&data_sel).map(element_text).collect();
            Some(TableRow { label, data })
        })
        .collect();
    Ok(Some(rows))
}

fn find_holdings(document: &Html) -> Result<Vec<Holding>, ExtractionError> {
    let sections = find_marked_blocks(
        document,
        BLOCK_HEADING_SELECTOR,
        HOLDINGS_MARKER,
        HOLDINGS_SECTION_SELECTOR,
    )?;
    if sections.is_empty() {
        return Ok(Vec::new());
    }

    let rows = labelled_rows(&sections)?.ok_or(ExtractionError::MalformedHoldingsSection)?;

    // Index-level holdings leave the weight column blank; only fund-level rows carry it.
    Ok(rows
        .into_iter()
        .filter(|row| !row.data_cell(1).is_empty())
        .map(|row| Holding {
            shares_held: row.data_cell(0).to_string(),
            weight: row.data_cell(1).to_string(),
            name: row.label,
        })
        .collect())
}

fn find_sectors(document: &Html) -> Result<Vec<WeightedCategory>, ExtractionError> {
    let mut block = None;
    for marker in SECTOR_SECTION_MARKERS {
        block = find_marked_blocks(document, BLOCK_HEADING_SELECTOR, marker, FUND_COMPONENT_SELECTOR)?
            .into_iter()
            .next();
        if block.is_some() {
            break;
        }
    }
    let Some(block) = block else {
        return Ok(Vec::new());
    };

    Ok(labelled_rows(&[block])?
        .unwrap_or_default()
        .into_iter()
        .map(|row| {
            let weight = row.data_cell(0).to_string();
            WeightedCategory::new(row.label, weight)
        })
        .collect())
}

#[derive(Debug, Default, Deserialize)]
struct GeographicalData {
    #[serde(
        rename = "attributeArray",
        alias = "AttributeArray",
        default,
        deserialize_with = "null_as_default"
    )]
    attribute_array: Vec<CountryWeight>,
}

#[derive(Debug, Default, Deserialize)]
struct CountryWeight {
    #[serde(default, deserialize_with = "null_as_default")]
    name: AttributeValue,
    #[serde(default, deserialize_with = "null_as_default")]
    weight: AttributeValue,
}

#[derive(Debug, Default, Deserialize)]
struct AttributeValue {
    #[serde(default, deserialize_with = "null_as_default")]
    value: String,
}

/// The source emits `null` for blank attributes; read it like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn find_countries(document: &Html) -> Result<Vec<WeightedCategory>, ExtractionError> {
    let sel = selector(GEOGRAPHICAL_SELECTOR)?;
    let Some(input) = document.select(&sel).next() else {
        return Ok(Vec::new());
    };

    let raw = input.value().attr("value").unwrap_or_default();
    let geo: GeographicalData = serde_json::from_str(raw)?;
    Ok(geo
        .attribute_array
        .into_iter()
        .map(|c| WeightedCategory::new(c.name.value, c.weight.value))
        .collect())
}

/// Collects every anchor `href` in `markup`, truncated at `#`, as a set.
/// Pure-fragment links (`#top`) reduce to nothing and are dropped.
pub fn collect_link_paths(markup: &str) -> Result<BTreeSet<String>, DiscoveryError> {
    let fragment = Html::parse_fragment(markup);
    let anchors = Selector::parse("a[href]").map_err(|e| DiscoveryError::Capture(e.to_string()))?;
    Ok(fragment
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| strip_fragment(href.trim()))
        .filter(|path| !path.is_empty())
        .map(ToString::to_string)
        .collect())
}
