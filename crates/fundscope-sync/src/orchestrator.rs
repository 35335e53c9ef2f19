use std::collections::BTreeSet;
use std::sync::Arc;

use fundscope_adapters::FundExtractor;
use fundscope_core::{BatchReport, IngestionOutcome};
use fundscope_storage::{DocumentFetcher, FundStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::CycleError;

/// Fans discovered paths out into fetch/extract/upsert workers, at most
/// `max_in_flight` at a time.
///
/// The admission gate belongs to the instance, so independent orchestrators
/// never share slots.
pub struct Orchestrator {
    source_host: String,
    fetcher: Arc<dyn DocumentFetcher>,
    extractor: Arc<dyn FundExtractor>,
    store: Arc<dyn FundStore>,
    gate: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        source_host: impl Into<String>,
        fetcher: Arc<dyn DocumentFetcher>,
        extractor: Arc<dyn FundExtractor>,
        store: Arc<dyn FundStore>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            source_host: source_host.into(),
            fetcher,
            extractor,
            store,
            gate: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Processes every path and returns once all workers have finished.
    /// Item failures are logged and counted, never returned.
    pub async fn run_batch(&self, paths: BTreeSet<String>) -> Result<BatchReport, CycleError> {
        if !is_http_url(&self.source_host) {
            return Err(CycleError::BatchStart(format!(
                "source host `{}` is not an http(s) url",
                self.source_host
            )));
        }

        let mut workers = JoinSet::new();
        let mut report = BatchReport::default();

        for path in paths {
            let permit = match self.gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    drain(&mut workers, &mut report).await;
                    return Err(CycleError::BatchStart("admission gate closed".to_string()));
                }
            };

            let url = resolve_url(&self.source_host, &path);
            let fetcher = Arc::clone(&self.fetcher);
            let extractor = Arc::clone(&self.extractor);
            let store = Arc::clone(&self.store);
            let span = info_span!("ingest_item", path = %path);

            workers.spawn(
                async move {
                    let outcome =
                        ingest_one(&url, fetcher.as_ref(), extractor.as_ref(), store.as_ref()).await;
                    drop(permit);
                    outcome
                }
                .instrument(span),
            );
        }

        drain(&mut workers, &mut report).await;
        Ok(report)
    }
}

async fn drain(workers: &mut JoinSet<IngestionOutcome>, report: &mut BatchReport) {
    while let Some(joined) = workers.join_next().await {
        let outcome = joined.unwrap_or_else(|err| {
            warn!(error = %err, "ingest worker did not complete");
            IngestionOutcome::Failed(err.to_string())
        });
        report.record(&outcome);
    }
}

async fn ingest_one(
    url: &str,
    fetcher: &dyn DocumentFetcher,
    extractor: &dyn FundExtractor,
    store: &dyn FundStore,
) -> IngestionOutcome {
    let html = match fetcher.fetch(url).await {
        Ok(html) => html,
        Err(err) => {
            warn!(url, error = %err, "could not fetch fund page");
            return IngestionOutcome::Failed(err.to_string());
        }
    };

    let record = match extractor.extract(&html) {
        Ok(record) => record,
        Err(err) if err.is_missing_data() => {
            info!(url, reason = %err, "page carries no fund data");
            return IngestionOutcome::SkippedNoData(err.to_string());
        }
        Err(err) => {
            warn!(url, error = %err, "could not build fund record");
            return IngestionOutcome::Failed(err.to_string());
        }
    };

    if !record.is_valid() {
        warn!(url, fund = record.identity(), "extracted record lacks identity or description");
        return IngestionOutcome::Failed("record lacks identity or description".to_string());
    }

    let data = match serde_json::to_value(&record) {
        Ok(data) => data,
        Err(err) => {
            warn!(url, error = %err, "could not serialize fund record");
            return IngestionOutcome::Failed(err.to_string());
        }
    };

    match store.upsert(record.identity(), &data).await {
        Ok(()) => {
            debug!(url, fund = record.identity(), "stored fund");
            IngestionOutcome::Stored(record.name)
        }
        Err(err) => {
            warn!(url, fund = record.identity(), error = %err, "could not upsert fund");
            IngestionOutcome::Failed(err.to_string())
        }
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Joins a discovered link target onto the source host. Absolute links pass through.
pub fn resolve_url(source_host: &str, path: &str) -> String {
    if is_http_url(path) {
        return path.to_string();
    }
    let host = source_host.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{host}{path}")
    } else {
        format!("{host}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use fundscope_adapters::{ExtractionError, SsgaFundExtractor};
    use fundscope_core::MAX_IN_FLIGHT;
    use fundscope_storage::{FetchError, MemoryFundStore};

    fn fund_page(ticker: &str) -> String {
        format!(
            r#"<html><body>
            <span class="ticker">{ticker}</span>
            <section class="comp-text">
              <h2 class="comp-title">About this Benchmark</h2>
              <div class="ssmp-richtext">Tracks the {ticker} index.</div>
            </section>
            </body></html>"#
        )
    }

    /// Serves a fund page for every path and records peak concurrency.
    #[derive(Default)]
    struct CountingFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let ticker = url.rsplit('/').next().unwrap_or_default();
            Ok(fund_page(ticker))
        }
    }

    struct ScriptedFetcher {
        pages: HashMap<String, Result<String, u16>>,
    }

    #[async_trait]
    impl DocumentFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            match self.pages.get(url) {
                Some(Ok(html)) => Ok(html.clone()),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: url.to_string(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn paths(n: usize) -> BTreeSet<String> {
        (0..n).map(|i| format!("/fund/F{i:04}")).collect()
    }

    async fn assert_cap_holds(cap: usize, items: usize) {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = Arc::new(MemoryFundStore::new());
        let orchestrator = Orchestrator::new(
            "https://funds.test",
            fetcher.clone(),
            Arc::new(SsgaFundExtractor),
            store.clone(),
            cap,
        );

        let report = orchestrator.run_batch(paths(items)).await.unwrap();

        assert_eq!(report.attempted, items);
        assert_eq!(report.stored, items);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), items);
        assert_eq!(fetcher.in_flight.load(Ordering::SeqCst), 0);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= cap, "peak {peak} exceeded cap {cap}");
        assert_eq!(store.len().await, items);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_workers_never_exceed_small_cap() {
        assert_cap_holds(4, 120).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn in_flight_workers_never_exceed_default_cap() {
        assert_cap_holds(MAX_IN_FLIGHT, 500).await;
    }

    #[tokio::test]
    async fn empty_path_set_completes_immediately() {
        let orchestrator = Orchestrator::new(
            "https://funds.test",
            Arc::new(CountingFetcher::default()),
            Arc::new(SsgaFundExtractor),
            Arc::new(MemoryFundStore::new()),
            MAX_IN_FLIGHT,
        );
        let report = orchestrator.run_batch(BTreeSet::new()).await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn failing_item_does_not_affect_the_rest() {
        let mut pages = HashMap::new();
        pages.insert("https://funds.test/fund/AAA".to_string(), Ok(fund_page("AAA")));
        pages.insert("https://funds.test/fund/BBB".to_string(), Err(504));
        pages.insert("https://funds.test/fund/CCC".to_string(), Ok(fund_page("CCC")));
        let store = Arc::new(MemoryFundStore::new());
        let orchestrator = Orchestrator::new(
            "https://funds.test/",
            Arc::new(ScriptedFetcher { pages }),
            Arc::new(SsgaFundExtractor),
            store.clone(),
            2,
        );

        let input = ["/fund/AAA", "/fund/BBB", "/fund/CCC"]
            .into_iter()
            .map(String::from)
            .collect();
        let report = orchestrator.run_batch(input).await.unwrap();

        assert_eq!(report.stored, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.list_ids().await.unwrap(), vec!["AAA", "CCC"]);
    }

    #[tokio::test]
    async fn page_without_ticker_is_skipped_without_storage() {
        let mut pages = HashMap::new();
        pages.insert(
            "https://funds.test/about".to_string(),
            Ok("<html><body><h1>About us</h1></body></html>".to_string()),
        );
        let store = Arc::new(MemoryFundStore::new());
        let orchestrator = Orchestrator::new(
            "https://funds.test",
            Arc::new(ScriptedFetcher { pages }),
            Arc::new(SsgaFundExtractor),
            store.clone(),
            MAX_IN_FLIGHT,
        );

        let report = orchestrator
            .run_batch(BTreeSet::from(["/about".to_string()]))
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn relative_source_host_cannot_start_a_batch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let orchestrator = Orchestrator::new(
            "funds.test",
            fetcher.clone(),
            Arc::new(SsgaFundExtractor),
            Arc::new(MemoryFundStore::new()),
            MAX_IN_FLIGHT,
        );
        let err = orchestrator.run_batch(paths(3)).await.unwrap_err();
        assert!(matches!(err, CycleError::BatchStart(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    struct BlankIdentityExtractor;

    impl FundExtractor for BlankIdentityExtractor {
        fn extract(&self, _html: &str) -> Result<fundscope_core::FundRecord, ExtractionError> {
            Ok(fundscope_core::FundRecord {
                name: "  ".into(),
                description: "desc".into(),
                top_holdings: vec![],
                countries: vec![],
                sectors: vec![],
            })
        }
    }

    #[tokio::test]
    async fn record_without_identity_fails_without_storage() {
        let store = Arc::new(MemoryFundStore::new());
        let orchestrator = Orchestrator::new(
            "https://funds.test",
            Arc::new(CountingFetcher::default()),
            Arc::new(BlankIdentityExtractor),
            store.clone(),
            MAX_IN_FLIGHT,
        );

        let report = orchestrator.run_batch(paths(2)).await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.stored, 0);
        assert!(store.is_empty().await);
    }

    #[test]
    fn urls_resolve_against_the_source_host() {
        assert_eq!(resolve_url("https://www.ssga.com", "/us/en/x"), "https://www.ssga.com/us/en/x");
        assert_eq!(resolve_url("https://www.ssga.com/", "/us/en/x"), "https://www.ssga.com/us/en/x");
        assert_eq!(resolve_url("https://www.ssga.com", "funds/x"), "https://www.ssga.com/funds/x");
        assert_eq!(resolve_url("https://www.ssga.com", "https://other.test/y"), "https://other.test/y");
    }
}
