use std::fs::File;
use std::future::Future;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde_json::Value;
use super::storage::json_cell;
use crate::config::{CollectorConfig, TokenPageJob};
use crate::error::MetricsError;
use crate::sources::{JsonObject, LaunchpadSource, SourceError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl From<&CollectorConfig> for RetryPolicy {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_secs),
        }
    }
}

/// Runs `op` until it succeeds or `max_retries` attempts have failed, sleeping a fixed
/// delay between attempts. The last error is returned.
pub async fn with_retry<T, F, Fut>(label: &str, policy: RetryPolicy, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::warn!("[⚠] {} : {} - retry {}/{}", label, e, attempt, attempts);
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Default)]
pub struct CollectStats {
    pub requests: AtomicU64,
    pub failed: AtomicU64,
    pub rows_written: AtomicU64,
}

/// Per-worker `done/total` counters shown on one console line.
pub struct Progress {
    counters: Mutex<Vec<(usize, usize)>>,
    bar: ProgressBar,
}

impl Progress {
    pub fn new(workers: usize) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            bar.set_style(style);
        }
        Self::with_bar(workers, bar)
    }

    pub fn hidden(workers: usize) -> Self {
        Self::with_bar(workers, ProgressBar::hidden())
    }

    fn with_bar(workers: usize, bar: ProgressBar) -> Self {
        Self {
            counters: Mutex::new(vec![(0, 0); workers]),
            bar,
        }
    }

    pub fn set_total(&self, worker: usize, total: usize) {
        let mut counters = self.counters.lock();
        if let Some(c) = counters.get_mut(worker) {
            c.1 = total;
        }
        self.bar.set_message(render(&counters));
    }

    pub fn advance(&self, worker: usize) {
        let mut counters = self.counters.lock();
        if let Some(c) = counters.get_mut(worker) {
            c.0 += 1;
        }
        self.bar.set_message(render(&counters));
    }

    pub fn line(&self) -> String {
        render(&self.counters.lock())
    }

    pub fn finish(&self) {
        self.bar.finish_with_message(self.line());
    }
}

fn render(counters: &[(usize, usize)]) -> String {
    counters.iter()
        .enumerate()
        .map(|(i, (done, total))| format!("Worker{} : {:4}/{:4}", i + 1, done, total))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// CSV writer for schemaless JSON rows. The header comes from the first object's keys in
/// response order (plus any extra columns); later keys outside it are dropped.
pub struct JsonRowWriter<W: Write> {
    csv_wtr: csv::Writer<W>,
    header: Option<Vec<String>>,
    extra: Vec<String>,
}

impl<W: Write> JsonRowWriter<W> {
    pub fn new(writer: W, extra: &[&str]) -> Self {
        Self {
            csv_wtr: csv::Writer::from_writer(writer),
            header: None,
            extra: extra.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn write(&mut self, row: &JsonObject) -> Result<(), MetricsError> {
        if self.header.is_none() {
            let mut header: Vec<String> = row.keys().cloned().collect();
            for extra in &self.extra {
                if !header.contains(extra) {
                    header.push(extra.clone());
                }
            }
            self.csv_wtr.write_record(&header)?;
            self.header = Some(header);
        }

        if let Some(header) = &self.header {
            let cells = header.iter().map(|key| json_cell(row.get(key)));
            self.csv_wtr.write_record(cells)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), MetricsError> {
        self.csv_wtr.flush()?;
        Ok(())
    }
}

/// Token addresses from a token listing CSV (`address` column).
pub fn read_addresses<R: Read>(reader: R) -> Result<Vec<String>, MetricsError> {
    let mut csv_rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let col = csv_rdr.headers()?
        .iter()
        .position(|h| h == "address")
        .ok_or_else(|| MetricsError::MissingColumn("address".to_string()))?;

    let mut addresses = Vec::new();
    for result in csv_rdr.records() {
        let record = result?;
        if let Some(address) = record.get(col).filter(|a| !a.is_empty()) {
            addresses.push(address.to_string());
        }
    }
    Ok(addresses)
}

/// `tokens_0000-1000.csv` → (`trades_0000-1000.csv`, `erreurs_0000-1000.txt`)
pub fn partition_outputs(input: &Path) -> (PathBuf, PathBuf) {
    let name = input.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (trades_name, errors_name) = if name.contains("tokens_") {
        (name.replace("tokens_", "trades_"), name.replace("tokens_", "erreurs_"))
    } else {
        (format!("trades_{}", name), format!("erreurs_{}", name))
    };

    let trades = input.with_file_name(trades_name);
    let errors = input.with_file_name(errors_name).with_extension("txt");
    (trades, errors)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionReport {
    pub worker: usize,
    pub output: PathBuf,
    pub processed: usize,
    pub rows: usize,
    pub failed: usize,
}

/// One worker per partition, each with its own output files.
pub struct ApeCollector {
    source: Arc<dyn LaunchpadSource>,
    policy: RetryPolicy,
    page_delay: Duration,
    progress: Arc<Progress>,
    stats: Arc<CollectStats>,
}

impl ApeCollector {
    pub fn new(
        source: Arc<dyn LaunchpadSource>,
        policy: RetryPolicy,
        page_delay: Duration,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            source,
            policy,
            page_delay,
            progress,
            stats: Arc::new(CollectStats::default()),
        }
    }

    pub fn stats(&self) -> &CollectStats {
        &self.stats
    }

    /// Downloads the trades of every address in each input file.
    pub async fn collect_trades(&self, inputs: &[PathBuf]) -> Vec<PartitionReport> {
        let handles: Vec<_> = inputs.iter()
            .cloned()
            .enumerate()
            .map(|(worker, input)| {
                let source = self.source.clone();
                let progress = self.progress.clone();
                let stats = self.stats.clone();
                let policy = self.policy;
                tokio::spawn(async move {
                    let result = trade_partition(worker, &input, source, policy, &progress, &stats).await;
                    (worker, input, result)
                })
            })
            .collect();

        let reports = join_reports(handles).await;
        self.progress.finish();
        reports
    }

    /// Walks each `[start, end]` listing range until its first empty page.
    pub async fn collect_token_pages(&self, jobs: &[TokenPageJob]) -> Vec<PartitionReport> {
        let handles: Vec<_> = jobs.iter()
            .cloned()
            .enumerate()
            .map(|(worker, job)| {
                let source = self.source.clone();
                let progress = self.progress.clone();
                let stats = self.stats.clone();
                let policy = self.policy;
                let page_delay = self.page_delay;
                tokio::spawn(async move {
                    let result = token_partition(worker, &job, source, policy, page_delay, &progress, &stats).await;
                    (worker, job.output, result)
                })
            })
            .collect();

        let reports = join_reports(handles).await;
        self.progress.finish();
        reports
    }
}

async fn join_reports(
    handles: Vec<tokio::task::JoinHandle<(usize, PathBuf, Result<PartitionReport, MetricsError>)>>,
) -> Vec<PartitionReport> {
    let mut reports = Vec::new();
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((_, _, Ok(report))) => {
                tracing::info!(
                    "[✓ W{}] Done → {} ({} rows, {} failed)",
                    report.worker + 1,
                    report.output.display(),
                    report.rows,
                    report.failed
                );
                reports.push(report);
            }
            Ok((worker, path, Err(e))) => {
                tracing::error!("[✗ W{}] {} : {}", worker + 1, path.display(), e);
            }
            Err(e) => tracing::error!("Worker task failed: {}", e),
        }
    }
    reports
}

async fn trade_partition(
    worker: usize,
    input: &Path,
    source: Arc<dyn LaunchpadSource>,
    policy: RetryPolicy,
    progress: &Progress,
    stats: &CollectStats,
) -> Result<PartitionReport, MetricsError> {
    let addresses = read_addresses(BufReader::new(File::open(input)?))?;
    let (out_path, err_path) = partition_outputs(input);
    progress.set_total(worker, addresses.len());

    let mut writer = JsonRowWriter::new(BufWriter::new(File::create(&out_path)?), &["tokenAddress"]);
    let mut errors = BufWriter::new(File::create(&err_path)?);
    let mut report = PartitionReport {
        worker,
        output: out_path.clone(),
        ..PartitionReport::default()
    };

    for address in &addresses {
        let label = format!("{}…", address.chars().take(10).collect::<String>());
        let fetched = with_retry(&label, policy, || {
            stats.requests.fetch_add(1, Ordering::Relaxed);
            source.fetch_trades(address)
        })
        .await;

        match fetched {
            Ok(trades) => {
                let count = trades.len();
                for mut trade in trades {
                    trade.insert("tokenAddress".to_string(), Value::String(address.clone()));
                    writer.write(&trade)?;
                }
                report.rows += count;
                stats.rows_written.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!("{} given up: {}", address, e);
                writeln!(errors, "{}", address)?;
                stats.failed.fetch_add(1, Ordering::Relaxed);
                report.failed += 1;
            }
        }

        report.processed += 1;
        progress.advance(worker);
    }

    writer.flush()?;
    errors.flush()?;
    Ok(report)
}

async fn token_partition(
    worker: usize,
    job: &TokenPageJob,
    source: Arc<dyn LaunchpadSource>,
    policy: RetryPolicy,
    page_delay: Duration,
    progress: &Progress,
    stats: &CollectStats,
) -> Result<PartitionReport, MetricsError> {
    progress.set_total(worker, (job.end.saturating_sub(job.start) + 1) as usize);

    let mut writer = JsonRowWriter::new(BufWriter::new(File::create(&job.output)?), &[]);
    let mut report = PartitionReport {
        worker,
        output: job.output.clone(),
        ..PartitionReport::default()
    };

    for page in job.start..=job.end {
        let label = format!("page {}", page);
        let fetched = with_retry(&label, policy, || {
            stats.requests.fetch_add(1, Ordering::Relaxed);
            source.fetch_token_page(page)
        })
        .await;

        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("[W{}] giving up at page {}: {}", worker + 1, page, e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                report.failed += 1;
                break;
            }
        };
        if items.is_empty() {
            break;
        }

        for item in &items {
            writer.write(item)?;
        }
        report.rows += items.len();
        report.processed += 1;
        stats.rows_written.fetch_add(items.len() as u64, Ordering::Relaxed);
        progress.advance(worker);

        tokio::time::sleep(page_delay).await;
    }

    writer.flush()?;
    Ok(report)
}

/// `--trades` mode.
pub async fn run_trade_job(source: Arc<dyn LaunchpadSource>, config: &CollectorConfig) -> Vec<PartitionReport> {
    let present: Vec<PathBuf> = config.trade_inputs.iter()
        .filter(|p| p.is_file())
        .cloned()
        .collect();
    if present.len() < config.trade_inputs.len() {
        tracing::warn!("{} trade input files not found", config.trade_inputs.len() - present.len());
    }
    if present.is_empty() {
        tracing::warn!("No input file found");
        return Vec::new();
    }

    let progress = Arc::new(Progress::new(present.len()));
    let collector = ApeCollector::new(
        source,
        RetryPolicy::from(config),
        Duration::from_secs(config.page_delay_secs),
        progress,
    );
    let reports = collector.collect_trades(&present).await;
    log_stats(collector.stats());
    reports
}

/// `--tokens` mode.
pub async fn run_token_job(source: Arc<dyn LaunchpadSource>, config: &CollectorConfig) -> Vec<PartitionReport> {
    if config.token_jobs.is_empty() {
        tracing::warn!("No token page jobs configured");
        return Vec::new();
    }

    let progress = Arc::new(Progress::new(config.token_jobs.len()));
    let collector = ApeCollector::new(
        source,
        RetryPolicy::from(config),
        Duration::from_secs(config.page_delay_secs),
        progress,
    );
    let reports = collector.collect_token_pages(&config.token_jobs).await;
    log_stats(collector.stats());
    reports
}

fn log_stats(stats: &CollectStats) {
    tracing::info!(
        "📊 {} requests, {} given up, {} rows written",
        stats.requests.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed),
        stats.rows_written.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn no_wait(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, delay: Duration::ZERO }
    }

    fn obj(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    /// `flaky` fails twice before answering, `dead` never answers.
    struct FakeLaunchpad {
        flaky_calls: AtomicU32,
        pages: u32,
    }

    impl FakeLaunchpad {
        fn new(pages: u32) -> Self {
            Self { flaky_calls: AtomicU32::new(0), pages }
        }
    }

    #[async_trait]
    impl LaunchpadSource for FakeLaunchpad {
        fn name(&self) -> &'static str {
            "Fake"
        }

        async fn fetch_token_page(&self, page: u32) -> Result<Vec<JsonObject>, SourceError> {
            if page >= self.pages {
                return Ok(vec![]);
            }
            Ok(vec![
                obj(json!({"id": page * 2, "address": format!("0x{}a", page)})),
                obj(json!({"id": page * 2 + 1, "address": format!("0x{}b", page)})),
            ])
        }

        async fn fetch_trades(&self, address: &str) -> Result<Vec<JsonObject>, SourceError> {
            match address {
                "dead" => Err(SourceError::Status(403)),
                "flaky" if self.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 => {
                    Err(SourceError::Network("reset".to_string()))
                }
                "quiet" => Ok(vec![]),
                _ => Ok(vec![
                    obj(json!({"tokenChange": 10, "nativeVolume": 0.5, "to": null})),
                    obj(json!({"tokenChange": -4, "nativeVolume": 0.2, "extra": true})),
                ]),
            }
        }
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SourceError> = with_retry("x", no_wait(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::RateLimit) }
        })
        .await;

        assert!(matches!(result, Err(SourceError::RateLimit)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("x", no_wait(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SourceError::Status(500))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_partition_outputs() {
        let (trades, errors) = partition_outputs(Path::new("data/tokens_0000-1000.csv"));
        assert_eq!(trades, PathBuf::from("data/trades_0000-1000.csv"));
        assert_eq!(errors, PathBuf::from("data/erreurs_0000-1000.txt"));

        let (trades, errors) = partition_outputs(Path::new("list.csv"));
        assert_eq!(trades, PathBuf::from("trades_list.csv"));
        assert_eq!(errors, PathBuf::from("erreurs_list.txt"));
    }

    #[test]
    fn test_json_row_writer_ignores_late_keys() {
        let mut out = Vec::new();
        {
            let mut writer = JsonRowWriter::new(&mut out, &["tokenAddress"]);
            writer.write(&obj(json!({"a": 1, "b": "x"}))).unwrap();
            writer.write(&obj(json!({"a": 2, "c": 3, "tokenAddress": "0x1"}))).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(String::from_utf8(out).unwrap(), "a,b,tokenAddress\n1,x,\n2,,0x1\n");
    }

    #[test]
    fn test_progress_line() {
        let progress = Progress::hidden(2);
        progress.set_total(0, 3);
        progress.set_total(1, 10);
        progress.advance(0);
        progress.advance(5);
        assert_eq!(progress.line(), "Worker1 :    1/   3 | Worker2 :    0/  10");
    }

    #[test]
    fn test_read_addresses() {
        let input = "id, address ,name\n1,0xaa,A\n2,,B\n3,0xcc,C\n";
        assert_eq!(read_addresses(input.as_bytes()).unwrap(), vec!["0xaa", "0xcc"]);
        assert!(read_addresses("id\n1\n".as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_collect_trades_partitions() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("tokens_0000-1000.csv");
        let second = dir.path().join("tokens_1000-2000.csv");
        fs::write(&first, "address\n0xgood\ndead\n").unwrap();
        fs::write(&second, "address\nflaky\nquiet\n").unwrap();

        let source = Arc::new(FakeLaunchpad::new(0));
        let collector = ApeCollector::new(source, no_wait(3), Duration::ZERO, Arc::new(Progress::hidden(2)));
        let mut reports = collector.collect_trades(&[first, second]).await;
        reports.sort_by_key(|r| r.worker);

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].processed, 2);
        assert_eq!(reports[0].rows, 2);
        assert_eq!(reports[0].failed, 1);
        assert_eq!(collector.progress.line(), "Worker1 :    2/   2 | Worker2 :    2/   2");
        assert_eq!(collector.stats().failed.load(Ordering::Relaxed), 1);

        let trades = fs::read_to_string(dir.path().join("trades_0000-1000.csv")).unwrap();
        assert_eq!(
            trades,
            "tokenChange,nativeVolume,to,tokenAddress\n10,0.5,,0xgood\n-4,0.2,,0xgood\n"
        );
        let errors = fs::read_to_string(dir.path().join("erreurs_0000-1000.txt")).unwrap();
        assert_eq!(errors, "dead\n");
    }

    #[tokio::test]
    async fn test_collect_token_pages_stops_at_empty_page() {
        let dir = TempDir::new().unwrap();
        let job = TokenPageJob {
            start: 0,
            end: 10,
            output: dir.path().join("tokens_0000-0010.csv"),
        };

        let source = Arc::new(FakeLaunchpad::new(2));
        let collector = ApeCollector::new(source, no_wait(1), Duration::ZERO, Arc::new(Progress::hidden(1)));
        let reports = collector.collect_token_pages(&[job.clone()]).await;

        assert_eq!(reports[0].processed, 2);
        assert_eq!(reports[0].rows, 4);
        let written = fs::read_to_string(&job.output).unwrap();
        assert_eq!(written, "id,address\n0,0x0a\n1,0x0b\n2,0x1a\n3,0x1b\n");
    }
}
