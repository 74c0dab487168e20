//! Relays buffered impressions and metrics from storage to the central service.
//!
//! Recording is lossy: a batch is removed from storage before it is posted and is never put back.
//! A failed post is logged together with the number of items lost and counted, and the next tick
//! moves on to the next batch.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;

use crate::{
    dtos::{
        CounterDto, GaugeDto, ImpressionsDto, LatenciesDto, Metric, SdkMetadata, StoredImpression,
        StoredMetric, LATENCY_BUCKET_COUNT,
    },
    http::{build_client, check_status, endpoint, sdk_headers, HttpClientConfig},
    listener::{ListenerPayload, ListenerQueue},
    storage::Storage,
    Error, Result,
};

/// Sink for impressions.
pub trait ImpressionsRecorder: Send + Sync {
    /// Post impressions produced by the SDK instance described by `metadata`.
    fn post_impressions(&self, metadata: &SdkMetadata, impressions: &[ImpressionsDto])
        -> Result<()>;
}

/// Sink for aggregated metrics.
pub trait MetricsRecorder: Send + Sync {
    #[allow(missing_docs)]
    fn post_latencies(&self, metadata: &SdkMetadata, latencies: &[LatenciesDto]) -> Result<()>;
    #[allow(missing_docs)]
    fn post_counters(&self, metadata: &SdkMetadata, counters: &[CounterDto]) -> Result<()>;
    #[allow(missing_docs)]
    fn post_gauge(&self, metadata: &SdkMetadata, gauge: &GaugeDto) -> Result<()>;
}

/// Posts telemetry to the events endpoints of the central service.
///
/// Requests carry the metadata of the SDK that produced the telemetry, not the agent's own.
pub struct HttpRecorder {
    client: reqwest::blocking::Client,
    config: HttpClientConfig,
    unauthorized: AtomicBool,
}

impl HttpRecorder {
    /// `config.base_url` is the events URL.
    pub fn new(config: HttpClientConfig) -> Result<HttpRecorder> {
        Ok(HttpRecorder {
            client: build_client(config.timeout)?,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn post<T: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        metadata: &SdkMetadata,
        body: &T,
    ) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = endpoint(&self.config.base_url, segments)?;
        let body = serde_json::to_vec(body)?;
        log::trace!(target: "split_sync", url:% = url, bytes = body.len(); "posting telemetry");

        let response = self
            .client
            .post(url)
            .headers(sdk_headers(&self.config.api_key, metadata))
            .body(body)
            .send()?;
        check_status(response, &self.unauthorized)?;
        Ok(())
    }
}

impl ImpressionsRecorder for HttpRecorder {
    fn post_impressions(
        &self,
        metadata: &SdkMetadata,
        impressions: &[ImpressionsDto],
    ) -> Result<()> {
        self.post(&["testImpressions", "bulk"], metadata, impressions)
    }
}

impl MetricsRecorder for HttpRecorder {
    fn post_latencies(&self, metadata: &SdkMetadata, latencies: &[LatenciesDto]) -> Result<()> {
        self.post(&["metrics", "times"], metadata, latencies)
    }

    fn post_counters(&self, metadata: &SdkMetadata, counters: &[CounterDto]) -> Result<()> {
        self.post(&["metrics", "counters"], metadata, counters)
    }

    fn post_gauge(&self, metadata: &SdkMetadata, gauge: &GaugeDto) -> Result<()> {
        self.post(&["metrics", "gauge"], metadata, gauge)
    }
}

/// Group impressions by the SDK instance that produced them and then by feature, keeping the
/// order in which SDK instances and features first appear.
pub(crate) fn group_impressions(
    impressions: Vec<StoredImpression>,
) -> Vec<(SdkMetadata, Vec<ImpressionsDto>)> {
    let mut groups: Vec<(SdkMetadata, Vec<ImpressionsDto>)> = Vec::new();
    let mut by_metadata: HashMap<SdkMetadata, usize> = HashMap::new();

    for StoredImpression {
        metadata,
        feature,
        impression,
    } in impressions
    {
        let index = *by_metadata.entry(metadata.clone()).or_insert_with(|| {
            groups.push((metadata, Vec::new()));
            groups.len() - 1
        });
        let features = &mut groups[index].1;
        match features.iter_mut().find(|dto| dto.test_name == feature) {
            Some(dto) => dto.key_impressions.push(impression),
            None => features.push(ImpressionsDto {
                test_name: feature,
                key_impressions: vec![impression],
            }),
        }
    }
    groups
}

/// Moves one batch of impressions per tick from storage to an [`ImpressionsRecorder`].
///
/// Several tasks may drain the same storage concurrently; each item is popped by one of them.
pub struct ImpressionsRecorderTask {
    id: usize,
    storage: Arc<dyn Storage>,
    recorder: Arc<dyn ImpressionsRecorder>,
    listener: Option<ListenerQueue>,
    max_per_post: usize,
    lost: AtomicU64,
}

impl ImpressionsRecorderTask {
    /// `listener` receives a copy of every popped batch before it is posted.
    pub fn new(
        id: usize,
        storage: Arc<dyn Storage>,
        recorder: Arc<dyn ImpressionsRecorder>,
        listener: Option<ListenerQueue>,
        max_per_post: usize,
    ) -> ImpressionsRecorderTask {
        ImpressionsRecorderTask {
            id,
            storage,
            recorder,
            listener,
            max_per_post,
            lost: AtomicU64::new(0),
        }
    }

    /// Number of impressions dropped because their post failed.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Pop at most one batch and post it. Returns the number of impressions popped.
    ///
    /// # Errors
    ///
    /// Returns the first post error, after every group of the batch has been attempted. The
    /// impressions of failed groups are lost.
    pub fn record(&self) -> Result<usize> {
        let impressions = self.storage.pop_impressions(self.max_per_post)?;
        if impressions.is_empty() {
            return Ok(0);
        }
        let popped = impressions.len();
        log::debug!(target: "split_sync", task = self.id, count = popped; "recording impressions");

        let mut result = Ok(popped);
        for (metadata, impressions) in group_impressions(impressions) {
            if let Some(listener) = &self.listener {
                listener.enqueue(ListenerPayload {
                    impressions: impressions.clone(),
                    metadata: metadata.clone(),
                });
            }

            if let Err(err) = self.recorder.post_impressions(&metadata, &impressions) {
                let lost: usize = impressions
                    .iter()
                    .map(|dto| dto.key_impressions.len())
                    .sum();
                self.lost.fetch_add(lost as u64, Ordering::Relaxed);
                log::warn!(target: "split_sync",
                           task = self.id,
                           lost,
                           sdk_version = metadata.sdk_version.as_str();
                           "failed to post impressions, dropping them: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Metrics of one SDK instance, aggregated over a batch.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct AggregatedMetrics {
    pub latencies: Vec<LatenciesDto>,
    pub counters: Vec<CounterDto>,
    pub gauges: Vec<GaugeDto>,
}

/// Sum counters per name, count latencies into buckets per name, and keep the last value of each
/// gauge. Latencies with a bucket out of range are dropped.
pub(crate) fn aggregate_metrics(
    metrics: Vec<StoredMetric>,
) -> Vec<(SdkMetadata, AggregatedMetrics)> {
    #[derive(Default)]
    struct Accumulator {
        latencies: BTreeMap<String, Vec<i64>>,
        counters: BTreeMap<String, i64>,
        gauges: BTreeMap<String, f64>,
    }

    let mut order = Vec::new();
    let mut accumulators: HashMap<SdkMetadata, Accumulator> = HashMap::new();
    for StoredMetric { metadata, metric } in metrics {
        let accumulator = accumulators.entry(metadata.clone()).or_insert_with(|| {
            order.push(metadata);
            Accumulator::default()
        });
        match metric {
            Metric::Counter(counter) => {
                let total = accumulator.counters.entry(counter.name).or_default();
                *total = total.saturating_add(counter.delta);
            }
            Metric::Latency(latency) => {
                if latency.bucket >= LATENCY_BUCKET_COUNT {
                    log::warn!(target: "split_sync",
                               metric = latency.name.as_str(),
                               bucket = latency.bucket;
                               "dropping latency with out of range bucket");
                    continue;
                }
                accumulator
                    .latencies
                    .entry(latency.name)
                    .or_insert_with(|| vec![0; LATENCY_BUCKET_COUNT])[latency.bucket] += 1;
            }
            Metric::Gauge(gauge) => {
                accumulator.gauges.insert(gauge.name, gauge.value);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|metadata| {
            let accumulator = accumulators.remove(&metadata)?;
            let aggregated = AggregatedMetrics {
                latencies: accumulator
                    .latencies
                    .into_iter()
                    .map(|(name, latencies)| LatenciesDto { name, latencies })
                    .collect(),
                counters: accumulator
                    .counters
                    .into_iter()
                    .map(|(name, delta)| CounterDto { name, delta })
                    .collect(),
                gauges: accumulator
                    .gauges
                    .into_iter()
                    .map(|(name, value)| GaugeDto { name, value })
                    .collect(),
            };
            Some((metadata, aggregated))
        })
        .collect()
}

/// Moves one batch of metrics per tick from storage to a [`MetricsRecorder`].
pub struct MetricsRecorderTask {
    storage: Arc<dyn Storage>,
    recorder: Arc<dyn MetricsRecorder>,
    max_per_post: usize,
    lost: AtomicU64,
}

impl MetricsRecorderTask {
    #[allow(missing_docs)]
    pub fn new(
        storage: Arc<dyn Storage>,
        recorder: Arc<dyn MetricsRecorder>,
        max_per_post: usize,
    ) -> MetricsRecorderTask {
        MetricsRecorderTask {
            storage,
            recorder,
            max_per_post,
            lost: AtomicU64::new(0),
        }
    }

    /// Number of aggregated entries (latency series, counters, gauges) dropped because their
    /// post failed.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Pop at most one batch, aggregate it and post it. Returns the number of metrics popped.
    pub fn record(&self) -> Result<usize> {
        let metrics = self.storage.pop_metrics(self.max_per_post)?;
        if metrics.is_empty() {
            return Ok(0);
        }
        let popped = metrics.len();
        log::debug!(target: "split_sync", count = popped; "recording metrics");

        let mut result = Ok(popped);
        let mut track = |posted: Result<()>, entries: usize, kind: &str| {
            if let Err(err) = posted {
                self.lost.fetch_add(entries as u64, Ordering::Relaxed);
                log::warn!(target: "split_sync", kind, lost = entries; "failed to post metrics, dropping them: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        for (metadata, aggregated) in aggregate_metrics(metrics) {
            if !aggregated.latencies.is_empty() {
                track(
                    self.recorder.post_latencies(&metadata, &aggregated.latencies),
                    aggregated.latencies.len(),
                    "latencies",
                );
            }
            if !aggregated.counters.is_empty() {
                track(
                    self.recorder.post_counters(&metadata, &aggregated.counters),
                    aggregated.counters.len(),
                    "counters",
                );
            }
            for gauge in &aggregated.gauges {
                track(self.recorder.post_gauge(&metadata, gauge), 1, "gauge");
            }
        }
        result
    }
}
