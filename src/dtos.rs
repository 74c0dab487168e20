//! Data model shared by the fetchers, storage backends and recorders. Field names follow the
//! central service's JSON format.
use derive_more::From;
use serde::{Deserialize, Serialize};

/// Version marker for a split set or a segment.
pub type ChangeNumber = i64;

/// `since` value used when a resource has never been synchronized.
pub const INITIAL_CHANGE_NUMBER: ChangeNumber = -1;

/// Number of latency buckets SDKs report into.
pub const LATENCY_BUCKET_COUNT: usize = 23;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum SplitStatus {
    #[default]
    Active,
    Archived,
}

/// A feature flag definition.
///
/// The evaluation ruleset is not interpreted by the synchronizer, so everything except the
/// identifying fields is kept as raw JSON in `definition` and written back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    /// Unique split name.
    pub name: String,
    /// Version of this definition.
    pub change_number: ChangeNumber,
    /// Archived splits are removed from the active set.
    #[serde(default)]
    pub status: SplitStatus,
    /// Remaining fields of the definition (conditions, traffic type, default treatment, ...).
    #[serde(flatten)]
    pub definition: serde_json::Map<String, serde_json::Value>,
}

impl Split {
    #[allow(missing_docs)]
    pub fn is_archived(&self) -> bool {
        self.status == SplitStatus::Archived
    }

    /// Names of the segments referenced by `IN_SEGMENT` matchers of this split.
    pub fn segment_names(&self) -> Vec<&str> {
        let Some(conditions) = self
            .definition
            .get("conditions")
            .and_then(serde_json::Value::as_array)
        else {
            return Vec::new();
        };

        conditions
            .iter()
            .filter_map(|condition| condition.pointer("/matcherGroup/matchers")?.as_array())
            .flatten()
            .filter_map(|matcher| {
                matcher
                    .pointer("/userDefinedSegmentMatcherData/segmentName")?
                    .as_str()
            })
            .collect()
    }
}

/// Response of `GET /splitChanges?since=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct SplitChanges {
    #[serde(default)]
    pub splits: Vec<Split>,
    pub since: ChangeNumber,
    pub till: ChangeNumber,
}

/// Response of `GET /segmentChanges/{name}?since=N`. A delta against `since`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: ChangeNumber,
    pub till: ChangeNumber,
}

/// Identifies the SDK instance that produced an impression or a metric. Sent to the central
/// service as request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SdkMetadata {
    #[serde(rename = "sdkVersion")]
    pub sdk_version: String,
    #[serde(rename = "machineIP")]
    pub machine_ip: String,
    #[serde(rename = "machineName")]
    pub machine_name: String,
}

/// One evaluation result of one feature for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct KeyImpression {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    pub treatment: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<ChangeNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Impression as buffered in storage, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct StoredImpression {
    pub metadata: SdkMetadata,
    pub feature: String,
    pub impression: KeyImpression,
}

/// Impressions of a single feature, as posted to `/testImpressions/bulk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ImpressionsDto {
    pub test_name: String,
    pub key_impressions: Vec<KeyImpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Counter {
    pub name: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Latency {
    pub name: String,
    /// Index into the [`LATENCY_BUCKET_COUNT`] latency buckets.
    pub bucket: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
}

/// A single metric observation reported by an SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(tag = "type", rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum Metric {
    Counter(Counter),
    Latency(Latency),
    Gauge(Gauge),
}

/// Metric as buffered in storage, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StoredMetric {
    pub metadata: SdkMetadata,
    pub metric: Metric,
}

/// Body item of `POST /metrics/times`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct LatenciesDto {
    pub name: String,
    pub latencies: Vec<i64>,
}

/// Body item of `POST /metrics/counters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CounterDto {
    pub name: String,
    pub delta: i64,
}

/// Body of `POST /metrics/gauge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GaugeDto {
    pub name: String,
    pub value: f64,
}
