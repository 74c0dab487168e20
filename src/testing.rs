//! Fakes of the agent's collaborators.
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use serde_json::json;

use crate::{
    dtos::{
        ChangeNumber, CounterDto, GaugeDto, ImpressionsDto, KeyImpression, LatenciesDto,
        SdkMetadata, SegmentChanges, Split, SplitChanges, StoredImpression,
    },
    fetcher::{SegmentFetcher, SplitFetcher},
    listener::{ImpressionListener, ListenerPayload},
    recorder::{ImpressionsRecorder, MetricsRecorder},
    Error, Result,
};

pub fn split(name: &str, change_number: ChangeNumber, segments: &[&str]) -> Split {
    let matchers: Vec<_> = segments
        .iter()
        .map(|segment| {
            json!({
                "matcherType": "IN_SEGMENT",
                "userDefinedSegmentMatcherData": {"segmentName": segment}
            })
        })
        .collect();
    serde_json::from_value(json!({
        "name": name,
        "changeNumber": change_number,
        "status": "ACTIVE",
        "conditions": [{"matcherGroup": {"matchers": matchers}}]
    }))
    .unwrap()
}

pub fn archived(name: &str, change_number: ChangeNumber) -> Split {
    serde_json::from_value(json!({
        "name": name,
        "changeNumber": change_number,
        "status": "ARCHIVED"
    }))
    .unwrap()
}

pub fn impression(sdk_version: &str, feature: &str, n: i64) -> StoredImpression {
    StoredImpression {
        metadata: SdkMetadata {
            sdk_version: sdk_version.to_owned(),
            machine_ip: "10.0.0.1".to_owned(),
            machine_name: "host".to_owned(),
        },
        feature: feature.to_owned(),
        impression: KeyImpression {
            key_name: format!("user-{n}"),
            bucketing_key: None,
            treatment: "on".to_owned(),
            time: n,
            change_number: Some(1),
            label: Some("default rule".to_owned()),
        },
    }
}

/// Answers split fetches from a script. An exhausted script answers "no changes".
#[derive(Default)]
pub struct ScriptedSplitFetcher {
    responses: Mutex<VecDeque<Result<SplitChanges>>>,
    pub calls: Mutex<Vec<ChangeNumber>>,
}

impl ScriptedSplitFetcher {
    pub fn new(responses: impl IntoIterator<Item = Result<SplitChanges>>) -> Self {
        ScriptedSplitFetcher {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::default(),
        }
    }
}

impl SplitFetcher for ScriptedSplitFetcher {
    fn fetch_splits(&self, since: ChangeNumber) -> Result<SplitChanges> {
        self.calls.lock().unwrap().push(since);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SplitChanges {
                splits: Vec::new(),
                since,
                till: since,
            }))
    }
}

/// Serves every segment from a fixed membership, as a single delta from `-1` to `till`.
#[derive(Default)]
pub struct StaticSegmentFetcher {
    pub segments: HashMap<String, (Vec<String>, ChangeNumber)>,
    pub failing: Vec<String>,
}

impl SegmentFetcher for StaticSegmentFetcher {
    fn fetch_segment(&self, name: &str, since: ChangeNumber) -> Result<SegmentChanges> {
        if self.failing.iter().any(|failing| failing == name) {
            return Err(Error::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY));
        }
        let (keys, till) = self.segments.get(name).cloned().unwrap_or_default();
        let added = if since < till { keys } else { Vec::new() };
        Ok(SegmentChanges {
            name: name.to_owned(),
            added,
            removed: Vec::new(),
            since,
            till: till.max(since),
        })
    }
}

/// Records posted impressions; fails while `failing` is set.
#[derive(Default)]
pub struct FakeImpressionsRecorder {
    pub posted: Mutex<Vec<(SdkMetadata, Vec<ImpressionsDto>)>>,
    pub failing: std::sync::atomic::AtomicBool,
}

impl ImpressionsRecorder for FakeImpressionsRecorder {
    fn post_impressions(
        &self,
        metadata: &SdkMetadata,
        impressions: &[ImpressionsDto],
    ) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::UnexpectedStatus(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        }
        self.posted
            .lock()
            .unwrap()
            .push((metadata.clone(), impressions.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetricsRecorder {
    pub latencies: Mutex<Vec<(SdkMetadata, Vec<LatenciesDto>)>>,
    pub counters: Mutex<Vec<(SdkMetadata, Vec<CounterDto>)>>,
    pub gauges: Mutex<Vec<(SdkMetadata, GaugeDto)>>,
    pub failing: std::sync::atomic::AtomicBool,
}

impl FakeMetricsRecorder {
    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::UnexpectedStatus(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        }
        Ok(())
    }
}

impl MetricsRecorder for FakeMetricsRecorder {
    fn post_latencies(&self, metadata: &SdkMetadata, latencies: &[LatenciesDto]) -> Result<()> {
        self.check()?;
        self.latencies
            .lock()
            .unwrap()
            .push((metadata.clone(), latencies.to_vec()));
        Ok(())
    }

    fn post_counters(&self, metadata: &SdkMetadata, counters: &[CounterDto]) -> Result<()> {
        self.check()?;
        self.counters
            .lock()
            .unwrap()
            .push((metadata.clone(), counters.to_vec()));
        Ok(())
    }

    fn post_gauge(&self, metadata: &SdkMetadata, gauge: &GaugeDto) -> Result<()> {
        self.check()?;
        self.gauges
            .lock()
            .unwrap()
            .push((metadata.clone(), gauge.clone()));
        Ok(())
    }
}

/// Records listener payloads; fails while `failing` is set.
#[derive(Default)]
pub struct FakeListener {
    pub received: Mutex<Vec<ListenerPayload>>,
    pub failing: std::sync::atomic::AtomicBool,
}

impl ImpressionListener for FakeListener {
    fn post(&self, payload: &ListenerPayload) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::UnexpectedStatus(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        }
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
