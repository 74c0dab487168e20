//! Forwards impression batches to a user-provided HTTP endpoint.
//!
//! Producers hand batches to a [`ListenerQueue`] without blocking. When the queue is full the
//! batch is dropped and counted. A [`ListenerForwarder`] task drains the queue and posts each
//! batch; delivery failures are logged and counted, never retried.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{Receiver, SyncSender, TryRecvError, TrySendError},
    Arc,
};

use serde::Serialize;

use crate::{
    dtos::{ImpressionsDto, SdkMetadata},
    http::build_client,
    Error, Result,
};

/// Number of queued batches a forwarder posts per tick.
pub const LISTENER_BATCHES_PER_TICK: usize = 100;

/// Body posted to the listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerPayload {
    /// Impressions grouped by feature.
    pub impressions: Vec<ImpressionsDto>,
    /// Serialized as top-level `sdkVersion`, `machineIP` and `machineName`.
    #[serde(flatten)]
    pub metadata: SdkMetadata,
}

/// Receiver of impression batches.
pub trait ImpressionListener: Send + Sync {
    #[allow(missing_docs)]
    fn post(&self, payload: &ListenerPayload) -> Result<()>;
}

/// Posts batches as JSON to a fixed URL.
pub struct HttpImpressionListener {
    client: reqwest::blocking::Client,
    endpoint: reqwest::Url,
}

impl HttpImpressionListener {
    #[allow(missing_docs)]
    pub fn new(endpoint: &str, timeout: std::time::Duration) -> Result<HttpImpressionListener> {
        Ok(HttpImpressionListener {
            client: build_client(timeout)?,
            endpoint: reqwest::Url::parse(endpoint).map_err(Error::InvalidBaseUrl)?,
        })
    }
}

impl ImpressionListener for HttpImpressionListener {
    fn post(&self, payload: &ListenerPayload) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status));
        }
        Ok(())
    }
}

/// Sending half of the bounded listener queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ListenerQueue {
    sender: SyncSender<ListenerPayload>,
    dropped: Arc<AtomicU64>,
}

impl ListenerQueue {
    /// Create a queue holding at most `capacity` batches.
    pub fn bounded(capacity: usize) -> (ListenerQueue, Receiver<ListenerPayload>) {
        let (sender, receiver) = std::sync::mpsc::sync_channel(capacity);
        (
            ListenerQueue {
                sender,
                dropped: Arc::default(),
            },
            receiver,
        )
    }

    /// Queue `payload` without blocking. Returns `false` if it was dropped because the queue is
    /// full or the forwarder is gone.
    pub fn enqueue(&self, payload: ListenerPayload) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) | Err(TrySendError::Disconnected(payload)) => {
                let count: usize = payload
                    .impressions
                    .iter()
                    .map(|dto| dto.key_impressions.len())
                    .sum();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "split_sync", impressions = count; "impression listener queue is full, dropping batch");
                false
            }
        }
    }

    /// Number of batches dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains a listener queue into an [`ImpressionListener`].
pub struct ListenerForwarder {
    receiver: Receiver<ListenerPayload>,
    listener: Arc<dyn ImpressionListener>,
    batches_per_tick: usize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl ListenerForwarder {
    #[allow(missing_docs)]
    pub fn new(
        receiver: Receiver<ListenerPayload>,
        listener: Arc<dyn ImpressionListener>,
        batches_per_tick: usize,
    ) -> ListenerForwarder {
        ListenerForwarder {
            receiver,
            listener,
            batches_per_tick,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Post up to `batches_per_tick` queued batches. Returns the number of batches taken from
    /// the queue, whether or not their delivery succeeded.
    pub fn forward(&self) -> usize {
        let mut taken = 0;
        while taken < self.batches_per_tick {
            let payload = match self.receiver.try_recv() {
                Ok(payload) => payload,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::debug!(target: "split_sync", "impression listener queue is closed");
                    break;
                }
            };
            taken += 1;

            match self.listener.post(&payload) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!(target: "split_sync", "failed to post impressions to listener: {err}");
                }
            }
        }
        taken
    }

    /// Batches posted successfully.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Batches whose post failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::Ordering, Arc},
        time::Duration,
    };

    use serde_json::json;

    use super::{
        HttpImpressionListener, ImpressionListener, ListenerForwarder, ListenerPayload,
        ListenerQueue,
    };
    use crate::{
        http::testing::serve_once, recorder::group_impressions, testing::impression,
        testing::FakeListener,
    };

    fn payload(feature: &str, n: i64) -> ListenerPayload {
        let (metadata, impressions) = group_impressions(vec![impression("go-1.0", feature, n)])
            .pop()
            .unwrap();
        ListenerPayload {
            impressions,
            metadata,
        }
    }

    #[test]
    fn payload_flattens_metadata() {
        assert_eq!(
            serde_json::to_value(payload("checkout", 1)).unwrap(),
            json!({
                "impressions": [{
                    "testName": "checkout",
                    "keyImpressions": [{
                        "keyName": "user-1",
                        "treatment": "on",
                        "time": 1,
                        "changeNumber": 1,
                        "label": "default rule"
                    }]
                }],
                "sdkVersion": "go-1.0",
                "machineIP": "10.0.0.1",
                "machineName": "host"
            })
        );
    }

    #[test]
    fn full_queue_drops_batches() {
        let (queue, receiver) = ListenerQueue::bounded(2);

        assert!(queue.enqueue(payload("a", 1)));
        assert!(queue.clone().enqueue(payload("a", 2)));
        assert!(!queue.enqueue(payload("a", 3)));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(receiver.try_iter().count(), 2);
    }

    #[test]
    fn forwarder_drains_a_bounded_number_per_tick() {
        let (queue, receiver) = ListenerQueue::bounded(10);
        for n in 0..5 {
            queue.enqueue(payload("a", n));
        }
        let listener = Arc::new(FakeListener::default());
        let forwarder = ListenerForwarder::new(receiver, listener.clone(), 3);

        assert_eq!(forwarder.forward(), 3);
        assert_eq!(forwarder.forward(), 2);
        assert_eq!(forwarder.forward(), 0);

        let received = listener.received.lock().unwrap();
        let times: Vec<i64> = received
            .iter()
            .map(|payload| payload.impressions[0].key_impressions[0].time)
            .collect();
        assert_eq!(times, vec![0, 1, 2, 3, 4]);
        assert_eq!(forwarder.delivered(), 5);
    }

    #[test]
    fn forwarder_counts_failures_without_retrying() {
        let (queue, receiver) = ListenerQueue::bounded(10);
        queue.enqueue(payload("a", 1));
        queue.enqueue(payload("a", 2));
        let listener = Arc::new(FakeListener::default());
        listener.failing.store(true, Ordering::SeqCst);
        let forwarder = ListenerForwarder::new(receiver, listener.clone(), 10);

        assert_eq!(forwarder.forward(), 2);
        assert_eq!(forwarder.failed(), 2);

        listener.failing.store(false, Ordering::SeqCst);
        assert_eq!(forwarder.forward(), 0);
        assert!(listener.received.lock().unwrap().is_empty());
    }

    #[test]
    fn forwarder_survives_a_closed_queue() {
        let (queue, receiver) = ListenerQueue::bounded(1);
        queue.enqueue(payload("a", 1));
        drop(queue);
        let forwarder = ListenerForwarder::new(receiver, Arc::new(FakeListener::default()), 10);

        assert_eq!(forwarder.forward(), 1);
        assert_eq!(forwarder.forward(), 0);
    }

    #[test]
    fn http_listener_posts_json() {
        let (url, server) = serve_once(200, "");
        let listener =
            HttpImpressionListener::new(&format!("{url}/impressions"), Duration::from_secs(5))
                .unwrap();

        listener.post(&payload("checkout", 1)).unwrap();
        let request = server.join().unwrap();

        assert_eq!(request.request_line, "POST /impressions HTTP/1.1");
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["sdkVersion"], "go-1.0");
        assert_eq!(body["impressions"][0]["testName"], "checkout");
    }
}
