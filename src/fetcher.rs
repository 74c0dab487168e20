//! Clients that pull split and segment changes from the central service.
//!
//! Every call is parameterized by the last applied change number. A response whose `till` equals
//! the requested `since` carries nothing to apply. Failures are returned to the caller and never
//! touch any state; retrying is up to the caller's schedule.
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    dtos::{ChangeNumber, SegmentChanges, SplitChanges},
    http::{build_client, check_status, endpoint, sdk_headers, HttpClientConfig},
    Error, Result,
};

/// Source of split changes.
pub trait SplitFetcher: Send + Sync {
    /// Fetch split changes newer than `since`.
    fn fetch_splits(&self, since: ChangeNumber) -> Result<SplitChanges>;
}

/// Source of segment membership deltas.
pub trait SegmentFetcher: Send + Sync {
    /// Fetch the delta of segment `name` relative to `since`.
    fn fetch_segment(&self, name: &str, since: ChangeNumber) -> Result<SegmentChanges>;
}

/// Fetches splits and segments from the central service over HTTP.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: HttpClientConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    #[allow(missing_docs)]
    pub fn new(config: HttpClientConfig) -> Result<HttpFetcher> {
        Ok(HttpFetcher {
            client: build_client(config.timeout)?,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
        since: ChangeNumber,
    ) -> Result<T> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let mut url = endpoint(&self.config.base_url, segments)?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string());

        log::debug!(target: "split_sync", url:% = url; "fetching changes");
        let response = self
            .client
            .get(url)
            .headers(sdk_headers(&self.config.api_key, &self.config.metadata))
            .send()?;
        let response = check_status(response, &self.unauthorized)?;

        // Decode from bytes so that a bad body is reported as a malformed response rather than a
        // network error.
        let body = response.bytes()?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl SplitFetcher for HttpFetcher {
    fn fetch_splits(&self, since: ChangeNumber) -> Result<SplitChanges> {
        self.get(&["splitChanges"], since)
    }
}

impl SegmentFetcher for HttpFetcher {
    fn fetch_segment(&self, name: &str, since: ChangeNumber) -> Result<SegmentChanges> {
        self.get(&["segmentChanges", name], since)
    }
}
