//! Pieces shared by every HTTP client of the agent.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{
    blocking::Response,
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    StatusCode, Url,
};

use crate::{dtos::SdkMetadata, Error, Result};

/// Connection settings of a client talking to the central service.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL, e.g. [`DEFAULT_SDK_URL`](crate::config::DEFAULT_SDK_URL).
    pub base_url: String,
    #[allow(missing_docs)]
    pub api_key: String,
    /// Applies to the whole request, including reading the body.
    pub timeout: Duration,
    /// Identity of the agent itself, sent with every request.
    pub metadata: SdkMetadata,
}

impl HttpClientConfig {
    /// `SdkMetadata` describing this agent process.
    pub fn agent_metadata() -> SdkMetadata {
        SdkMetadata {
            sdk_version: format!("split-sync-{}", env!("CARGO_PKG_VERSION")),
            machine_ip: std::env::var("SPLIT_SYNC_MACHINE_IP").unwrap_or_else(|_| "NA".to_owned()),
            machine_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "NA".to_owned()),
        }
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?)
}

/// Headers identifying the API key and the SDK instance the request is made for.
pub(crate) fn sdk_headers(api_key: &str, metadata: &SdkMetadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let values = [
        (AUTHORIZATION.as_str(), format!("Bearer {api_key}")),
        ("SplitSDKVersion", metadata.sdk_version.clone()),
        ("SplitSDKMachineIP", metadata.machine_ip.clone()),
        ("SplitSDKMachineName", metadata.machine_name.clone()),
    ];
    for (name, value) in values {
        // Skip values that cannot be sent as a header (e.g., non-ASCII hostnames).
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
                    headers.insert(name, value);
                }
            }
            Err(_) => {
                log::warn!(target: "split_sync", header = name; "skipping header with invalid value");
            }
        }
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Append path segments to `base`, escaping each of them.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).map_err(Error::InvalidBaseUrl)?;
    url.path_segments_mut()
        .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map non-success statuses to errors. A 401/403 sets `unauthorized`, so callers can stop
/// issuing requests with a key the server has rejected.
pub(crate) fn check_status(response: Response, unauthorized: &AtomicBool) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        log::warn!(target: "split_sync", "client is not authorized. Check your API key");
        unauthorized.store(true, Ordering::Relaxed);
        return Err(Error::Unauthorized);
    }
    log::warn!(target: "split_sync", status = status.as_u16(); "received non-success response");
    Err(Error::UnexpectedStatus(status))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A one-shot HTTP server for exercising clients against canned responses.
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread::JoinHandle,
    };

    /// A request as received by [`serve_once`].
    #[derive(Debug)]
    pub struct RecordedRequest {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl RecordedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    /// Accept one connection, answer with `status` and `body`, and return the request.
    pub fn serve_once(status: u16, body: &str) -> (String, JoinHandle<RecordedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let body = body.to_owned();

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((key, value)) = line.split_once(':') {
                    headers.push((key.trim().to_owned(), value.trim().to_owned()));
                }
            }
            let length: usize = headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                .map(|(_, value)| value.parse().unwrap())
                .unwrap_or(0);
            let mut request_body = vec![0; length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status} STATUS\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();

            RecordedRequest {
                request_line: request_line.trim_end().to_owned(),
                headers,
                body: String::from_utf8(request_body).unwrap(),
            }
        });

        (address, handle)
    }
}
