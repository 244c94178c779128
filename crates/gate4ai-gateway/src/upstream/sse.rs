use std::time::Duration;

use futures::{StreamExt, stream::BoxStream};
use http::header::{ACCEPT, CONTENT_TYPE};
use sse_stream::{Error as SseError, Sse, SseStream};
use url::Url;

use crate::{SessionError, headers::ComposedHeaders, timeouts::Timeouts};

pub(crate) type SseEvents = BoxStream<'static, Result<Sse, SseError>>;

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Why a connect attempt failed: `Fatal` stops the session (auth rejection,
/// DNS, refused), `Transient` feeds the backoff loop.
#[derive(Debug)]
pub(crate) enum ConnectError {
    Fatal(SessionError),
    Transient(String),
}

/// Opens the SSE read side of an upstream session. One connector per
/// session; reconnects reuse the same URL and header set.
pub(crate) struct SseConnector {
    http: reqwest::Client,
    url: Url,
    headers: ComposedHeaders,
}

impl SseConnector {
    pub fn new(http: reqwest::Client, url: Url, headers: ComposedHeaders) -> Self {
        Self { http, url, headers }
    }

    pub async fn connect(&self) -> Result<SseEvents, ConnectError> {
        let builder = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, EVENT_STREAM_MIME);
        let response = self
            .headers
            .apply(builder)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
            return Err(ConnectError::Fatal(SessionError::Rejected(status.as_u16())));
        }
        if !status.is_success() {
            return Err(ConnectError::Transient(format!("HTTP {status}")));
        }

        match response.headers().get(CONTENT_TYPE) {
            Some(ct) if ct.as_bytes().starts_with(EVENT_STREAM_MIME.as_bytes()) => {}
            other => {
                let got = other.and_then(|v| v.to_str().ok()).map(String::from);
                return Err(ConnectError::Fatal(SessionError::UnexpectedContentType(
                    got,
                )));
            }
        }

        Ok(SseStream::from_byte_stream(response.bytes_stream()).boxed())
    }
}

fn classify(error: reqwest::Error) -> ConnectError {
    // connect-layer failures (DNS, refused) never recover on their own
    if error.is_connect() {
        ConnectError::Fatal(SessionError::Connect(error.without_url().to_string()))
    } else {
        ConnectError::Transient(error.without_url().to_string())
    }
}

/// Exponential reconnect backoff, doubling up to a ceiling.
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(timeouts: &Timeouts) -> Self {
        Self {
            min: timeouts.sse_retry_min,
            max: timeouts.sse_retry_max,
            next: timeouts.sse_retry_min,
        }
    }

    /// The delay to sleep before the next attempt.
    pub fn delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }

    /// Call after a successful connect so the next failure starts small.
    pub fn reset(&mut self) {
        self.next = self.min;
    }
}
