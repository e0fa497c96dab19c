//! HTTP access to the asset service.
//!
//! The engine only needs ranged GETs and POSTs, expressed as a trait so tests
//! and embedders can substitute their own transport.

use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, RANGE};

use crate::error::{Error, Result};

/// Content type for binary structured-data bodies.
pub const LLSD_BINARY_CONTENT_TYPE: &str = "application/llsd+binary";

/// Future type for transport operations.
pub type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>>;

/// A completed HTTP exchange. Non-success statuses are not errors here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues requests against the asset service.
///
/// `Err` is reserved for failures with no HTTP status, such as timeouts or
/// refused connections.
pub trait Transport: Send + Sync {
    /// GET `url`, asking for the bytes in `range`.
    fn get_range(&self, url: &str, range: Range<u64>) -> ResponseFuture<'_>;

    /// POST `body` to `url`.
    fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> ResponseFuture<'_>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    /// Create a transport with a custom HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn finish(url: String, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = request.send().await.map_err(|e| Error::Http {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| Error::Http {
            url,
            message: e.to_string(),
        })?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

impl Transport for HttpTransport {
    fn get_range(&self, url: &str, range: Range<u64>) -> ResponseFuture<'_> {
        tracing::debug!(url, start = range.start, end = range.end, "fetching");
        let request = self
            .http
            .get(url)
            .header(ACCEPT, "application/octet-stream")
            .header(
                RANGE,
                format!("bytes={}-{}", range.start, range.end.saturating_sub(1)),
            );
        Box::pin(Self::finish(url.to_string(), request))
    }

    fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> ResponseFuture<'_> {
        tracing::debug!(url, bytes = body.len(), "posting");
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, LLSD_BINARY_CONTENT_TYPE)
            .body(body);
        Box::pin(Self::finish(url.to_string(), request))
    }
}

/// How the engine should treat a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classified {
    /// Usable bytes for the requested range.
    Data(Vec<u8>),
    /// Authoritative absence: an empty success body, or 404/410.
    NotFound,
    /// Transient; try again after the retry delay.
    Retry,
    /// Anything else. Logged and abandoned.
    Failed,
}

/// Sort a fetch outcome into the engine's failure taxonomy.
///
/// `requested` is the range asked for. Servers that ignore the `Range` header
/// answer 200 with the whole asset; the requested slice is cut out of it.
/// `allow_short` accepts bodies shorter than the range, which is normal for
/// header fetches of small assets.
pub(crate) fn classify(
    url: &str,
    result: Result<HttpResponse>,
    requested: &Range<u64>,
    allow_short: bool,
) -> Classified {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url, error = %e, "transport error, will retry");
            return Classified::Retry;
        }
    };

    match response.status {
        200..=299 => {}
        404 | 410 => return Classified::NotFound,
        408 | 429 | 500..=599 => {
            tracing::debug!(url, status = response.status, "transient status, will retry");
            return Classified::Retry;
        }
        status => {
            tracing::warn!(url, status, "unhandled status");
            return Classified::Failed;
        }
    }

    let mut body = response.body;
    if body.is_empty() {
        return Classified::NotFound;
    }

    let wanted = usize::try_from(requested.end - requested.start).unwrap_or(usize::MAX);
    if response.status == 200 && requested.start > 0 && body.len() as u64 >= requested.end {
        // Range ignored; the body is the whole asset.
        let (Ok(start), Ok(end)) = (
            usize::try_from(requested.start),
            usize::try_from(requested.end),
        ) else {
            return Classified::Failed;
        };
        body = body[start..end].to_vec();
    } else if body.len() > wanted {
        body.truncate(wanted);
    }

    if body.len() < wanted && !allow_short {
        tracing::warn!(
            url,
            received = body.len(),
            expected = wanted,
            "truncated response"
        );
        return Classified::Failed;
    }

    Classified::Data(body)
}
