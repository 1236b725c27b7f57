//! The default HTTP client, backed by `reqwest`.
//!
//! Use this if you're not particularly picky about implementation details.
//! If your program already depends on some other HTTP client crate,
//! implement [`crate::transport::HttpClient`] for it instead and disable the
//! `default_client` feature.
//!
//! Generalizes `dropbox-sdk-rust`'s `default_async_client::ReqwestClient`.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use crate::error::{Error, HttpExchange};
use crate::transport::{HttpClient, HttpRequest, HttpResponse, Method, ProgressSink};

const USER_AGENT: &str = concat!("tus-driver/", env!("CARGO_PKG_VERSION"));

/// How large a chunk to report progress after, while streaming a request
/// body to the server.
const PROGRESS_GRANULARITY: usize = 64 * 1024;

/// The default transport. Cheap to construct; holds a single pooled
/// `reqwest::Client` internally.
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self {
            inner: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .expect("building the default reqwest client must not fail"),
        }
    }
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already-configured `reqwest::Client` (e.g. one with custom
    /// timeouts, proxies, or TLS settings) instead of the default.
    pub fn from_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

/// A request under construction, before being handed to [`ReqwestHttpClient::execute`].
pub struct ReqwestRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest for ReqwestRequest {
    fn method(&self) -> Method {
        self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn set_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            existing.1 = value.to_owned();
        } else {
            self.headers.push((name.to_owned(), value.to_owned()));
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HttpClient for ReqwestHttpClient {
    type Request = ReqwestRequest;

    fn new_request(&self, method: Method, url: &str) -> Self::Request {
        ReqwestRequest {
            method,
            url: url.to_owned(),
            headers: Vec::new(),
        }
    }

    fn execute(
        &self,
        request: Self::Request,
        body: Option<Bytes>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send {
        let inner = self.inner.clone();
        async move {
            debug!("{} {}", request.method, request.url);
            let exchange = HttpExchange::new(request.method.as_str(), request.url.clone());
            let method = match request.method {
                Method::Head => reqwest::Method::HEAD,
                Method::Post => reqwest::Method::POST,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            };
            let mut builder = inner.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = body {
                builder = builder.body(progress_body(body, progress));
            }

            let response = builder.send().await.map_err(|e| Error::transport(exchange.clone(), e))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::transport(exchange.with_status(status), e))?;

            Ok(HttpResponse::new(status, headers, body))
        }
    }
}

/// Wrap a body in a stream that reports cumulative progress as it's
/// consumed, so the caller's progress callback fires while the bytes are
/// actually being written to the socket rather than all at once up front.
fn progress_body(body: Bytes, progress: Option<Arc<dyn ProgressSink>>) -> reqwest::Body {
    let sent = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let chunks: Vec<Bytes> = if body.is_empty() {
        vec![body]
    } else {
        body.chunks(PROGRESS_GRANULARITY)
            .map(|c| body.slice_ref(c))
            .collect()
    };
    let stream = futures::stream::iter(chunks).map(move |chunk| {
        let n = sent.fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::SeqCst) + chunk.len() as u64;
        if let Some(progress) = &progress {
            progress.report(n);
        }
        Ok::<_, std::io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}
