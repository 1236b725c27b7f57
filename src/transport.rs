//! Everything needed to implement your own HTTP client.
//!
//! Generalizes `dropbox-sdk-rust`'s `async_client_trait::HttpClient`: a
//! small, swappable capability trait with a concrete request builder and a
//! concrete response, instead of being tied to one HTTP crate. Implement
//! [`HttpClient`] and [`HttpRequest`] against whatever HTTP stack you
//! already use; [`crate::default_client::ReqwestHttpClient`] is provided
//! for everyone else, behind the `default_client` feature.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;

/// The HTTP method of a request. tus only ever needs these five.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Head,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A builder for a single outgoing request. Implementations are expected to
/// be cheap, owned values (no borrowing from the client) since the driver
/// constructs one per attempt, including retries.
pub trait HttpRequest: Send + 'static {
    /// The method this request will be sent with.
    fn method(&self) -> Method;

    /// The URL this request will be sent to.
    fn url(&self) -> &str;

    /// Set (or overwrite) a header.
    fn set_header(&mut self, name: &str, value: &str);

    /// Read back a header previously set on this request, for hooks that
    /// want to inspect what's about to be sent.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Reports cumulative bytes sent for the request body currently in flight.
/// Invoked zero or more times per request, strictly increasing, and at most
/// once with a value equal to the full body length.
pub trait ProgressSink: Send + Sync {
    fn report(&self, bytes_sent: u64);
}

impl<F: Fn(u64) + Send + Sync> ProgressSink for F {
    fn report(&self, bytes_sent: u64) {
        self(bytes_sent)
    }
}

/// The response to a request: status code, headers, and the full body (tus
/// response bodies are small; none of this protocol streams a response).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// Case-insensitive header lookup, matching HTTP semantics.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The base HTTP client capability. Build a request with [`new_request`],
/// then hand it (plus an optional body and progress sink) to [`execute`].
///
/// Modeled on `async_client_trait::HttpClient`: a native `impl Future`
/// return instead of the `async-trait` macro, so implementors pay no boxing
/// cost and callers get static dispatch.
pub trait HttpClient: Send + Sync {
    /// The concrete request type this client builds and accepts.
    type Request: HttpRequest;

    /// Start building a request for the given method and URL.
    fn new_request(&self, method: Method, url: &str) -> Self::Request;

    /// Send the request, with an optional body, reporting progress as the
    /// body is sent if a sink is given. Returns the response for *any*
    /// status code the server returns — classifying 2xx vs 4xx vs 5xx is
    /// the driver's job, not the transport's. Only genuine transport-level
    /// failure (no response at all) is an `Err`.
    fn execute(
        &self,
        request: Self::Request,
        body: Option<Bytes>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}
