//! The error taxonomy for the upload driver.
//!
//! Mirrors the shape of `dropbox-sdk-rust`'s `Error`: every variant wraps its
//! underlying cause behind `#[source]` so callers (and the retry controller)
//! can classify failures without losing the chain.

/// The request/response this error is attached to, when one exists. Used by
/// the retry controller to decide whether a failure is a transient I/O
/// problem versus a programming/logic error with no network activity behind
/// it at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpExchange {
    /// The HTTP method used, e.g. `"PATCH"`.
    pub method: &'static str,

    /// The request URL, when known.
    pub url: Option<String>,

    /// The response status code, when a response was actually received.
    pub status: Option<u16>,
}

impl HttpExchange {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self { method, url: Some(url.into()), status: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// An error occurred in the process of driving an upload. This is different
/// from the server accepting the request but the upload logically failing
/// for some other reason (that case doesn't exist in this protocol: success
/// is solely a function of the acknowledged offset reaching the known size).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A precondition on [`crate::options::UploadRequest`] was violated.
    /// Never retried; always a caller bug.
    #[error("invalid upload configuration: {0}")]
    Configuration(String),

    /// The transport failed to complete a request: network failure, DNS
    /// failure, or cancellation below the HTTP layer.
    #[error(
        "transport failed to complete {} {}: {source}",
        exchange.method,
        exchange.url.as_deref().unwrap_or("<unknown>"),
    )]
    Transport {
        exchange: HttpExchange,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The server returned a non-success status code.
    #[error(
        "server returned HTTP {} for {} {}",
        exchange.status.unwrap_or(0),
        exchange.method,
        exchange.url.as_deref().unwrap_or("<unknown>"),
    )]
    Http {
        exchange: HttpExchange,
        body: String,
    },

    /// The response had a success status but was missing or malformed in a
    /// way the protocol doesn't allow: no `Location` after creation, no
    /// numeric `Upload-Offset`, or a required `Upload-Length` was absent.
    #[error(
        "malformed response to {} {}: {detail}",
        exchange.method,
        exchange.url.as_deref().unwrap_or("<unknown>"),
    )]
    Protocol {
        exchange: HttpExchange,
        detail: String,
    },

    /// The byte source produced a different number of bytes than the
    /// announced upload size. Always terminal: retrying would just loop
    /// forever re-observing the same contradiction.
    #[error("byte source produced {actual} bytes at the final chunk but the announced upload size was {announced}")]
    SizeMismatch { announced: u64, actual: u64 },

    /// A URL-store operation (read or write) failed.
    #[error("URL store operation failed: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The upload was aborted. Never surfaced to `on_error`; used internally
    /// to unwind out of an in-flight suspension point once cancellation is
    /// observed.
    #[error("upload aborted")]
    Aborted,
}

impl Error {
    /// The request/response this error pertains to, if it has one. A `None`
    /// return means this is a logic/configuration error with no network
    /// activity behind it — the retry controller never retries those.
    pub fn exchange(&self) -> Option<&HttpExchange> {
        match self {
            Error::Transport { exchange, .. }
            | Error::Http { exchange, .. }
            | Error::Protocol { exchange, .. } => Some(exchange),
            Error::Configuration(_)
            | Error::SizeMismatch { .. }
            | Error::Storage(_)
            | Error::Aborted => None,
        }
    }

    /// The HTTP status code this error pertains to, if a response was
    /// actually received.
    pub fn http_status(&self) -> Option<u16> {
        self.exchange().and_then(|e| e.status)
    }

    /// The default retry predicate described in spec §4.2: retry unless the
    /// error has no associated request, or the response was a 4xx status
    /// other than 409 (conflict) or 423 (locked).
    pub fn default_should_retry(&self, network_online: bool) -> bool {
        if self.exchange().is_none() {
            // Configuration/SizeMismatch/Storage/Aborted: programming-level
            // errors, not I/O errors. Never retried.
            return false;
        }
        match self.http_status() {
            Some(status) if (400..500).contains(&status) => status == 409 || status == 423,
            _ => network_online,
        }
    }

    pub(crate) fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Storage(Box::new(source))
    }

    pub(crate) fn transport(
        exchange: HttpExchange,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport { exchange, source: Box::new(source) }
    }

    /// Look for an inner error of the given type anywhere within this error,
    /// by walking the chain of [`std::error::Error::source`] recursively
    /// until something matches.
    ///
    /// Grounded on `dropbox-sdk-rust::error::Error::downcast_ref_inner`: a
    /// user-supplied retry predicate can use this to recognize, say, a
    /// specific `std::io::ErrorKind` underneath a `Transport` error without
    /// caring which variant carried it.
    pub fn downcast_ref_inner<E2: std::error::Error + 'static>(&self) -> Option<&E2> {
        let mut inner: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(e) = inner {
            if let Some(e) = e.downcast_ref() {
                return Some(e);
            }
            inner = e.source();
        }
        None
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16) -> Error {
        Error::Http {
            exchange: HttpExchange::new("PATCH", "https://example.test/files/a").with_status(status),
            body: String::new(),
        }
    }

    #[test]
    fn configuration_errors_are_never_retried() {
        let e = Error::Configuration("no endpoint".to_owned());
        assert!(!e.default_should_retry(true));
        assert!(!e.default_should_retry(false));
    }

    #[test]
    fn size_mismatch_is_never_retried() {
        let e = Error::SizeMismatch { announced: 100, actual: 80 };
        assert!(!e.default_should_retry(true));
    }

    #[test]
    fn ordinary_4xx_is_terminal() {
        assert!(!http_error(400).default_should_retry(true));
        assert!(!http_error(404).default_should_retry(true));
    }

    #[test]
    fn conflict_and_locked_are_retryable() {
        assert!(http_error(409).default_should_retry(true));
        assert!(http_error(423).default_should_retry(true));
    }

    #[test]
    fn server_errors_are_retryable_when_online() {
        assert!(http_error(500).default_should_retry(true));
        assert!(!http_error(500).default_should_retry(false));
    }

    #[test]
    fn transport_errors_follow_online_status() {
        let e = Error::transport(HttpExchange::new("HEAD", "https://example.test/x"), std::io::Error::other("boom"));
        assert!(e.default_should_retry(true));
        assert!(!e.default_should_retry(false));
    }

    #[test]
    fn downcast_ref_inner_finds_the_wrapped_io_error() {
        let e = Error::transport(
            HttpExchange::new("HEAD", "https://example.test/x"),
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        );
        let io_err = e.downcast_ref_inner::<std::io::Error>().expect("io::Error should be found in the chain");
        assert_eq!(io_err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn downcast_ref_inner_returns_none_for_unrelated_type() {
        let e = Error::Configuration("bad".to_owned());
        assert!(e.downcast_ref_inner::<std::io::Error>().is_none());
    }
}
