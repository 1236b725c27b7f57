//! The upload request: every option the driver consults, assembled through a
//! builder in the same style as `dropbox-sdk-rust`'s
//! `files::UploadArg::new().with_mode(...)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::protocol::Protocol;
use crate::retry::RetryDelays;

/// The total size of the upload, or a marker that it isn't known yet
/// (deferred-length mode). Consolidates the source's separate `uploadSize`
/// + `uploadLengthDeferred` fields into one Rust enum, since the two are
/// mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    Known(u64),
    Deferred,
}

impl UploadLength {
    pub fn is_deferred(self) -> bool {
        matches!(self, UploadLength::Deferred)
    }

    pub fn known(self) -> Option<u64> {
        match self {
            UploadLength::Known(n) => Some(n),
            UploadLength::Deferred => None,
        }
    }
}

/// How large each chunk should be. `Unbounded` means the whole remaining
/// body goes out in a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    Bytes(u64),
    Unbounded,
}

/// Info handed to `on_before_request`/`on_after_response` hooks: enough to
/// inspect (not rebuild) the request that's about to fire or just fired.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

type BeforeRequestHook = Arc<dyn Fn(&RequestInfo) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;
type AfterResponseHook =
    Arc<dyn Fn(&RequestInfo, &ResponseInfo) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;
/// A host-supplied override of the default retry classification: given the
/// error, the number of attempts since the last recorded progress, and
/// whether the network is reachable, decide whether to retry. Matches
/// spec.md §6's `onShouldRetry(err, attempt, options) -> bool`.
pub type ShouldRetryHook = Arc<dyn Fn(&crate::error::Error, usize, bool) -> bool + Send + Sync>;

/// Event callbacks. All are optional; a driver with none set still runs
/// correctly, it just doesn't tell anyone anything.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_progress: Option<Arc<dyn Fn(u64, Option<u64>) + Send + Sync>>,
    pub on_chunk_complete: Option<Arc<dyn Fn(u64, u64, Option<u64>) + Send + Sync>>,
    pub on_success: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&crate::error::Error) + Send + Sync>>,
    pub on_upload_url_available: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_before_request: Option<BeforeRequestHook>,
    pub on_after_response: Option<AfterResponseHook>,
    pub on_should_retry: Option<ShouldRetryHook>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Everything the driver needs to run one logical upload, built up through
/// `with_*` methods starting from [`UploadRequest::new`].
///
/// Generic over the four capability traits so that calling the driver
/// involves no boxing or dynamic dispatch — mirrors how `dropbox-sdk-rust`'s
/// client methods are generic over `HttpClient` rather than taking a trait
/// object.
#[derive(Clone)]
pub struct UploadRequest<T, S, U, F> {
    pub(crate) transport: Arc<T>,
    pub(crate) source: Arc<S>,
    pub(crate) url_store: Arc<U>,
    pub(crate) fingerprinter: Arc<F>,

    pub(crate) endpoint: Option<url::Url>,
    pub(crate) upload_url: Option<String>,
    pub(crate) metadata: BTreeMap<String, Vec<u8>>,
    pub(crate) upload_length: Option<UploadLength>,
    pub(crate) chunk_size: ChunkSize,
    pub(crate) retry_delays: RetryDelays,
    pub(crate) parallel_uploads: usize,
    pub(crate) parallel_boundaries: Option<Vec<(u64, u64)>>,
    pub(crate) store_fingerprint: bool,
    pub(crate) remove_fingerprint_on_success: bool,
    pub(crate) override_patch_method: bool,
    pub(crate) upload_data_during_creation: bool,
    pub(crate) add_request_id: bool,
    pub(crate) terminate_on_abort: bool,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) protocol: Protocol,
    pub(crate) callbacks: Callbacks,
}

impl<T, S, U, F> UploadRequest<T, S, U, F> {
    pub fn new(transport: Arc<T>, source: Arc<S>, url_store: Arc<U>, fingerprinter: Arc<F>) -> Self {
        Self {
            transport,
            source,
            url_store,
            fingerprinter,
            endpoint: None,
            upload_url: None,
            metadata: BTreeMap::new(),
            upload_length: None,
            chunk_size: ChunkSize::Unbounded,
            retry_delays: RetryDelays::default(),
            parallel_uploads: 1,
            parallel_boundaries: None,
            store_fingerprint: true,
            remove_fingerprint_on_success: false,
            override_patch_method: false,
            upload_data_during_creation: false,
            add_request_id: false,
            terminate_on_abort: false,
            headers: Vec::new(),
            protocol: Protocol::default(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: url::Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_upload_length(mut self, length: UploadLength) -> Self {
        self.upload_length = Some(length);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry_delays(mut self, delays: RetryDelays) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn with_parallel_uploads(mut self, n: usize) -> Self {
        self.parallel_uploads = n.max(1);
        self
    }

    pub fn with_parallel_boundaries(mut self, boundaries: Vec<(u64, u64)>) -> Self {
        self.parallel_boundaries = Some(boundaries);
        self
    }

    pub fn with_store_fingerprint(mut self, value: bool) -> Self {
        self.store_fingerprint = value;
        self
    }

    pub fn with_remove_fingerprint_on_success(mut self, value: bool) -> Self {
        self.remove_fingerprint_on_success = value;
        self
    }

    pub fn with_override_patch_method(mut self, value: bool) -> Self {
        self.override_patch_method = value;
        self
    }

    pub fn with_upload_data_during_creation(mut self, value: bool) -> Self {
        self.upload_data_during_creation = value;
        self
    }

    pub fn with_add_request_id(mut self, value: bool) -> Self {
        self.add_request_id = value;
        self
    }

    pub fn with_terminate_on_abort(mut self, value: bool) -> Self {
        self.terminate_on_abort = value;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}
