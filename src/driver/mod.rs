//! The single-upload engine (component F) and the state machine that ties
//! every other component together: validate options, resolve size and
//! fingerprint, create or resume the server-side resource, then stream
//! chunks until the acknowledged offset reaches the known size.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, HttpExchange};
use crate::fingerprint::Fingerprinter;
use crate::options::{ChunkSize, UploadLength, UploadRequest};
use crate::protocol::{self, Protocol};
use crate::request;
use crate::retry::{CallbackPredicate, DefaultRetryPredicate, RetryController, ShouldRetry};
use crate::source::ByteSource;
use crate::store::{PersistedRecord, UrlStore, UrlStoreKey};
use crate::transport::{HttpClient, HttpResponse, Method, ProgressSink};

pub mod parallel;

/// Where the engine currently is in the state machine described in the
/// component design. Exposed for introspection/diagnostics; the driver
/// doesn't expect callers to match on it to drive behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Idle,
    Validating,
    Opening,
    Creating,
    Resuming,
    Sending,
    Done,
    Aborted,
    Error,
}

#[derive(Debug, Default)]
struct UploadState {
    phase: DriverState,
    url: Option<String>,
    offset: u64,
    size: Option<u64>,
    fingerprint: Option<String>,
    url_store_key: Option<UrlStoreKey>,
    retry_attempt: usize,
    offset_before_retry: u64,
    parallel_urls: Option<Vec<Option<String>>>,
}

/// The outcome of a single `HEAD` against a previously-known resource URL.
enum ResumeOutcome {
    /// `offset == size`; the upload is already complete.
    Done,
    /// Proceed to the chunk-sending loop.
    Continue,
    /// The stored URL was rejected by the server; clear it and create a new
    /// resource instead, without consuming a retry-schedule slot.
    RetryAsCreate,
}

/// Drives one logical upload from its current [`UploadState`] through
/// creation or resumption, chunked transmission, and completion.
///
/// Generic over the four capability traits rather than boxed, so a call to
/// `start()` involves no dynamic dispatch; this mirrors how
/// `dropbox-sdk-rust`'s generated client methods are generic over
/// `HttpClient` instead of taking `Box<dyn HttpClient>`.
pub struct Driver<T, S, U, F> {
    request: UploadRequest<T, S, U, F>,
    state: Mutex<UploadState>,
    cancel: CancellationToken,
}

impl<T, S, U, F> Driver<T, S, U, F>
where
    T: HttpClient + 'static,
    S: ByteSource + 'static,
    U: UrlStore + 'static,
    F: Fingerprinter + 'static,
{
    pub fn new(request: UploadRequest<T, S, U, F>) -> Self {
        let mut state = UploadState::default();
        state.url = request.upload_url.clone();
        Self { request, state: Mutex::new(state), cancel: CancellationToken::new() }
    }

    /// The engine's current phase.
    pub fn state(&self) -> DriverState {
        self.state.lock().unwrap().phase
    }

    /// The last server-acknowledged byte offset.
    pub fn offset(&self) -> u64 {
        self.state.lock().unwrap().offset
    }

    /// The resource URL, once known.
    pub fn url(&self) -> Option<String> {
        self.state.lock().unwrap().url.clone()
    }

    /// Every previously persisted record whose fingerprint matches this
    /// upload's byte source. Computing the fingerprint performs no network
    /// activity; only the URL-store lookup does.
    pub async fn find_previous_uploads(&self) -> crate::error::Result<Vec<(UrlStoreKey, PersistedRecord)>> {
        let Some(identity) = self.request.source.identity() else {
            return Ok(Vec::new());
        };
        let Some(fingerprint) = self.request.fingerprinter.fingerprint(&identity).await else {
            return Ok(Vec::new());
        };
        self.request.url_store.find_uploads_by_fingerprint(&fingerprint).await
    }

    /// Adopt a previously persisted record without performing any I/O. The
    /// next `start()` call resumes from it (via `HEAD` for a contiguous
    /// upload, or by re-checking remaining parts for a parallel one).
    pub fn resume_from_previous_upload(&self, key: UrlStoreKey, record: &PersistedRecord) {
        let mut s = self.state.lock().unwrap();
        s.url_store_key = Some(key);
        s.size = record.size;
        if let Some(urls) = &record.parallel_upload_urls {
            s.parallel_urls = Some(urls.iter().cloned().map(Some).collect());
        } else {
            s.url = record.upload_url.clone();
        }
    }

    /// Cancel this upload. Idempotent. In-flight requests are left to the
    /// transport's own cancellation (dropping the future stops polling it);
    /// the byte source is left open so a later `start()` can resume. If
    /// `terminate_on_abort` was set, also deletes the server-side resource
    /// and its persisted record.
    pub async fn abort(&self) {
        info!("aborting upload at offset {}", self.offset());
        self.cancel.cancel();
        self.state.lock().unwrap().phase = DriverState::Aborted;

        if self.request.terminate_on_abort {
            let url = self.state.lock().unwrap().url.clone();
            if let Some(url) = url {
                let _ = crate::terminate::terminate(
                    &*self.request.transport,
                    &url,
                    self.request.protocol,
                    &self.request.retry_delays,
                    true,
                )
                .await;
                self.drop_persisted_record().await;
            }
        }
    }

    /// Run the upload to completion (success or terminal error), creating
    /// or resuming the resource as needed and retrying transient failures
    /// per the configured delay schedule. Safe to call again after a
    /// terminal error or after `abort()`.
    pub async fn start(&self) -> crate::error::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            self.state.lock().unwrap().phase = DriverState::Validating;
            if let Err(e) = self.validate() {
                self.emit_error(&e);
                return Err(e);
            }

            if self.is_parallel() {
                return parallel::run(self).await;
            }

            self.state.lock().unwrap().phase = DriverState::Opening;
            if let Err(e) = self.open().await {
                self.emit_error(&e);
                return Err(e);
            }

            match self.step().await {
                Ok(()) => return Ok(()),
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    self.emit_error(&e);

                    let predicate: Box<dyn ShouldRetry> = match &self.request.callbacks.on_should_retry {
                        Some(cb) => Box::new(CallbackPredicate(Arc::clone(cb))),
                        None => Box::new(DefaultRetryPredicate),
                    };
                    let controller = RetryController::with_predicate(self.request.retry_delays.clone(), predicate);
                    let attempt = self.state.lock().unwrap().retry_attempt;
                    match controller.decide(&e, attempt, true) {
                        Some(delay) => {
                            debug!("upload failed ({e}), retrying attempt {attempt} after {delay:?}");
                            self.state.lock().unwrap().retry_attempt += 1;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => {
                            error!("upload failed terminally: {e}");
                            self.state.lock().unwrap().phase = DriverState::Error;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn is_parallel(&self) -> bool {
        self.request.parallel_uploads > 1 || self.state.lock().unwrap().parallel_urls.is_some()
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.request.endpoint.is_none() && self.request.upload_url.is_none() {
            return Err(Error::Configuration("either an endpoint or an upload URL must be set".to_owned()));
        }
        if self.request.parallel_uploads > 1 {
            if self.request.upload_url.is_some() {
                return Err(Error::Configuration(
                    "parallelUploads>1 cannot be combined with an explicit uploadUrl".to_owned(),
                ));
            }
            if self.request.upload_length.is_some() {
                return Err(Error::Configuration(
                    "parallelUploads>1 cannot be combined with an explicit upload length".to_owned(),
                ));
            }
        } else if self.request.parallel_boundaries.is_some() {
            return Err(Error::Configuration("parallelBoundaries requires parallelUploads>1".to_owned()));
        }
        if let Some(boundaries) = &self.request.parallel_boundaries {
            if boundaries.len() != self.request.parallel_uploads {
                return Err(Error::Configuration(format!(
                    "parallelBoundaries has {} entries but parallelUploads is {}",
                    boundaries.len(),
                    self.request.parallel_uploads
                )));
            }
        }
        for key in self.request.metadata.keys() {
            protocol::validate_metadata_key(key)?;
        }
        Ok(())
    }

    /// Resolve the fingerprint (once) and the known/deferred size (once),
    /// re-entrantly safe across retries.
    async fn open(&self) -> crate::error::Result<()> {
        let needs_fingerprint = self.state.lock().unwrap().fingerprint.is_none();
        if needs_fingerprint {
            if let Some(identity) = self.request.source.identity() {
                if let Some(fingerprint) = self.request.fingerprinter.fingerprint(&identity).await {
                    self.state.lock().unwrap().fingerprint = Some(fingerprint);
                }
            }
        }

        let needs_size = self.state.lock().unwrap().size.is_none();
        if needs_size {
            match self.request.upload_length {
                Some(UploadLength::Deferred) => {}
                Some(UploadLength::Known(n)) => self.state.lock().unwrap().size = Some(n),
                None => match self.request.source.size() {
                    Some(n) => self.state.lock().unwrap().size = Some(n),
                    None => {
                        return Err(Error::Configuration(
                            "upload size is unknown: set an explicit upload length or use a byte source that reports its size".to_owned(),
                        ))
                    }
                },
            }
        }
        Ok(())
    }

    async fn step(&self) -> crate::error::Result<()> {
        loop {
            self.check_not_cancelled()?;
            let current_url = self.state.lock().unwrap().url.clone();
            if let Some(url) = current_url {
                self.state.lock().unwrap().phase = DriverState::Resuming;
                match self.resume(&url).await? {
                    ResumeOutcome::Done => return Ok(()),
                    ResumeOutcome::Continue => {
                        self.state.lock().unwrap().phase = DriverState::Sending;
                        return self.send_loop().await;
                    }
                    ResumeOutcome::RetryAsCreate => continue,
                }
            } else {
                self.state.lock().unwrap().phase = DriverState::Creating;
                if self.create().await? {
                    return Ok(());
                }
                self.state.lock().unwrap().phase = DriverState::Sending;
                return self.send_loop().await;
            }
        }
    }

    async fn resume(&self, url: &str) -> crate::error::Result<ResumeOutcome> {
        self.check_not_cancelled()?;
        debug!("resuming upload at {url}");
        let response = request::send(
            &*self.request.transport,
            Method::Head,
            url,
            self.request.protocol,
            &self.request.headers,
            self.request.add_request_id,
            None,
            None,
            &self.request.callbacks,
        )
        .await?;

        if response.status == 423 {
            return Err(Error::Http {
                exchange: HttpExchange::new("HEAD", url).with_status(423),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        if (400..500).contains(&response.status) {
            self.drop_persisted_record().await;
            if self.request.endpoint.is_some() {
                self.state.lock().unwrap().url = None;
                return Ok(ResumeOutcome::RetryAsCreate);
            }
            return Err(Error::Protocol {
                exchange: HttpExchange::new("HEAD", url).with_status(response.status),
                detail: "resume failed and no endpoint is configured to create a new upload".to_owned(),
            });
        }
        if !protocol::is_success(response.status) {
            return Err(Error::Http {
                exchange: HttpExchange::new("HEAD", url).with_status(response.status),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        let offset = parse_header_u64(&response, protocol::HEADER_UPLOAD_OFFSET, "HEAD", url)?;
        let length = match response.header(protocol::HEADER_UPLOAD_LENGTH) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| Error::Protocol {
                exchange: HttpExchange::new("HEAD", url).with_status(response.status),
                detail: format!("non-numeric Upload-Length: {raw:?}"),
            })?),
            None => None,
        };
        if length.is_none() && self.request.protocol == Protocol::V1 {
            let deferred = self.state.lock().unwrap().size.is_none();
            if !deferred {
                return Err(Error::Protocol {
                    exchange: HttpExchange::new("HEAD", url).with_status(response.status),
                    detail: "missing Upload-Length".to_owned(),
                });
            }
        }

        {
            let mut s = self.state.lock().unwrap();
            s.offset = offset;
            if let Some(length) = length {
                s.size = Some(length);
            }
        }
        self.emit_upload_url_available(url);
        self.persist_if_needed(url).await;

        let size = self.state.lock().unwrap().size;
        if size == Some(offset) {
            self.finish_success().await;
            Ok(ResumeOutcome::Done)
        } else {
            Ok(ResumeOutcome::Continue)
        }
    }

    async fn create(&self) -> crate::error::Result<bool> {
        self.check_not_cancelled()?;
        debug!("creating new upload resource");
        let endpoint = self
            .request
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::Configuration("no endpoint configured".to_owned()))?
            .clone();

        let size = self.state.lock().unwrap().size;
        let mut headers = self.request.headers.clone();
        match size {
            Some(n) => headers.push((protocol::HEADER_UPLOAD_LENGTH.to_owned(), n.to_string())),
            None => headers.push((
                protocol::HEADER_UPLOAD_DEFER_LENGTH.to_owned(),
                protocol::DEFER_LENGTH_VALUE.to_owned(),
            )),
        }
        if let Some(encoded) = protocol::encode_metadata(&self.request.metadata) {
            headers.push((protocol::HEADER_UPLOAD_METADATA.to_owned(), encoded));
        }

        let mut body = None;
        let send_data_now = self.request.upload_data_during_creation && size.is_some();
        if send_data_now {
            let slice = self.next_slice(0).await?;
            if let Some(total) = size {
                if slice.done && slice.body.len() as u64 != total {
                    return Err(Error::SizeMismatch { announced: total, actual: slice.body.len() as u64 });
                }
            }
            if self.request.protocol == Protocol::Draft {
                let value = if slice.done { "?1" } else { "?0" };
                headers.push((protocol::HEADER_UPLOAD_COMPLETE.to_owned(), value.to_owned()));
            }
            body = Some(slice.body);
        } else if self.request.protocol == Protocol::Draft {
            headers.push((protocol::HEADER_UPLOAD_COMPLETE.to_owned(), "?0".to_owned()));
        }

        let response = request::send(
            &*self.request.transport,
            Method::Post,
            endpoint.as_str(),
            self.request.protocol,
            &headers,
            self.request.add_request_id,
            body,
            None,
            &self.request.callbacks,
        )
        .await?;

        if !protocol::is_success(response.status) {
            return Err(Error::Http {
                exchange: HttpExchange::new("POST", endpoint.as_str()).with_status(response.status),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        let location = response.header(protocol::HEADER_LOCATION).ok_or_else(|| Error::Protocol {
            exchange: HttpExchange::new("POST", endpoint.as_str()).with_status(response.status),
            detail: "missing Location header".to_owned(),
        })?;
        let resolved = endpoint.join(location).map_err(|e| Error::Protocol {
            exchange: HttpExchange::new("POST", endpoint.as_str()).with_status(response.status),
            detail: format!("invalid Location header: {e}"),
        })?;
        let url = resolved.to_string();

        self.state.lock().unwrap().url = Some(url.clone());
        self.emit_upload_url_available(&url);

        if size == Some(0) {
            self.state.lock().unwrap().offset = 0;
            self.persist_if_needed(&url).await;
            self.finish_success().await;
            return Ok(true);
        }

        self.persist_if_needed(&url).await;

        if send_data_now {
            return self.handle_chunk_response(&response, "POST", &url).await;
        }

        self.state.lock().unwrap().offset = 0;
        Ok(false)
    }

    async fn send_loop(&self) -> crate::error::Result<()> {
        loop {
            self.check_not_cancelled()?;

            let (offset, size, url) = {
                let s = self.state.lock().unwrap();
                (s.offset, s.size, s.url.clone().expect("resource URL must be set before Sending"))
            };

            let slice = self.next_slice(offset).await?;

            let mut headers = self.request.headers.clone();
            let method = if self.request.override_patch_method {
                headers.push((protocol::HEADER_METHOD_OVERRIDE.to_owned(), Method::Patch.to_string()));
                Method::Post
            } else {
                Method::Patch
            };
            headers.push((protocol::HEADER_UPLOAD_OFFSET.to_owned(), offset.to_string()));
            headers.push((
                protocol::HEADER_CONTENT_TYPE.to_owned(),
                protocol::CONTENT_TYPE_OFFSET_OCTET_STREAM.to_owned(),
            ));

            let mut resolved_size = size;
            if size.is_none() && slice.done {
                let total = offset + slice.body.len() as u64;
                resolved_size = Some(total);
                headers.push((protocol::HEADER_UPLOAD_LENGTH.to_owned(), total.to_string()));
            }
            if let Some(total) = size {
                if slice.done && offset + slice.body.len() as u64 != total {
                    return Err(Error::SizeMismatch { announced: total, actual: offset + slice.body.len() as u64 });
                }
            }
            if self.request.protocol == Protocol::Draft {
                let value = if slice.done { "?1" } else { "?0" };
                headers.push((protocol::HEADER_UPLOAD_COMPLETE.to_owned(), value.to_owned()));
            }
            self.state.lock().unwrap().size = resolved_size;

            let body = if slice.body.is_empty() { None } else { Some(slice.body.clone()) };
            let progress_cb = self.request.callbacks.on_progress.clone();
            let sink: Option<Arc<dyn ProgressSink>> = progress_cb.map(|cb| {
                let base = offset;
                let total = resolved_size;
                Arc::new(move |sent: u64| cb(base + sent, total)) as Arc<dyn ProgressSink>
            });

            let response = request::send(
                &*self.request.transport,
                method,
                &url,
                self.request.protocol,
                &headers,
                self.request.add_request_id,
                body,
                sink,
                &self.request.callbacks,
            )
            .await?;

            if !protocol::is_success(response.status) {
                return Err(Error::Http {
                    exchange: HttpExchange::new(method.as_str(), &url).with_status(response.status),
                    body: String::from_utf8_lossy(&response.body).into_owned(),
                });
            }

            if self.handle_chunk_response(&response, method.as_str(), &url).await? {
                return Ok(());
            }
        }
    }

    /// Parse `Upload-Offset` off a creation-with-data or chunk response,
    /// update bookkeeping, and report progress. Returns whether the upload
    /// is now complete.
    async fn handle_chunk_response(
        &self,
        response: &HttpResponse,
        method: &'static str,
        url: &str,
    ) -> crate::error::Result<bool> {
        let new_offset = parse_header_u64(response, protocol::HEADER_UPLOAD_OFFSET, method, url)?;

        let (previous_offset, size) = {
            let mut s = self.state.lock().unwrap();
            let previous = s.offset;
            s.offset = new_offset;
            if s.offset > s.offset_before_retry {
                s.retry_attempt = 0;
                s.offset_before_retry = s.offset;
            }
            (previous, s.size)
        };

        if let Some(cb) = &self.request.callbacks.on_progress {
            cb(new_offset, size);
        }
        if let Some(cb) = &self.request.callbacks.on_chunk_complete {
            cb(new_offset.saturating_sub(previous_offset), new_offset, size);
        }

        if size == Some(new_offset) {
            self.request.source.close();
            self.finish_success().await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn finish_success(&self) {
        self.state.lock().unwrap().phase = DriverState::Done;
        if self.request.remove_fingerprint_on_success {
            self.drop_persisted_record().await;
        }
        if let Some(cb) = &self.request.callbacks.on_success {
            cb();
        }
    }

    async fn persist_if_needed(&self, url: &str) {
        let should = {
            let s = self.state.lock().unwrap();
            self.request.store_fingerprint && s.fingerprint.is_some() && s.url_store_key.is_none()
        };
        if !should {
            return;
        }
        let fingerprint = self.state.lock().unwrap().fingerprint.clone().unwrap();
        let size = self.state.lock().unwrap().size;
        let record = PersistedRecord {
            upload_url: Some(url.to_owned()),
            parallel_upload_urls: None,
            creation_time: now_secs(),
            size,
        };
        match self.request.url_store.add_upload(&fingerprint, record).await {
            Ok(key) => self.state.lock().unwrap().url_store_key = Some(key),
            Err(e) => {
                warn!("failed to persist upload record: {e}");
                self.emit_error(&e);
            }
        }
    }

    async fn drop_persisted_record(&self) {
        let key = self.state.lock().unwrap().url_store_key.take();
        if let Some(key) = key {
            if let Err(e) = self.request.url_store.remove_upload(&key).await {
                warn!("failed to remove persisted upload record: {e}");
                self.emit_error(&e);
            }
        }
    }

    async fn next_slice(&self, start: u64) -> crate::error::Result<crate::source::Slice> {
        let size = self.state.lock().unwrap().size;
        let end = match self.request.chunk_size {
            ChunkSize::Unbounded => size,
            ChunkSize::Bytes(n) => {
                let tentative = start + n;
                Some(size.map(|total| tentative.min(total)).unwrap_or(tentative))
            }
        };
        self.request
            .source
            .slice(start, end)
            .await
            .map_err(|e| Error::transport(HttpExchange::new("READ", "<byte source>"), e))
    }

    fn check_not_cancelled(&self) -> crate::error::Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    fn emit_error(&self, error: &Error) {
        // Errors observed while aborted are silently dropped, and Aborted
        // itself never reaches a host's on_error.
        if self.cancel.is_cancelled() || matches!(error, Error::Aborted) {
            return;
        }
        if let Some(cb) = &self.request.callbacks.on_error {
            cb(error);
        }
    }

    fn emit_upload_url_available(&self, url: &str) {
        if let Some(cb) = &self.request.callbacks.on_upload_url_available {
            cb(url);
        }
    }
}

impl<T, S, U, F> Drop for Driver<T, S, U, F> {
    /// A host that drops a `Driver` mid-transfer without calling `abort()`
    /// first still gets its in-flight request's cancellation token tripped,
    /// so a task parked on it doesn't keep running against a value nobody
    /// can reach anymore. This does not attempt the network round-trip
    /// `abort()`'s `terminate_on_abort` path would: `Drop` can't `.await`.
    fn drop(&mut self) {
        let phase = self.state.get_mut().unwrap().phase;
        if !matches!(phase, DriverState::Done | DriverState::Aborted | DriverState::Idle) && !self.cancel.is_cancelled() {
            warn!("Driver dropped while in state {phase:?} without calling abort() first");
            self.cancel.cancel();
        }
    }
}

fn parse_header_u64(response: &HttpResponse, name: &str, method: &'static str, url: &str) -> crate::error::Result<u64> {
    let raw = response.header(name).ok_or_else(|| Error::Protocol {
        exchange: HttpExchange::new(method, url).with_status(response.status),
        detail: format!("missing {name}"),
    })?;
    raw.parse().map_err(|_| Error::Protocol {
        exchange: HttpExchange::new(method, url).with_status(response.status),
        detail: format!("non-numeric {name}: {raw:?}"),
    })
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
