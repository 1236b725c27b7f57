//! The parallel-upload engine (component G): split a known-size upload into
//! N contiguous parts, drive one sub-driver per part as a partial upload,
//! then concatenate them into the final resource once every part completes.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, HttpExchange};
use crate::fingerprint::Fingerprinter;
use crate::options::{Callbacks, UploadLength, UploadRequest};
use crate::protocol;
use crate::request;
use crate::source::{ByteSource, RangeByteSource};
use crate::store::{PersistedRecord, UrlStore};
use crate::transport::{HttpClient, Method};

use super::{Driver, DriverState};

/// One part of a parallel upload: its byte range, its sub-driver, and
/// (once the part completes) its resolved resource URL.
///
/// Replaces the raw `(start, end)` tuple threaded loosely through spec.md
/// §4.5's prose with an explicit record, the way
/// `dropbox-toolbox::upload::CompletionTracker` tracks each block's state
/// instead of relying on positional tuples.
struct PartInfo<T, PartSource, U, F> {
    start: u64,
    end: u64,
    driver: Arc<Driver<T, PartSource, U, F>>,
}

impl<T, PartSource, U, F> PartInfo<T, PartSource, U, F> {
    /// The part's resource URL, once its sub-driver has completed. Panics if
    /// called before the part's task has finished successfully.
    fn resolved_url(&self) -> String {
        self.driver
            .state
            .lock()
            .unwrap()
            .url
            .clone()
            .expect("a completed part must have a resource URL")
    }
}

/// Drive every part of `parent`'s parallel upload to completion, then issue
/// the final concatenation request. `parent.request.source` must report a
/// known size; deferred length is incompatible with parallel mode.
pub(super) async fn run<T, S, U, F>(parent: &Driver<T, S, U, F>) -> crate::error::Result<()>
where
    T: HttpClient + 'static,
    S: ByteSource + 'static,
    U: UrlStore + 'static,
    F: Fingerprinter + 'static,
{
    let total = parent
        .request
        .source
        .size()
        .ok_or_else(|| Error::Configuration("parallel uploads require a byte source with a known size".to_owned()))?;
    let n = parent.request.parallel_uploads.max(1);

    let needs_fingerprint = parent.state.lock().unwrap().fingerprint.is_none();
    if needs_fingerprint {
        if let Some(identity) = parent.request.source.identity() {
            if let Some(fingerprint) = parent.request.fingerprinter.fingerprint(&identity).await {
                parent.state.lock().unwrap().fingerprint = Some(fingerprint);
            }
        }
    }

    let existing_urls = parent.state.lock().unwrap().parallel_urls.clone();

    let boundaries = match &parent.request.parallel_boundaries {
        Some(b) => b.clone(),
        None => default_boundaries(total, n),
    };
    if boundaries.len() != n {
        return Err(Error::Configuration(
            "parallelBoundaries length does not match parallelUploads".to_owned(),
        ));
    }

    // Tracks each part's resource URL as soon as it becomes known (at
    // creation, not completion), so the parallelUploadUrls record can be
    // persisted the moment the last one reports in, per spec.md §4.5.
    let part_urls_known: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![None; n]));
    let all_urls_known = Arc::new(tokio::sync::Notify::new());

    let source = Arc::clone(&parent.request.source);
    let mut parts = Vec::with_capacity(n);

    for (i, (start, end)) in boundaries.iter().copied().enumerate() {
        let part_source = Arc::new(RangeByteSource::new(Arc::clone(&source), start, end));
        let prior_url = existing_urls.as_ref().and_then(|urls| urls.get(i).cloned().flatten());

        let slots = Arc::clone(&part_urls_known);
        let notify = Arc::clone(&all_urls_known);
        let on_upload_url_available: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |url: &str| {
            let mut slots = slots.lock().unwrap();
            slots[i] = Some(url.to_owned());
            if slots.iter().all(Option::is_some) {
                notify.notify_one();
            }
        });

        let mut child_request = UploadRequest::new(
            Arc::clone(&parent.request.transport),
            part_source,
            Arc::clone(&parent.request.url_store),
            Arc::clone(&parent.request.fingerprinter),
        )
        .with_upload_length(UploadLength::Known(end - start))
        .with_retry_delays(parent.request.retry_delays.clone())
        .with_store_fingerprint(false)
        .with_remove_fingerprint_on_success(false)
        .with_override_patch_method(parent.request.override_patch_method)
        .with_add_request_id(parent.request.add_request_id)
        .with_protocol(parent.request.protocol)
        .with_header(protocol::HEADER_UPLOAD_CONCAT, "partial")
        .with_callbacks(Callbacks { on_upload_url_available: Some(on_upload_url_available), ..Callbacks::default() });

        if let Some(endpoint) = &parent.request.endpoint {
            child_request = child_request.with_endpoint(endpoint.clone());
        }
        if let Some(url) = prior_url {
            // Already known from a previous run: record it immediately so
            // the completeness check below doesn't wait on a part that has
            // nothing left to report.
            let mut slots = part_urls_known.lock().unwrap();
            slots[i] = Some(url.clone());
            if slots.iter().all(Option::is_some) {
                all_urls_known.notify_one();
            }
            drop(slots);
            child_request = child_request.with_upload_url(url);
        }

        parts.push(PartInfo { start, end, driver: Arc::new(Driver::new(child_request)) });
    }

    // Propagate abort() from the parent down into every child.
    for part in &parts {
        let child_cancel = part.driver.cancel.clone();
        let parent_cancel = parent.cancel.clone();
        tokio::spawn(async move {
            parent_cancel.cancelled().await;
            child_cancel.cancel();
        });
    }

    let mut tasks = Vec::with_capacity(n);
    for (i, part) in parts.iter().enumerate() {
        debug!("starting parallel part {i} covering [{}, {})", part.start, part.end);
        let driver = Arc::clone(&part.driver);
        tasks.push(tokio::spawn(async move { driver.start().await }));
    }

    // Persists as soon as the last part's URL is known, independent of (and
    // typically well before) every part finishing its transfer. Races
    // against the part tasks below; if a part fails before ever getting a
    // URL, `all_urls_known` never fires and this branch just never wins.
    let persist_when_ready = async {
        all_urls_known.notified().await;
        let urls: Vec<String> = part_urls_known
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|u| u.expect("all_urls_known only fires once every slot is filled"))
            .collect();
        persist_parallel_record(parent, &urls, total).await;
    };
    tokio::pin!(persist_when_ready);

    let join_parts = async {
        let mut first_err = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err.get_or_insert(e),
                Err(join_err) => first_err.get_or_insert(Error::Configuration(format!("upload part task panicked: {join_err}"))),
            };
        }
        first_err
    };
    tokio::pin!(join_parts);

    let mut persisted = false;
    let first_err = loop {
        tokio::select! {
            _ = &mut persist_when_ready, if !persisted => {
                persisted = true;
            }
            err = &mut join_parts => {
                break err;
            }
        }
    };
    if !persisted {
        persist_when_ready.await;
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let part_urls: Vec<String> = parts.iter().map(PartInfo::resolved_url).collect();

    {
        let mut s = parent.state.lock().unwrap();
        s.parallel_urls = Some(part_urls.iter().cloned().map(Some).collect());
    }

    let endpoint = parent
        .request
        .endpoint
        .as_ref()
        .ok_or_else(|| Error::Configuration("parallel concatenation requires an endpoint".to_owned()))?;

    let mut headers = parent.request.headers.clone();
    headers.push((protocol::HEADER_UPLOAD_CONCAT.to_owned(), format!("final;{}", part_urls.join(" "))));
    if let Some(encoded) = protocol::encode_metadata(&parent.request.metadata) {
        headers.push((protocol::HEADER_UPLOAD_METADATA.to_owned(), encoded));
    }

    let response = request::send(
        &*parent.request.transport,
        Method::Post,
        endpoint.as_str(),
        parent.request.protocol,
        &headers,
        parent.request.add_request_id,
        None,
        None,
        &parent.request.callbacks,
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
        detail: "missing Location header on final concatenation response".to_owned(),
    })?;
    let resolved = endpoint.join(location).map_err(|e| Error::Protocol {
        exchange: HttpExchange::new("POST", endpoint.as_str()).with_status(response.status),
        detail: format!("invalid Location header: {e}"),
    })?;

    {
        let mut s = parent.state.lock().unwrap();
        s.url = Some(resolved.to_string());
        s.offset = total;
        s.size = Some(total);
        s.phase = DriverState::Done;
    }
    parent.emit_upload_url_available(resolved.as_str());
    if let Some(cb) = &parent.request.callbacks.on_success {
        cb();
    }
    Ok(())
}

fn default_boundaries(total: u64, n: usize) -> Vec<(u64, u64)> {
    let part_size = total / n as u64;
    (0..n)
        .map(|i| {
            let start = i as u64 * part_size;
            let end = if i + 1 == n { total } else { (i as u64 + 1) * part_size };
            (start, end)
        })
        .collect()
}

async fn persist_parallel_record<T, S, U, F>(parent: &Driver<T, S, U, F>, part_urls: &[String], total: u64)
where
    U: UrlStore,
{
    let should = {
        let s = parent.state.lock().unwrap();
        parent.request.store_fingerprint && s.fingerprint.is_some() && s.url_store_key.is_none()
    };
    if !should {
        return;
    }
    let fingerprint = parent.state.lock().unwrap().fingerprint.clone().unwrap();
    let record = PersistedRecord {
        upload_url: None,
        parallel_upload_urls: Some(part_urls.to_vec()),
        creation_time: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        size: Some(total),
    };
    match parent.request.url_store.add_upload(&fingerprint, record).await {
        Ok(key) => parent.state.lock().unwrap().url_store_key = Some(key),
        Err(e) => {
            warn!("failed to persist parallel upload record: {e}");
            parent.emit_error(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::default_boundaries;

    #[test]
    fn splits_evenly_when_divisible() {
        assert_eq!(default_boundaries(10, 2), vec![(0, 5), (5, 10)]);
    }

    #[test]
    fn last_part_absorbs_the_remainder() {
        assert_eq!(default_boundaries(10, 3), vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn boundaries_are_contiguous_and_cover_the_whole_range() {
        let boundaries = default_boundaries(97, 4);
        assert_eq!(boundaries[0].0, 0);
        assert_eq!(boundaries.last().unwrap().1, 97);
        for pair in boundaries.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }
}
