//! The request builder (component D): attaches the protocol-version header,
//! user headers, and an optional request id, then runs the optional
//! before/after hooks around the actual send.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, HttpExchange};
use crate::options::{Callbacks, RequestInfo, ResponseInfo};
use crate::protocol::Protocol;
use crate::transport::{HttpClient, HttpRequest, HttpResponse, Method, ProgressSink};

/// Build a request against `url` with the protocol header, the caller's
/// extra headers, and (optionally) a fresh `X-Request-ID`, then send it
/// through `client`, running `callbacks.on_before_request`/`on_after_response`
/// around the actual send.
///
/// Generalizes `async_client_trait`'s request-building helpers: the same
/// plumbing every component (create, resume, send, terminate) goes through,
/// parameterized instead of duplicated per call site.
pub async fn send<C: HttpClient>(
    client: &C,
    method: Method,
    url: &str,
    protocol: Protocol,
    extra_headers: &[(String, String)],
    add_request_id: bool,
    body: Option<Bytes>,
    progress: Option<Arc<dyn ProgressSink>>,
    callbacks: &Callbacks,
) -> Result<HttpResponse, Error> {
    let mut request = client.new_request(method, url);

    let (header_name, header_value) = protocol.resumable_header();
    request.set_header(header_name, header_value);

    for (name, value) in extra_headers {
        request.set_header(name, value);
    }

    if add_request_id {
        request.set_header(crate::protocol::HEADER_REQUEST_ID, &uuid::Uuid::new_v4().to_string());
    }

    if let Some(hook) = &callbacks.on_before_request {
        let info = RequestInfo {
            method: method.as_str(),
            url: request.url().to_owned(),
            headers: header_snapshot(&request),
        };
        hook(&info).await;
    }

    let exchange = HttpExchange::new(method.as_str(), request.url());
    let response = client.execute(request, body, progress).await?;

    if let Some(hook) = &callbacks.on_after_response {
        let request_info = RequestInfo {
            method: method.as_str(),
            url: exchange.url.clone().unwrap_or_default(),
            headers: Vec::new(),
        };
        let response_info = ResponseInfo { status: response.status, headers: Vec::new() };
        hook(&request_info, &response_info).await;
    }

    Ok(response)
}

fn header_snapshot(request: &impl HttpRequest) -> Vec<(String, String)> {
    // `HttpRequest` only exposes lookup by name, not enumeration, so hooks
    // see a fresh snapshot built from the names we know we might have set.
    // Implementors that need full enumeration should inspect their own
    // concrete request type via the transport's escape hatch instead.
    const KNOWN: &[&str] = &[
        crate::protocol::HEADER_TUS_RESUMABLE,
        crate::protocol::HEADER_DRAFT_INTEROP,
        crate::protocol::HEADER_UPLOAD_LENGTH,
        crate::protocol::HEADER_UPLOAD_DEFER_LENGTH,
        crate::protocol::HEADER_UPLOAD_OFFSET,
        crate::protocol::HEADER_UPLOAD_METADATA,
        crate::protocol::HEADER_UPLOAD_CONCAT,
        crate::protocol::HEADER_UPLOAD_COMPLETE,
        crate::protocol::HEADER_CONTENT_TYPE,
        crate::protocol::HEADER_METHOD_OVERRIDE,
        crate::protocol::HEADER_REQUEST_ID,
    ];
    KNOWN
        .iter()
        .filter_map(|&name| request.header(name).map(|v| (name.to_owned(), v.to_owned())))
        .collect()
}
