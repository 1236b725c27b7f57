//! Integration tests for the default reqwest-backed transport, exercised
//! against a real (mock) HTTP server instead of a fake in-process one.

#![cfg(feature = "default_client")]

use std::sync::Arc;

use bytes::Bytes;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tus_driver::default_client::ReqwestHttpClient;
use tus_driver::fingerprint::Sha256Fingerprinter;
use tus_driver::options::UploadRequest;
use tus_driver::source::MemoryByteSource;
use tus_driver::store::MemoryUrlStore;
use tus_driver::Driver;

#[tokio::test]
async fn uploads_a_small_file_end_to_end() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/files"))
        .and(header("Tus-Resumable", "1.0.0"))
        .and(header("Upload-Length", "5"))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", "/files/abc"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/files/abc"))
        .and(header("Upload-Offset", "0"))
        .and(header("Content-Type", "application/offset+octet-stream"))
        .respond_with(ResponseTemplate::new(204).insert_header("Upload-Offset", "5"))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestHttpClient::new());
    let source = Arc::new(MemoryByteSource::new(Bytes::from_static(b"hello")));
    let url_store = Arc::new(MemoryUrlStore::new());
    let fingerprinter = Arc::new(Sha256Fingerprinter);

    let endpoint = url::Url::parse(&format!("{}/files", server.uri())).unwrap();
    let request = UploadRequest::new(transport, source, url_store, fingerprinter).with_endpoint(endpoint);
    let driver = Driver::new(request);

    driver.start().await.unwrap();

    assert_eq!(driver.offset(), 5);
    assert!(driver.url().unwrap().ends_with("/files/abc"));
}

#[tokio::test]
async fn surfaces_a_423_as_a_retryable_http_error() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/files/locked"))
        .respond_with(ResponseTemplate::new(423))
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestHttpClient::new());
    let source = Arc::new(MemoryByteSource::new(Bytes::from_static(b"hello")));
    let url_store = Arc::new(MemoryUrlStore::new());
    let fingerprinter = Arc::new(Sha256Fingerprinter);

    let request = UploadRequest::new(transport, source, url_store, fingerprinter)
        .with_upload_url(format!("{}/files/locked", server.uri()))
        .with_retry_delays(tus_driver::retry::RetryDelays::none());
    let driver = Driver::new(request);

    let result = driver.start().await;
    assert!(matches!(result, Err(tus_driver::Error::Http { .. })));
}

#[tokio::test]
async fn propagates_non_success_statuses_as_http_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestHttpClient::new());
    let source = Arc::new(MemoryByteSource::new(Bytes::from_static(b"hello")));
    let url_store = Arc::new(MemoryUrlStore::new());
    let fingerprinter = Arc::new(Sha256Fingerprinter);

    let endpoint = url::Url::parse(&format!("{}/files", server.uri())).unwrap();
    let request = UploadRequest::new(transport, source, url_store, fingerprinter)
        .with_endpoint(endpoint)
        .with_retry_delays(tus_driver::retry::RetryDelays::none());
    let driver = Driver::new(request);

    let result = driver.start().await;
    assert!(matches!(result, Err(tus_driver::Error::Http { .. })));
}
