//! Shared test support: a scriptable, recording `HttpClient` that stands in
//! for a real tus server.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tus_driver::error::Error;
use tus_driver::transport::{HttpClient, HttpRequest, HttpResponse, Method, ProgressSink};

#[derive(Clone, Default)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

pub struct FakeRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest for FakeRequest {
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
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// A transport that returns pre-scripted responses keyed by exact URL, one
/// per call in FIFO order, and records every request sent through it. Panics
/// if asked for a URL with no script left — a missing script means the test
/// doesn't expect that request, which is itself worth failing loudly on.
#[derive(Default)]
pub struct FakeHttpClient {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: impl Into<String>, response: ScriptedResponse) {
        self.scripts.lock().unwrap().entry(url.into()).or_default().push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpClient for FakeHttpClient {
    type Request = FakeRequest;

    fn new_request(&self, method: Method, url: &str) -> Self::Request {
        FakeRequest { method, url: url.to_owned(), headers: Vec::new() }
    }

    fn execute(
        &self,
        request: Self::Request,
        _body: Option<Bytes>,
        _progress: Option<Arc<dyn ProgressSink>>,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send {
        let method = request.method;
        let url = request.url.clone();
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            url: url.clone(),
            headers: request.headers.clone(),
        });

        let scripted = self.scripts.lock().unwrap().get_mut(&url).and_then(VecDeque::pop_front);

        async move {
            let scripted = scripted
                .unwrap_or_else(|| panic!("FakeHttpClient: no scripted response left for {method} {url}"));
            Ok(HttpResponse::new(
                scripted.status,
                scripted.headers.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
                Bytes::from(scripted.body),
            ))
        }
    }
}
