//! Termination (component H): delete a server-side upload resource, with
//! retry against the caller's own delay schedule.

use crate::error::{Error, HttpExchange};
use crate::options::Callbacks;
use crate::protocol::Protocol;
use crate::retry::RetryDelays;
use crate::transport::{HttpClient, Method};

/// Issue `DELETE url`. A 204 is success; anything else is wrapped as an
/// [`Error::Http`]. If `retry_delays` has entries and the resulting error
/// would be retried (tested against attempt 0, 1, 2, ... as the schedule is
/// consumed), wait and try again; exhausting the schedule re-raises the last
/// error.
pub async fn terminate<C: HttpClient>(
    client: &C,
    url: &str,
    protocol: Protocol,
    retry_delays: &RetryDelays,
    network_online: bool,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        match try_delete(client, url, protocol).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let should_retry = e.default_should_retry(network_online);
                match retry_delays.get(attempt) {
                    Some(delay) if should_retry => {
                        debug!("termination of {url} failed ({e}), retrying after {delay:?}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => return Err(e),
                }
            }
        }
    }
}

async fn try_delete<C: HttpClient>(client: &C, url: &str, protocol: Protocol) -> Result<(), Error> {
    let response = crate::request::send(
        client,
        Method::Delete,
        url,
        protocol,
        &[],
        false,
        None,
        None,
        &Callbacks::default(),
    )
    .await?;

    if response.status == 204 {
        return Ok(());
    }
    Err(Error::Http {
        exchange: HttpExchange::new(Method::Delete.as_str(), url).with_status(response.status),
        body: String::from_utf8_lossy(&response.body).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpRequest, HttpResponse, ProgressSink};
    use bytes::Bytes;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeRequest {
        method: Method,
        url: String,
    }

    impl HttpRequest for FakeRequest {
        fn method(&self) -> Method {
            self.method
        }
        fn url(&self) -> &str {
            &self.url
        }
        fn set_header(&mut self, _name: &str, _value: &str) {}
        fn header(&self, _name: &str) -> Option<&str> {
            None
        }
    }

    /// Returns 423 the first `fail_times` calls, then 204.
    struct FlakyClient {
        calls: AtomicUsize,
        fail_times: usize,
    }

    impl HttpClient for FlakyClient {
        type Request = FakeRequest;

        fn new_request(&self, method: Method, url: &str) -> Self::Request {
            FakeRequest { method, url: url.to_owned() }
        }

        fn execute(
            &self,
            request: Self::Request,
            _body: Option<Bytes>,
            _progress: Option<Arc<dyn ProgressSink>>,
        ) -> impl Future<Output = Result<HttpResponse, Error>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let status = if call < self.fail_times { 423 } else { 204 };
            let _ = request;
            std::future::ready(Ok(HttpResponse::new(status, Vec::new(), Bytes::new())))
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_on_204() {
        let client = FlakyClient { calls: AtomicUsize::new(0), fail_times: 0 };
        let result = terminate(&client, "https://example.test/files/a", Protocol::V1, &RetryDelays::none(), true).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retries_423_until_schedule_exhausted_then_fails() {
        let client = FlakyClient { calls: AtomicUsize::new(0), fail_times: 5 };
        let delays = RetryDelays::fixed(std::time::Duration::from_millis(1), 2);
        let result = terminate(&client, "https://example.test/files/a", Protocol::V1, &delays, true).await;
        assert!(result.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn retries_423_and_recovers_within_schedule() {
        let client = FlakyClient { calls: AtomicUsize::new(0), fail_times: 2 };
        let delays = RetryDelays::fixed(std::time::Duration::from_millis(1), 3);
        let result = terminate(&client, "https://example.test/files/a", Protocol::V1, &delays, true).await;
        assert!(result.is_ok());
    }
}
