//! Heartbeats to the harold watchdog.
//!
//! Harold is an external monitoring service; we POST it a signed
//! heartbeat after every successful flush so it can raise an alarm when
//! the aggregator goes quiet. The monitor task coalesces: a slow harold
//! never blocks the flush loop, at most one POST is in flight, and when
//! several heartbeats queue up behind a slow request only the freshest
//! interval is sent.
//!
//! ## Log events
//!
//! `sending heartbeat to harold`: a POST is being spawned.
//! `harold heartbeat failed`: the previous POST errored; the next one
//! supersedes it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use tokio::sync::mpsc;
use tracing::{error, info};

/// The User-Agent every heartbeat carries.
pub const USER_AGENT: &str = "tallier";

/// Errors produced by [`Harold`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The POST itself failed.
    #[error("heartbeat request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The heartbeat form would not encode.
    #[error("failed to encode heartbeat body: {0}")]
    Encode(#[from] serde_qs::Error),
    /// Harold answered with a non-success status.
    #[error("heartbeat rejected: {0}")]
    Rejected(String),
}

/// Delivers one heartbeat. The HTTP client is the real implementation;
/// tests substitute a channel-backed poster.
pub trait Poster: Send + Sync + 'static {
    fn post(&self, tag: &str, interval: Duration) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Serialize)]
struct HeartbeatForm<'a> {
    tag: &'a str,
    interval: u64,
}

/// The urlencoded heartbeat body: `tag=<tag>&interval=<seconds>`.
fn form_body(tag: &str, interval: Duration) -> Result<String, Error> {
    Ok(serde_qs::to_string(&HeartbeatForm {
        tag,
        interval: interval.as_secs(),
    })?)
}

/// Hex HMAC-SHA1 of `body` under `secret`, the value half of the
/// `X-Hub-Signature` header.
#[must_use]
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The harold HTTP client.
#[derive(Debug, Clone)]
pub struct Harold {
    base_url: String,
    secret: String,
    client: reqwest::Client,
}

impl Harold {
    #[must_use]
    pub fn new(base_url: &str, secret: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            secret: secret.to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// POST one heartbeat and drain the response.
    ///
    /// # Errors
    ///
    /// Returns an error when the body fails to encode, the request fails,
    /// or harold answers with a non-success status.
    pub async fn heartbeat(&self, tag: &str, interval: Duration) -> Result<(), Error> {
        let body = form_body(tag, interval)?;
        let signature = format!("sha1={}", sign(&self.secret, &body));
        let response = self
            .client
            .post(format!("{}/harold/heartbeat", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header("X-Hub-Signature", signature)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let _drained = response.bytes().await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Rejected(status.to_string()))
        }
    }
}

impl Poster for Harold {
    async fn post(&self, tag: &str, interval: Duration) -> Result<(), Error> {
        self.heartbeat(tag, interval).await
    }
}

/// Spin off the heartbeat monitor. The returned channel accepts the
/// interval to advertise; sending never blocks on harold itself. The
/// monitor keeps at most one POST in flight and always posts the most
/// recently requested interval, dropping stale ones.
pub fn heart_monitor<P: Poster>(poster: P, tag: String) -> mpsc::Sender<Duration> {
    let (interval_tx, mut intervals) = mpsc::channel::<Duration>(1);
    tokio::spawn(async move {
        let poster = Arc::new(poster);
        let (done_tx, mut done_rx) = mpsc::channel::<Result<(), Error>>(1);
        let mut pending: Option<Duration> = None;
        let mut in_flight = false;
        loop {
            tokio::select! {
                interval = intervals.recv() => match interval {
                    Some(interval) => pending = Some(interval),
                    None => break,
                },
                Some(result) = done_rx.recv() => {
                    if let Err(err) = result {
                        error!("harold heartbeat failed: {err}");
                    }
                    in_flight = false;
                }
            }
            if let (Some(interval), false) = (pending, in_flight) {
                let poster = Arc::clone(&poster);
                let tag = tag.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    info!("sending heartbeat to harold");
                    let _ = done.send(poster.post(&tag, interval).await).await;
                });
                pending = None;
                in_flight = true;
            }
        }
    });
    interval_tx
}

#[cfg(test)]
mod test {
    use tokio::sync::Mutex;

    use super::*;

    #[test]
    fn form_body_is_urlencoded_whole_seconds() {
        assert_eq!(
            form_body("tallier", Duration::from_secs(12)).unwrap(),
            "tag=tallier&interval=12"
        );
    }

    #[test]
    fn signature_matches_the_known_answer() {
        // RFC 2202 test vector for HMAC-SHA1.
        assert_eq!(
            sign("key", "The quick brown fox jumps over the lazy dog"),
            "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
        assert_ne!(
            sign("other", "The quick brown fox jumps over the lazy dog"),
            sign("key", "The quick brown fox jumps over the lazy dog")
        );
    }

    struct TestPoster {
        requests: mpsc::Sender<(String, Duration)>,
        responses: Mutex<mpsc::Receiver<Result<(), Error>>>,
    }

    impl Poster for TestPoster {
        async fn post(&self, tag: &str, interval: Duration) -> Result<(), Error> {
            self.requests.send((tag.to_owned(), interval)).await.ok();
            self.responses
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(Ok(()))
        }
    }

    #[tokio::test]
    async fn monitor_posts_and_coalesces() {
        let (request_tx, mut requests) = mpsc::channel(16);
        let (response_tx, responses) = mpsc::channel(16);
        let poster = TestPoster {
            requests: request_tx,
            responses: Mutex::new(responses),
        };
        let intervals = heart_monitor(poster, "tag".to_owned());

        let one = Duration::from_secs(1);
        intervals.send(one).await.unwrap();
        assert_eq!(requests.recv().await.unwrap(), ("tag".to_owned(), one));
        response_tx.send(Ok(())).await.unwrap();

        // Hold a heartbeat in flight, queue two more behind it, then fail
        // the held one: only the freshest queued interval goes out next.
        // The interval channel holds one entry, so each send completing
        // means the monitor has absorbed the one before it; the repeated
        // final send guarantees the freshest value is absorbed before the
        // failure lands.
        intervals.send(one).await.unwrap();
        assert_eq!(requests.recv().await.unwrap(), ("tag".to_owned(), one));
        let freshest = Duration::from_secs(3);
        intervals.send(Duration::from_secs(2)).await.unwrap();
        intervals.send(freshest).await.unwrap();
        intervals.send(freshest).await.unwrap();
        response_tx
            .send(Err(Error::Rejected("fake error".to_owned())))
            .await
            .unwrap();
        assert_eq!(requests.recv().await.unwrap(), ("tag".to_owned(), freshest));
    }
}
