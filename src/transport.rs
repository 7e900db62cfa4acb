//! HTTP transport seam.
//!
//! The session, EPG and artwork layers only need two primitives: fetch a URL
//! into memory and stream a URL into a file. Both are cancelled by dropping
//! the returned future.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::errors::TransportError;

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// GET `url` and return the body of a 2xx response.
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError>;

    /// GET `url` and write the body of a 2xx response to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), TransportError>;
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }

    fn convert_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            }
        } else {
            TransportError::Other(err.to_string())
        }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::convert_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        let resp = self.send(url).await?;
        resp.bytes().await.map_err(Self::convert_error)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let mut resp = self.send(url).await?;
        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial).await?;

        let written = async {
            while let Some(chunk) = resp.chunk().await.map_err(Self::convert_error)? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<_, TransportError>(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, dest).await?;
        Ok(())
    }
}

/// Download target used while the body is still being written.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Scripted reply for [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Body(Bytes),
    Error(TransportError),
    /// Wait before producing the inner reply
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn json(value: serde_json::Value) -> Self {
        MockReply::Body(Bytes::from(value.to_string()))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        MockReply::Delayed(delay, Box::new(self))
    }
}

/// In-memory transport for tests.
///
/// Replies are keyed by route: the last path segment of the URL, i.e. the API
/// command (`login`, `get_epg`) or the artwork file name. Queued replies are
/// consumed first, then the route's fallback is used.
#[derive(Debug, Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallback: Mutex<HashMap<String, MockReply>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for `route`.
    pub fn push_reply(&self, route: &str, reply: MockReply) {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.entry(route.to_string()).or_default().push_back(reply);
    }

    /// Reply used for `route` once its queue is empty.
    pub fn set_fallback(&self, route: &str, reply: MockReply) {
        let mut fallback = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        fallback.insert(route.to_string(), reply);
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// URLs requested for one route.
    pub fn requests_for(&self, route: &str) -> Vec<reqwest::Url> {
        self.requests()
            .iter()
            .filter_map(|u| reqwest::Url::parse(u).ok())
            .filter(|u| route_of(u.as_str()) == route)
            .collect()
    }

    pub fn count(&self, route: &str) -> usize {
        self.requests_for(route).len()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());

        let route = route_of(url);
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&route)
            .and_then(|q| q.pop_front());
        if let Some(reply) = queued {
            return reply;
        }
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&route)
            .cloned()
            .unwrap_or(MockReply::Error(TransportError::Status {
                status: 404,
                reason: format!("no mock reply for {route}"),
            }))
    }

    async fn resolve(mut reply: MockReply) -> Result<Bytes, TransportError> {
        loop {
            match reply {
                MockReply::Body(body) => return Ok(body),
                MockReply::Error(e) => return Err(e),
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        let reply = self.next_reply(url);
        Self::resolve(reply).await
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let reply = self.next_reply(url);
        let body = Self::resolve(reply).await?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }
}

fn route_of(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/').next().unwrap_or_default().to_string()
}
