//! Session handling in front of every remote call.
//!
//! [`SessionCoordinator`] owns the session id. Requests made without one
//! share a single login; requests failing with a session code drop the
//! session and are retried once with a fresh one.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::{
    AccountRecord, AccountSnapshot, AudioLangResponse, ChannelId, ClientSettings, LoginResponse, SettingsRecord,
    UrlResponse,
};
use crate::errors::ApiError;
use crate::lock;
use crate::transport::HttpTransport;

/// Extra attempts allowed after a session-invalidating error.
pub const SESSION_RETRIES: u32 = 1;

/// Everything needed to log in and address the backend.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server root; commands live under `<base_url>/json/`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub language: String,
    /// `"lq"` for low quality streams, anything else is the server default
    pub quality: String,
    pub device_id: String,
    pub client_version: String,
}

impl SessionOptions {
    pub fn user_agent(&self) -> String {
        format!("{}_AM-{}", self.device_id, self.client_version)
    }

    fn endpoint(&self) -> String {
        format!("{}/json", self.base_url.trim_end_matches('/'))
    }
}

fn hex_md5(s: &str) -> String {
    hex::encode(Md5::digest(s.as_bytes()))
}

/// Password digest sent to the login endpoint:
/// `hex(md5(hex(md5(username)) + hex(md5(password))))`.
pub fn credential_digest(username: &str, password: &str) -> String {
    hex_md5(&format!("{}{}", hex_md5(username), hex_md5(password)))
}

/// Parse a reply body, turning a top-level `error` object into
/// [`ApiError::Application`].
pub fn decode_reply<R: DeserializeOwned>(body: &[u8]) -> Result<R, ApiError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(format!("json error: {}", e)))?;

    if let Some(error) = value.get("error") {
        let field = |name: &str| {
            error
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        return Err(ApiError::Application {
            code: field("code").unwrap_or_else(|| "UNKNOWN".to_string()),
            message: field("message").unwrap_or_default(),
        });
    }
    Ok(serde_json::from_value(value)?)
}

type Waiter = oneshot::Sender<Result<String, ApiError>>;

enum SessionState {
    Absent,
    /// A login is running; every waiter receives its outcome
    Pending(Vec<Waiter>),
    Present(String),
}

struct Inner<T> {
    transport: Arc<T>,
    options: SessionOptions,
    endpoint: String,
    language: Mutex<String>,
    state: Mutex<SessionState>,
    account: Mutex<Option<AccountSnapshot>>,
    settings: Mutex<Option<ClientSettings>>,
}

pub struct SessionCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SessionCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: HttpTransport> SessionCoordinator<T> {
    pub fn new(transport: Arc<T>, options: SessionOptions) -> Self {
        let endpoint = options.endpoint();
        let language = Mutex::new(options.language.clone());
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                endpoint,
                language,
                state: Mutex::new(SessionState::Absent),
                account: Mutex::new(None),
                settings: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn has_session(&self) -> bool {
        matches!(*lock(&self.inner.state), SessionState::Present(_))
    }

    /// Forget the current session; the next request logs in again.
    pub fn invalidate(&self) {
        let mut state = lock(&self.inner.state);
        if let SessionState::Present(_) = *state {
            *state = SessionState::Absent;
        }
    }

    pub fn set_language(&self, language: &str) {
        *lock(&self.inner.language) = language.to_string();
    }

    /// Account as of the last login or [`account_info`](Self::account_info) call.
    pub fn account(&self) -> Option<AccountSnapshot> {
        lock(&self.inner.account).clone()
    }

    pub fn settings(&self) -> Option<ClientSettings> {
        lock(&self.inner.settings).clone()
    }

    pub fn time_shift(&self) -> i64 {
        self.settings().map(|s| s.time_shift).unwrap_or(0)
    }

    pub fn account_has_archive(&self) -> bool {
        self.account().is_some_and(|a| a.has_archive)
    }

    /// Session id, logging in first if needed.
    ///
    /// At most one login runs at a time. It runs on its own task so that a
    /// caller giving up does not strand the others waiting on it.
    pub async fn ensure_session(&self) -> Result<String, ApiError> {
        let rx = {
            let mut state = lock(&self.inner.state);
            if let SessionState::Present(sid) = &*state {
                return Ok(sid.clone());
            }

            let (tx, rx) = oneshot::channel();
            if let SessionState::Pending(waiters) = &mut *state {
                waiters.push(tx);
            } else {
                *state = SessionState::Pending(vec![tx]);
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.authorize().await });
            }
            rx
        };
        rx.await.map_err(|_| ApiError::Cancelled)?
    }

    /// Run `cmd` with the current session, retrying once on a session error.
    pub async fn request<R: DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[(&str, String)],
    ) -> Result<R, ApiError> {
        self.request_with_retries(cmd, params, SESSION_RETRIES).await
    }

    async fn request_with_retries<R: DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[(&str, String)],
        mut retries_left: u32,
    ) -> Result<R, ApiError> {
        loop {
            let sid = self.ensure_session().await?;
            match self.send(&sid, cmd, params).await {
                Err(e) if e.is_session_invalid() => {
                    self.inner.drop_session(&sid);
                    if retries_left == 0 {
                        warn!(cmd, error = %e, "session rejected again, giving up");
                        return Err(e);
                    }
                    retries_left -= 1;
                    debug!(cmd, error = %e, "session rejected, retrying with a new one");
                }
                other => return other,
            }
        }
    }

    async fn send<R: DeserializeOwned>(
        &self,
        sid: &str,
        cmd: &str,
        params: &[(&str, String)],
    ) -> Result<R, ApiError> {
        let language = lock(&self.inner.language).clone();
        let mut query: Vec<(&str, &str)> = vec![("sid", sid), ("lng", &language)];
        query.extend(params.iter().map(|(k, v)| (*k, v.as_str())));

        let url = self.inner.url(cmd, &query)?;
        debug!(cmd, "request");
        let body = self.inner.transport.fetch(url.as_str()).await?;
        decode_reply(&body)
    }

    /// Refresh the account snapshot.
    pub async fn account_info(&self) -> Result<AccountSnapshot, ApiError> {
        let record: AccountRecord = self.request("get_account_info", &[]).await?;
        let mut account = AccountSnapshot::from_record(&record)?;
        let mut stored = lock(&self.inner.account);
        account.server_time = stored.as_ref().and_then(|a| a.server_time);
        *stored = Some(account.clone());
        Ok(account)
    }

    /// Change server-side settings; the reply replaces the settings snapshot.
    ///
    /// Protected settings need the current parental code as `pin`.
    pub async fn set_settings(
        &self,
        values: &[(&str, String)],
        pin: Option<&str>,
    ) -> Result<ClientSettings, ApiError> {
        if values.is_empty() {
            return Err(ApiError::InvalidRequest("no settings to change".to_string()));
        }
        let names: Vec<&str> = values.iter().map(|(k, _)| *k).collect();
        let vals: Vec<&str> = values.iter().map(|(_, v)| v.as_str()).collect();
        let mut params = vec![("var", names.join(",")), ("val", vals.join(","))];
        if let Some(pin) = pin {
            params.push(("protect_code", pin.to_string()));
        }

        let record: SettingsRecord = self.request("set", &params).await?;
        let settings = ClientSettings::from(&record);
        *lock(&self.inner.settings) = Some(settings.clone());
        info!(vars = %names.join(","), "settings changed");
        Ok(settings)
    }

    pub async fn change_protect_code(&self, old: &str, new: &str) -> Result<ClientSettings, ApiError> {
        self.set_settings(&[("parental_pass", new.to_string())], Some(old))
            .await
    }

    /// Audio track languages offered by the server.
    pub async fn audio_languages(&self) -> Result<Vec<String>, ApiError> {
        let reply: AudioLangResponse = self.request("get_audio_lang", &[]).await?;
        Ok(reply.lang.into_iter().map(|l| l.title).collect())
    }

    /// Playback URL of a channel, live or (with `at`) from the archive.
    pub async fn stream_url(
        &self,
        cid: ChannelId,
        protect_code: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Result<String, ApiError> {
        self.ensure_session().await?;
        let mut params = vec![
            ("cid", cid.to_string()),
            ("time_shift", self.time_shift().to_string()),
            ("quality", self.inner.options.quality.clone()),
        ];
        if let Some(pin) = protect_code {
            params.push(("protect_code", pin.to_string()));
        }
        if let Some(t) = at {
            params.push(("uts", t.timestamp().to_string()));
        }
        let reply: UrlResponse = self.request("get_url_tv", &params).await?;
        Ok(reply.url)
    }
}

impl<T: HttpTransport> Inner<T> {
    fn url(&self, cmd: &str, query: &[(&str, &str)]) -> Result<reqwest::Url, ApiError> {
        reqwest::Url::parse_with_params(&format!("{}/{}", self.endpoint, cmd), query)
            .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", self.endpoint, e)))
    }

    /// Clear the session only if it is still the one that failed.
    fn drop_session(&self, sid: &str) {
        let mut state = lock(&self.state);
        if matches!(&*state, SessionState::Present(current) if current == sid) {
            *state = SessionState::Absent;
        }
    }

    async fn authorize(&self) {
        let outcome = self.login().await;

        let waiters = {
            let mut state = lock(&self.state);
            let next = match &outcome {
                Ok(sid) => SessionState::Present(sid.clone()),
                Err(_) => SessionState::Absent,
            };
            match std::mem::replace(&mut *state, next) {
                SessionState::Pending(waiters) => waiters,
                _ => Vec::new(),
            }
        };

        match &outcome {
            Ok(_) => info!(waiters = waiters.len(), "authorized"),
            Err(e) => warn!(waiters = waiters.len(), error = %e, "authorization failed"),
        }
        for waiter in waiters {
            // a waiter that went away has nothing left to resolve
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn login(&self) -> Result<String, ApiError> {
        let opts = &self.options;
        let digest = credential_digest(&opts.username, &opts.password);
        let user_agent = opts.user_agent();
        let url = self.url(
            "login",
            &[
                ("login", opts.username.as_str()),
                ("pass", digest.as_str()),
                ("with_cfg", ""),
                ("with_acc", ""),
                ("user_agent", user_agent.as_str()),
            ],
        )?;

        info!(username = %opts.username, "authorizing");
        let body = self.transport.fetch(url.as_str()).await?;
        let reply: LoginResponse = decode_reply(&body)?;

        *lock(&self.settings) = Some(ClientSettings::from(&reply.settings));
        let mut account = AccountSnapshot::from_record(&reply.account)?;
        account.server_time = DateTime::from_timestamp(reply.servertime, 0);
        *lock(&self.account) = Some(account);

        Ok(reply.sid)
    }
}
