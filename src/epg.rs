//! Live program guide for the whole lineup.
//!
//! [`RefreshScheduler`] keeps one [`IntervalCache`] per channel and reloads the
//! stale ones in a single batched `get_epg` call. After every refresh it
//! sleeps until the earliest channel runs low on buffered programs.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ChannelId, CurrentEpgResponse, EpgResponse};
use crate::errors::ApiError;
use crate::lock;
use crate::program::{IntervalCache, Program};
use crate::session::SessionCoordinator;
use crate::transport::HttpTransport;

/// Look-ahead requested by a refresh.
pub const LOOKAHEAD_HOURS: u32 = 4;
pub const MIN_WAKE: Duration = Duration::from_secs(60);
pub const MAX_WAKE: Duration = Duration::from_secs(3600);
/// Wait used when no channel has a known expiry.
pub const DEFAULT_WAKE: Duration = Duration::from_secs(15 * 60);

/// Archive lookups fetch this window around the requested time.
const ARCHIVE_BEFORE_HOURS: i64 = 3;
const ARCHIVE_HOURS: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum EpgEvent {
    /// Channels whose cache was replaced
    Updated(Vec<ChannelId>),
    Failed(ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    /// Channel ids included in the request
    pub requested: Vec<ChannelId>,
    /// Channel ids whose cache was replaced
    pub changed: Vec<ChannelId>,
    pub next_wake: Duration,
}

/// Delay until the earliest expiry among `caches`, clamped to
/// `[MIN_WAKE, MAX_WAKE]`.
pub fn next_wake_delay<'a>(
    caches: impl IntoIterator<Item = &'a IntervalCache>,
    now: DateTime<Utc>,
) -> Duration {
    let earliest = caches.into_iter().filter_map(IntervalCache::expiry_time).min();
    let delay = match earliest {
        Some(expiry) => (expiry - now).to_std().unwrap_or(Duration::ZERO),
        None => DEFAULT_WAKE,
    };
    delay.clamp(MIN_WAKE, MAX_WAKE)
}

fn join_ids(cids: &[ChannelId]) -> String {
    cids.iter()
        .map(ChannelId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Fetch `hours` of programs starting at `from` for every channel in `cids`.
///
/// Entries with a non-integer channel id are skipped.
pub async fn fetch_programs<T: HttpTransport>(
    api: &SessionCoordinator<T>,
    cids: &[ChannelId],
    from: DateTime<Utc>,
    hours: u32,
    extra: &[(&str, String)],
) -> Result<HashMap<ChannelId, Vec<Program>>, ApiError> {
    let cid = join_ids(cids);
    let mut params = vec![
        ("cid", cid),
        ("from_uts", from.timestamp().to_string()),
        ("hours", hours.to_string()),
    ];
    params.extend(extra.iter().cloned());

    let reply: EpgResponse = api.request("get_epg", &params).await?;
    let mut programs = HashMap::with_capacity(reply.channels.len());
    for channel in reply.channels {
        let Some(id) = channel.channel_id() else {
            warn!(id = %channel.id, "skipping epg entry with bad channel id");
            continue;
        };
        programs.insert(id, channel.programs()?);
    }
    Ok(programs)
}

struct Inner<T> {
    api: SessionCoordinator<T>,
    hours: u32,
    channels: Mutex<Vec<ChannelId>>,
    caches: Mutex<HashMap<ChannelId, Arc<IntervalCache>>>,
    refreshing: AtomicBool,
    running: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<EpgEvent>,
}

pub struct RefreshScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RefreshScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the in-flight flag when a refresh ends or is dropped.
struct RefreshFlag<'a>(&'a AtomicBool);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: HttpTransport> RefreshScheduler<T> {
    pub fn new(api: SessionCoordinator<T>) -> Self {
        Self::with_lookahead(api, LOOKAHEAD_HOURS)
    }

    pub fn with_lookahead(api: SessionCoordinator<T>, hours: u32) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                api,
                hours,
                channels: Mutex::new(Vec::new()),
                caches: Mutex::new(HashMap::new()),
                refreshing: AtomicBool::new(false),
                running: AtomicBool::new(false),
                timer: Mutex::new(None),
                events,
            }),
        }
    }

    /// Channels refreshed when nothing is cached yet.
    pub fn set_channels(&self, ids: Vec<ChannelId>) {
        *lock(&self.inner.channels) = ids;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EpgEvent> {
        self.inner.events.subscribe()
    }

    /// Kick off a refresh now and keep re-arming the timer after it.
    /// Does nothing beyond that if a refresh is already running.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::Release);
        Inner::spawn_refresh(&self.inner);
    }

    /// Cancel the timer and drop cached programs. A request already sent is
    /// not cancelled; its reply still lands in the cache but arms nothing.
    pub fn stop(&self) {
        self.suspend();
        lock(&self.inner.caches).clear();
    }

    /// Cancel the timer, keeping cached programs.
    pub fn suspend(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
        debug!("epg refresh suspended");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::Acquire)
    }

    /// True while a wake-up is scheduled.
    pub fn is_armed(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one refresh cycle as of `now`.
    ///
    /// Returns `Ok(None)` without sending anything when another refresh is
    /// still outstanding.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Option<RefreshReport>, ApiError> {
        self.inner.refresh_at(now).await
    }

    pub fn cache(&self, cid: ChannelId) -> Option<Arc<IntervalCache>> {
        lock(&self.inner.caches).get(&cid).cloned()
    }

    pub fn cached_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = lock(&self.inner.caches).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn current(&self, cid: ChannelId, t: DateTime<Utc>) -> Option<Program> {
        self.cache(cid)?.current(t).cloned()
    }

    pub fn current_and_following(&self, cid: ChannelId, t: DateTime<Utc>) -> Vec<Program> {
        self.cache(cid)
            .map(|c| c.current_and_following(t).to_vec())
            .unwrap_or_default()
    }

    /// Program airing at `t` on each of `cids`.
    ///
    /// Cached channels are answered locally; the others are looked up in one
    /// `get_epg_current` call. Channels with nothing airing are left out.
    pub async fn current_list(
        &self,
        cids: &[ChannelId],
        t: DateTime<Utc>,
    ) -> Result<HashMap<ChannelId, Program>, ApiError> {
        let mut found = HashMap::with_capacity(cids.len());
        let mut missing = Vec::new();
        for &cid in cids {
            match self.current(cid, t) {
                Some(program) => {
                    found.insert(cid, program);
                }
                None => missing.push(cid),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        debug!(cached = found.len(), missing = missing.len(), "loading current programs");
        let params = [("cid", join_ids(&missing)), ("from_uts", t.timestamp().to_string())];
        let reply: CurrentEpgResponse = self.inner.api.request("get_epg_current", &params).await?;
        for channel in reply.channels {
            let Some(id) = channel.channel_id() else {
                continue;
            };
            if let Some(program) = channel.program()? {
                found.insert(id, program);
            }
        }
        Ok(found)
    }

    /// Current and next program at `t`, which may lie in the past.
    ///
    /// Served from the cache when both are known; otherwise a window around
    /// `t` is fetched for this channel and replaces its cache.
    pub async fn epg_at(
        &self,
        cid: ChannelId,
        t: DateTime<Utc>,
    ) -> Result<(Option<Program>, Option<Program>), ApiError> {
        if let Some(cache) = self.cache(cid) {
            if let (Some(cur), Some(next)) = cache.find(t) {
                return Ok((Some(cur.clone()), Some(next.clone())));
            }
        }

        let from = t - chrono::Duration::hours(ARCHIVE_BEFORE_HOURS);
        let mut fetched = fetch_programs(&self.inner.api, &[cid], from, ARCHIVE_HOURS, &[]).await?;
        let cache = Arc::new(IntervalCache::new(fetched.remove(&cid).unwrap_or_default()));
        lock(&self.inner.caches).insert(cid, Arc::clone(&cache));

        let (cur, next) = cache.find(t);
        Ok((cur.cloned(), next.cloned()))
    }

    /// Programs of one channel between `start` and `end`, bypassing the cache.
    /// Archive flags are cleared when the account has no archive access.
    pub async fn range_epg(
        &self,
        cid: ChannelId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Program>, ApiError> {
        // time shift comes with the login reply
        self.inner.api.ensure_session().await?;
        let secs = (end - start).num_seconds().max(0) as u64;
        let hours = secs.div_ceil(3600).max(1) as u32;
        let time_shift = [("time_shift", self.inner.api.time_shift().to_string())];

        let mut fetched = fetch_programs(&self.inner.api, &[cid], start, hours, &time_shift).await?;
        let mut programs = fetched.remove(&cid).unwrap_or_default();
        if !self.inner.api.account_has_archive() {
            for p in &mut programs {
                p.has_archive = false;
            }
        }
        Ok(programs)
    }
}

impl<T: HttpTransport> Inner<T> {
    fn spawn_refresh(this: &Arc<Self>) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            // failures are published on the event channel
            let _ = inner.refresh_at(Utc::now()).await;
        });
    }

    fn work_set(&self, now: DateTime<Utc>) -> Vec<ChannelId> {
        let known = lock(&self.channels).clone();
        let caches = lock(&self.caches);
        if caches.is_empty() {
            return known;
        }

        let mut work: BTreeSet<ChannelId> = caches
            .iter()
            .filter(|(_, cache)| cache.is_stale(now))
            .map(|(cid, _)| *cid)
            .collect();
        work.extend(known.into_iter().filter(|cid| !caches.contains_key(cid)));
        work.into_iter().collect()
    }

    fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let caches = lock(&self.caches);
        next_wake_delay(caches.values().map(|c| c.as_ref()), now)
    }

    fn apply(&self, values: HashMap<ChannelId, Vec<Program>>) -> Vec<ChannelId> {
        let mut changed: Vec<ChannelId> = values.keys().copied().collect();
        changed.sort_unstable();

        let fresh: Vec<_> = values
            .into_iter()
            .map(|(cid, programs)| (cid, Arc::new(IntervalCache::new(programs))))
            .collect();
        lock(&self.caches).extend(fresh);
        changed
    }

    async fn refresh_at(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshReport>, ApiError> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("epg refresh already in flight");
            return Ok(None);
        }
        let _flag = RefreshFlag(&self.refreshing);

        let requested = self.work_set(now);
        let result = if requested.is_empty() {
            Ok(HashMap::new())
        } else {
            debug!(channels = requested.len(), "refreshing epg");
            fetch_programs(&self.api, &requested, now, self.hours, &[]).await
        };

        match result {
            Ok(values) => {
                let changed = self.apply(values);
                let next_wake = self.next_delay(now);
                self.arm(next_wake);
                info!(
                    requested = requested.len(),
                    changed = changed.len(),
                    next_wake_secs = next_wake.as_secs(),
                    "epg refreshed"
                );
                if !changed.is_empty() {
                    let _ = self.events.send(EpgEvent::Updated(changed.clone()));
                }
                Ok(Some(RefreshReport {
                    requested,
                    changed,
                    next_wake,
                }))
            }
            Err(e) => {
                let next_wake = self.next_delay(now);
                self.arm(next_wake);
                if !e.is_cancelled() {
                    warn!(error = %e, next_wake_secs = next_wake.as_secs(), "epg refresh failed");
                    let _ = self.events.send(EpgEvent::Failed(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Schedule the next refresh, replacing any pending one. No-op while
    /// stopped or suspended.
    fn arm(self: &Arc<Self>, delay: Duration) {
        let mut timer = lock(&self.timer);
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let inner = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.running.load(Ordering::Acquire) {
                Inner::spawn_refresh(&inner);
            }
        }));
    }
}
