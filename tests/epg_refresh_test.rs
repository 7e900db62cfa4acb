mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{epg_reply, error_reply, login_reply, query, session, T0};
use iptv_sync_lib::epg::{EpgEvent, RefreshScheduler, DEFAULT_WAKE, MIN_WAKE};
use iptv_sync_lib::transport::{MockReply, MockTransport};
use tokio::sync::broadcast::error::TryRecvError;

fn at(offset: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(T0 + offset, 0).unwrap()
}

fn scheduler(mock: &Arc<MockTransport>) -> RefreshScheduler<MockTransport> {
    mock.set_fallback("login", login_reply("sid-1", true));
    let epg = RefreshScheduler::new(session(mock));
    epg.set_channels(vec![1, 2]);
    epg
}

#[tokio::test]
async fn test_only_stale_channels_are_refetched() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();

    // channel 1 expires at +600, channel 2 at +1800
    mock.push_reply(
        "get_epg",
        epg_reply(&[(1, &[0, 600, 1200, 1800]), (2, &[0, 600, 1200, 1800, 2400, 3000])]),
    );
    let first = epg.refresh_at(at(0)).await.unwrap().unwrap();
    assert_eq!(first.requested, vec![1, 2]);
    assert_eq!(first.changed, vec![1, 2]);
    assert_eq!(first.next_wake, Duration::from_secs(600));
    assert_eq!(events.try_recv().unwrap(), EpgEvent::Updated(vec![1, 2]));

    let call = &mock.requests_for("get_epg")[0];
    assert_eq!(query(call, "cid").as_deref(), Some("1,2"));
    assert_eq!(query(call, "from_uts"), Some(T0.to_string()));
    assert_eq!(query(call, "hours").as_deref(), Some("4"));

    // channel 1 now expires at +1900, channel 2 still at +1800
    mock.push_reply("get_epg", epg_reply(&[(1, &[700, 1300, 1900, 2500, 3100])]));
    let second = epg.refresh_at(at(700)).await.unwrap().unwrap();
    assert_eq!(second.requested, vec![1]);
    assert_eq!(second.changed, vec![1]);
    assert_eq!(second.next_wake, Duration::from_secs(1100));
    assert_eq!(events.try_recv().unwrap(), EpgEvent::Updated(vec![1]));

    let call = &mock.requests_for("get_epg")[1];
    assert_eq!(query(call, "cid").as_deref(), Some("1"));
    assert_eq!(epg.current(1, at(1000)).unwrap().title, "show 700");
    assert_eq!(epg.current(2, at(1000)).unwrap().title, "show 600");
}

#[tokio::test]
async fn test_fresh_caches_issue_no_request() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    mock.push_reply("get_epg", epg_reply(&[(1, &[0, 600, 1200, 1800]), (2, &[0, 600, 1200, 1800])]));
    epg.refresh_at(at(0)).await.unwrap();
    let _ = events.try_recv();

    let report = epg.refresh_at(at(100)).await.unwrap().unwrap();

    assert!(report.requested.is_empty());
    assert!(report.changed.is_empty());
    assert_eq!(report.next_wake, Duration::from_secs(500));
    assert_eq!(mock.count("get_epg"), 1);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_next_wake_is_clamped_to_a_minute() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    mock.push_reply("get_epg", epg_reply(&[(1, &[0, 10, 20, 30]), (2, &[])]));

    let report = epg.refresh_at(at(0)).await.unwrap().unwrap();

    assert_eq!(report.next_wake, MIN_WAKE);
}

#[tokio::test]
async fn test_concurrent_refresh_is_skipped() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    mock.push_reply(
        "get_epg",
        epg_reply(&[(1, &[0, 600, 1200, 1800])]).delayed(Duration::from_millis(100)),
    );

    let background = epg.clone();
    let first = tokio::spawn(async move { background.refresh_at(at(0)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(epg.is_refreshing());

    assert_eq!(epg.refresh_at(at(0)).await.unwrap(), None);

    let report = first.await.unwrap().unwrap().unwrap();
    assert_eq!(report.changed, vec![1]);
    assert_eq!(mock.count("get_epg"), 1);
    assert!(!epg.is_refreshing());
}

#[tokio::test]
async fn test_failure_is_published() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    mock.set_fallback("get_epg", error_reply("EPG_DOWN"));

    let err = epg.refresh_at(at(0)).await.unwrap_err();

    assert_eq!(err.code(), Some("EPG_DOWN"));
    assert_eq!(events.try_recv().unwrap(), EpgEvent::Failed(err));
    assert!(epg.cached_channels().is_empty());
}

#[tokio::test]
async fn test_failure_rearms_timer_while_running() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    mock.set_fallback("get_epg", error_reply("EPG_DOWN"));

    epg.start();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();

    assert!(matches!(event, EpgEvent::Failed(_)));
    assert!(epg.is_armed());
    assert_eq!(mock.count("get_epg"), 1);
    epg.stop();
    assert!(!epg.is_armed());
}

#[tokio::test]
async fn test_suspend_keeps_cache_and_stop_drops_it() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    mock.push_reply("get_epg", epg_reply(&[(1, &[0, 600, 1200, 1800]), (2, &[0, 600])]));

    epg.start();
    tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(epg.is_running());
    assert!(epg.is_armed());

    epg.suspend();
    assert!(!epg.is_armed());
    assert_eq!(epg.cached_channels(), vec![1, 2]);

    epg.stop();
    assert!(!epg.is_running());
    assert!(epg.cached_channels().is_empty());
    assert!(epg.cache(1).is_none());
}

#[tokio::test]
async fn test_late_reply_after_stop_does_not_rearm() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    mock.push_reply(
        "get_epg",
        epg_reply(&[(1, &[0, 600, 1200, 1800])]).delayed(Duration::from_millis(50)),
    );

    epg.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    epg.stop();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, EpgEvent::Updated(vec![1]));
    assert!(!epg.is_armed());
}

#[tokio::test]
async fn test_nothing_cached_waits_default() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    mock.push_reply("get_epg", MockReply::json(serde_json::json!({"channels": []})));

    let report = epg.refresh_at(at(0)).await.unwrap().unwrap();

    assert!(report.changed.is_empty());
    assert_eq!(report.next_wake, DEFAULT_WAKE);
}

#[tokio::test]
async fn test_epg_at_fetches_archive_window_on_miss() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    mock.push_reply("get_epg", epg_reply(&[(2, &[-3600, -3000, -2400])]));

    let (cur, next) = epg.epg_at(2, at(-2900)).await.unwrap();
    assert_eq!(cur.unwrap().title, "show -3000");
    assert_eq!(next.unwrap().title, "show -2400");

    let call = &mock.requests_for("get_epg")[0];
    assert_eq!(query(call, "cid").as_deref(), Some("2"));
    assert_eq!(query(call, "from_uts"), Some((T0 - 2900 - 3 * 3600).to_string()));
    assert_eq!(query(call, "hours").as_deref(), Some("8"));

    // both known now, served from cache
    epg.epg_at(2, at(-2900)).await.unwrap();
    assert_eq!(mock.count("get_epg"), 1);
}

#[tokio::test]
async fn test_range_epg_clears_archive_without_entitlement() {
    let mock = Arc::new(MockTransport::new());
    mock.set_fallback("login", login_reply("sid-1", false));
    let epg = RefreshScheduler::new(session(&mock));
    mock.push_reply("get_epg", epg_reply(&[(3, &[0, 600])]));

    let programs = epg.range_epg(3, at(0), at(5400)).await.unwrap();

    assert_eq!(programs.len(), 2);
    assert!(programs.iter().all(|p| !p.has_archive));
    let call = &mock.requests_for("get_epg")[0];
    assert_eq!(query(call, "hours").as_deref(), Some("2"));
    assert_eq!(query(call, "time_shift").as_deref(), Some("0"));
    assert!(epg.cache(3).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_armed_timer_runs_next_refresh() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    let mut events = epg.subscribe();
    // two programs give no expiry, so the default wait applies
    mock.set_fallback("get_epg", epg_reply(&[(1, &[0, 600])]));

    epg.start();
    assert_eq!(events.recv().await.unwrap(), EpgEvent::Updated(vec![1]));
    assert_eq!(mock.count("get_epg"), 1);

    tokio::time::sleep(DEFAULT_WAKE + Duration::from_secs(5)).await;

    assert_eq!(events.recv().await.unwrap(), EpgEvent::Updated(vec![1]));
    assert_eq!(mock.count("get_epg"), 2);
    assert!(epg.is_armed());
    epg.stop();
}

#[tokio::test]
async fn test_current_list_fetches_only_uncached_channels() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);
    mock.push_reply("get_epg", epg_reply(&[(1, &[0, 600, 1200, 1800])]));
    epg.refresh_at(at(0)).await.unwrap();

    mock.push_reply(
        "get_epg_current",
        MockReply::json(serde_json::json!({"channels": [
            {"id": 2, "current": {"begin": T0, "end": T0 + 900, "title": "live", "info": ""}},
            {"id": 3, "current": {"begin": 0, "end": 0}}
        ]})),
    );
    let current = epg.current_list(&[1, 2, 3], at(100)).await.unwrap();

    assert_eq!(current[&1].title, "show 0");
    assert_eq!(current[&2].title, "live");
    assert!(!current.contains_key(&3));
    let call = &mock.requests_for("get_epg_current")[0];
    assert_eq!(query(call, "cid").as_deref(), Some("2,3"));
    assert_eq!(query(call, "from_uts"), Some((T0 + 100).to_string()));
    // the reply is not cached as guide data
    assert!(epg.cache(2).is_none());

    let cached_only = epg.current_list(&[1], at(700)).await.unwrap();
    assert_eq!(cached_only[&1].title, "show 600");
    assert_eq!(mock.count("get_epg_current"), 1);
}

#[tokio::test]
async fn test_uncached_known_channel_is_refetched() {
    let mock = Arc::new(MockTransport::new());
    let epg = scheduler(&mock);

    // channel 1 is missing from the first reply, channel 2 stays fresh
    mock.push_reply("get_epg", epg_reply(&[(2, &[0, 600, 1200, 1800, 2400, 3000])]));
    epg.refresh_at(at(0)).await.unwrap().unwrap();
    assert!(epg.cache(1).is_none());

    mock.push_reply("get_epg", epg_reply(&[(1, &[0, 600, 1200, 1800])]));
    let second = epg.refresh_at(at(100)).await.unwrap().unwrap();

    assert_eq!(second.requested, vec![1]);
    assert_eq!(query(&mock.requests_for("get_epg")[1], "cid").as_deref(), Some("1"));
    assert_eq!(epg.cached_channels(), vec![1, 2]);
}
