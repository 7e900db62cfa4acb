#![allow(dead_code)]

use std::sync::Arc;

use iptv_sync_lib::session::{SessionCoordinator, SessionOptions};
use iptv_sync_lib::transport::{MockReply, MockTransport};
use serde_json::json;

/// Base timestamp used by the guide fixtures.
pub const T0: i64 = 1_700_000_000;

pub fn options() -> SessionOptions {
    SessionOptions {
        base_url: "http://tv.example.com/".to_string(),
        username: "alice".to_string(),
        password: "secret".to_string(),
        language: "en".to_string(),
        quality: String::new(),
        device_id: "test".to_string(),
        client_version: "1.0".to_string(),
    }
}

pub fn session(mock: &Arc<MockTransport>) -> SessionCoordinator<MockTransport> {
    SessionCoordinator::new(Arc::clone(mock), options())
}

/// Successful login; `archive` sets the entitlement digit.
pub fn login_reply(sid: &str, archive: bool) -> MockReply {
    MockReply::json(json!({
        "sid": sid,
        "servertime": T0,
        "settings": {"time_shift": 0, "media_server_id": 1},
        "account": {
            "id": 42,
            "subscriptions": [{"end_date": "2030-01-01", "option": if archive { "1" } else { "0" }}]
        }
    }))
}

pub fn error_reply(code: &str) -> MockReply {
    MockReply::json(json!({"error": {"code": code, "message": format!("{code} happened")}}))
}

pub fn url_reply(url: &str) -> MockReply {
    MockReply::json(json!({"url": url}))
}

/// `get_epg` reply with back-to-back ten minute programs starting at each
/// offset (seconds after `T0`).
pub fn epg_reply(channels: &[(i64, &[i64])]) -> MockReply {
    let channels: Vec<_> = channels
        .iter()
        .map(|(id, begins)| {
            let epg: Vec<_> = begins
                .iter()
                .map(|b| {
                    json!({
                        "begin": T0 + b,
                        "end": T0 + b + 600,
                        "title": format!("show {b}"),
                        "info": "",
                        "has_archive": 1
                    })
                })
                .collect();
            json!({"id": id, "epg": epg})
        })
        .collect();
    MockReply::json(json!({ "channels": channels }))
}

pub fn query(url: &reqwest::Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
