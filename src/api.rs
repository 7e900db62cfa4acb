//! Wire types of the JSON backend and their conversion to domain values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::flex_id::{deserialize_flex_bool, deserialize_flex_i64, deserialize_flex_string, FlexId};
use crate::program::Program;

pub type ChannelId = i64;

#[derive(Debug, Deserialize, Clone)]
pub struct LoginResponse {
    pub sid: String,
    pub settings: SettingsRecord,
    pub account: AccountRecord,
    #[serde(deserialize_with = "deserialize_flex_i64")]
    pub servertime: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SettingsRecord {
    #[serde(default, deserialize_with = "deserialize_flex_i64_or_zero")]
    pub time_shift: i64,
    #[serde(default)]
    pub media_server_id: FlexId,
    #[serde(default, deserialize_with = "deserialize_flex_string")]
    pub parental_pass: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn deserialize_flex_i64_or_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(FlexId::deserialize(deserializer)?.as_i64().unwrap_or(0))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountRecord {
    #[serde(default)]
    pub id: FlexId,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubscriptionRecord {
    pub end_date: Option<String>,
    /// Option flags; the last digit is the archive entitlement.
    #[serde(default)]
    pub option: FlexId,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EpgResponse {
    #[serde(default)]
    pub channels: Vec<ChannelEpgRecord>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelEpgRecord {
    pub id: FlexId,
    #[serde(default)]
    pub epg: Vec<ProgramRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProgramRecord {
    #[serde(deserialize_with = "deserialize_flex_i64")]
    pub begin: i64,
    #[serde(deserialize_with = "deserialize_flex_i64")]
    pub end: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub info: String,
    #[serde(default, deserialize_with = "deserialize_flex_bool")]
    pub has_archive: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelListResponse {
    #[serde(default)]
    pub groups: Vec<GroupRecord>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupRecord {
    #[serde(deserialize_with = "deserialize_flex_i64")]
    pub id: i64,
    #[serde(default)]
    pub user_title: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelRecord {
    #[serde(deserialize_with = "deserialize_flex_i64")]
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_flex_i64_or_zero")]
    pub number: i64,
    #[serde(default, deserialize_with = "deserialize_flex_bool")]
    pub has_archive: bool,
    #[serde(default)]
    pub icon: String,
    #[serde(default, deserialize_with = "deserialize_flex_bool")]
    pub protected: bool,
    #[serde(default)]
    pub audiotracks: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioLangResponse {
    #[serde(default)]
    pub lang: Vec<AudioLangRecord>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioLangRecord {
    #[serde(default, deserialize_with = "deserialize_flex_string")]
    pub title: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurrentEpgResponse {
    #[serde(default)]
    pub channels: Vec<CurrentEpgRecord>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurrentEpgRecord {
    pub id: FlexId,
    #[serde(default)]
    pub current: Option<CurrentProgramRecord>,
}

/// Like [`ProgramRecord`], but `begin`/`end` may be missing or zero when
/// nothing is airing.
#[derive(Debug, Deserialize, Clone)]
pub struct CurrentProgramRecord {
    #[serde(default, deserialize_with = "deserialize_flex_i64_or_zero")]
    pub begin: i64,
    #[serde(default, deserialize_with = "deserialize_flex_i64_or_zero")]
    pub end: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub info: String,
    #[serde(default, deserialize_with = "deserialize_flex_bool")]
    pub has_archive: bool,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, ApiError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ApiError::Decode(format!("timestamp out of range: {}", secs)))
}

impl TryFrom<ProgramRecord> for Program {
    type Error = ApiError;

    fn try_from(r: ProgramRecord) -> Result<Self, Self::Error> {
        Ok(Program {
            begin: timestamp(r.begin)?,
            end: timestamp(r.end)?,
            title: r.title,
            description: r.info,
            has_archive: r.has_archive,
        })
    }
}

fn integer_id(id: &FlexId) -> Option<ChannelId> {
    match id {
        FlexId::Number(n) => Some(*n),
        FlexId::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl CurrentEpgRecord {
    pub fn channel_id(&self) -> Option<ChannelId> {
        integer_id(&self.id)
    }

    /// The airing program, if the server reported both bounds.
    pub fn program(self) -> Result<Option<Program>, ApiError> {
        match self.current {
            Some(c) if c.begin != 0 && c.end != 0 => Ok(Some(Program {
                begin: timestamp(c.begin)?,
                end: timestamp(c.end)?,
                title: c.title,
                description: c.info,
                has_archive: c.has_archive,
            })),
            _ => Ok(None),
        }
    }
}

impl ChannelEpgRecord {
    /// Integer channel id; entries with anything else are skipped by callers.
    pub fn channel_id(&self) -> Option<ChannelId> {
        integer_id(&self.id)
    }

    pub fn programs(self) -> Result<Vec<Program>, ApiError> {
        self.epg.into_iter().map(Program::try_from).collect()
    }
}

/// Account state kept after login, readable by other subsystems.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub account_id: String,
    /// End date of the first subscription that carries one
    pub packet_expire: Option<NaiveDate>,
    pub has_archive: bool,
    pub server_time: Option<DateTime<Utc>>,
}

impl AccountSnapshot {
    /// Fails with `EMPTY_SUB` when the account has no subscription at all.
    pub fn from_record(record: &AccountRecord) -> Result<Self, ApiError> {
        let account_id = record.id.to_string_value().unwrap_or_default();
        if record.subscriptions.is_empty() {
            return Err(ApiError::application(
                "EMPTY_SUB",
                format!("No active subscriptions (ID:{})", account_id),
            ));
        }

        let packet_expire = record
            .subscriptions
            .iter()
            .find_map(|s| s.end_date.as_deref())
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        let has_archive = record.subscriptions[0]
            .option
            .to_string_value()
            .and_then(|o| o.chars().last())
            .and_then(|c| c.to_digit(10))
            .is_some_and(|d| d != 0);

        Ok(Self {
            account_id,
            packet_expire,
            has_archive,
            server_time: None,
        })
    }
}

/// Server settings returned with the login reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSettings {
    /// Hours the live stream is delayed by
    pub time_shift: i64,
    pub media_server_id: Option<i64>,
    pub parental_pass: String,
}

impl From<&SettingsRecord> for ClientSettings {
    fn from(s: &SettingsRecord) -> Self {
        Self {
            time_shift: s.time_shift,
            media_server_id: s.media_server_id.as_i64(),
            parental_pass: s.parental_pass.clone(),
        }
    }
}
