//! Channel lineup built from `get_list_tv`.

use std::collections::{HashMap, HashSet};

use crate::api::{ChannelId, ChannelListResponse, ChannelRecord, GroupRecord};
use crate::errors::ApiError;
use crate::session::SessionCoordinator;
use crate::transport::HttpTransport;

pub const FAVORITES_GROUP_ID: i64 = -2;
pub const ALL_GROUP_ID: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub number: i64,
    pub title: String,
    pub icon: String,
    pub has_archive: bool,
    /// Requires the parental code to play
    pub protected: bool,
    pub audio_tracks: Vec<String>,
    pub is_favorite: bool,
}

impl Channel {
    fn from_record(r: &ChannelRecord, favorite: bool, archive_allowed: bool) -> Self {
        Self {
            id: r.id,
            number: r.number,
            title: r.name.clone(),
            icon: r.icon.clone(),
            has_archive: archive_allowed && r.has_archive,
            protected: r.protected,
            audio_tracks: r
                .audiotracks
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            is_favorite: favorite,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: i64,
    pub title: String,
    pub alias: String,
    /// Member ids ordered by channel number
    pub channels: Vec<ChannelId>,
}

#[derive(Debug, Clone, Default)]
pub struct Lineup {
    groups: Vec<Group>,
    channels: HashMap<ChannelId, Channel>,
}

impl Lineup {
    /// Build the lineup from server groups. Favourites and All channels are
    /// prepended in that order.
    pub fn from_groups(
        records: &[GroupRecord],
        favorites: &[ChannelId],
        archive_allowed: bool,
    ) -> Result<Self, ApiError> {
        let favorites: HashSet<ChannelId> = favorites.iter().copied().collect();
        let mut channels = HashMap::new();
        let mut groups = Vec::with_capacity(records.len() + 2);

        for g in records {
            let mut members = Vec::with_capacity(g.channels.len());
            for r in &g.channels {
                channels
                    .entry(r.id)
                    .or_insert_with(|| Channel::from_record(r, favorites.contains(&r.id), archive_allowed));
                if !members.contains(&r.id) {
                    members.push(r.id);
                }
            }
            groups.push(Group {
                id: g.id,
                title: g.user_title.clone(),
                alias: g.alias.clone(),
                channels: members,
            });
        }

        if channels.is_empty() {
            return Err(ApiError::EmptyLineup);
        }

        let by_number = |ids: &mut Vec<ChannelId>| {
            ids.sort_by_key(|id| channels.get(id).map(|c| (c.number, c.id)));
        };
        for g in &mut groups {
            by_number(&mut g.channels);
        }

        let mut all: Vec<ChannelId> = channels.keys().copied().collect();
        by_number(&mut all);
        let favorite_ids: Vec<ChannelId> = all.iter().copied().filter(|id| favorites.contains(id)).collect();

        groups.insert(
            0,
            Group {
                id: ALL_GROUP_ID,
                title: "All channels".to_string(),
                alias: "ALL".to_string(),
                channels: all,
            },
        );
        groups.insert(
            0,
            Group {
                id: FAVORITES_GROUP_ID,
                title: "Favourites".to_string(),
                alias: "FAVORITES".to_string(),
                channels: favorite_ids,
            },
        );

        Ok(Self { groups, channels })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: i64) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Channels of a group, in group order.
    pub fn channels_in(&self, group_id: i64) -> Vec<&Channel> {
        self.group(group_id)
            .map(|g| g.channels.iter().filter_map(|id| self.channels.get(id)).collect())
            .unwrap_or_default()
    }

    /// Every channel id, ordered by number.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.group(ALL_GROUP_ID)
            .map(|g| g.channels.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Fetch the lineup of the logged-in account.
pub async fn fetch_lineup<T: HttpTransport>(
    api: &SessionCoordinator<T>,
    favorites: &[ChannelId],
) -> Result<Lineup, ApiError> {
    let mut params = vec![("mode", "1".to_string())];
    if api.options().quality == "lq" {
        params.push(("quality", "lq".to_string()));
    }
    let reply: ChannelListResponse = api.request("get_list_tv", &params).await?;
    let lineup = Lineup::from_groups(&reply.groups, favorites, api.account_has_archive())?;
    tracing::info!(channels = lineup.len(), groups = reply.groups.len(), "lineup loaded");
    Ok(lineup)
}
