use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::ChannelId;
use crate::session::SessionOptions;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub language: String,
    /// `"lq"` requests low quality lineups and streams
    pub quality: String,
    pub device_id: String,
    pub client_version: String,
    pub epg_hours: u32,
    /// Defaults to the platform cache dir
    pub artwork_dir: Option<PathBuf>,
    pub artwork_capacity: usize,
    pub favorite_channels: Vec<ChannelId>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            language: "en".to_string(),
            quality: String::new(),
            device_id: "rust".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            epg_hours: crate::epg::LOOKAHEAD_HOURS,
            artwork_dir: None,
            artwork_capacity: 40,
            favorite_channels: Vec::new(),
            path: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "iptv-sync", "iptv-sync")
}

impl SyncConfig {
    /// Load from the platform config dir, falling back to defaults when the
    /// file does not exist yet.
    pub fn load() -> Result<Self, anyhow::Error> {
        match project_dirs() {
            Some(dirs) => Self::load_from(dirs.config_dir().join(CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<SyncConfig>(&content)?
        } else {
            SyncConfig::default()
        };
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Write back to the file this config was loaded from, or to the
    /// platform config dir.
    pub fn save(&self) -> Result<(), anyhow::Error> {
        let path = match (&self.path, project_dirs()) {
            (Some(p), _) => p.clone(),
            (None, Some(dirs)) => dirs.config_dir().join(CONFIG_FILE),
            (None, None) => anyhow::bail!("no config directory available"),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.username.is_empty()
    }

    pub fn artwork_dir(&self) -> PathBuf {
        self.artwork_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|d| d.cache_dir().join("artwork"))
                .unwrap_or_else(|| std::env::temp_dir().join("iptv-sync-artwork"))
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            base_url: self.base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            language: self.language.clone(),
            quality: self.quality.clone(),
            device_id: self.device_id.clone(),
            client_version: self.client_version.clone(),
        }
    }

    /// Returns whether the channel is a favourite afterwards.
    pub fn toggle_favorite_channel(&mut self, id: ChannelId) -> bool {
        if let Some(pos) = self.favorite_channels.iter().position(|c| *c == id) {
            self.favorite_channels.remove(pos);
            let _ = self.save();
            false
        } else {
            self.favorite_channels.push(id);
            let _ = self.save();
            true
        }
    }
}
