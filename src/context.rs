use std::sync::Arc;

use crate::artwork::KeyedLoadCoordinator;
use crate::channels::{fetch_lineup, Lineup};
use crate::config::SyncConfig;
use crate::epg::RefreshScheduler;
use crate::errors::ApiError;
use crate::session::SessionCoordinator;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Shared handles of one running client, built once at startup.
pub struct SyncContext<T> {
    pub config: SyncConfig,
    pub session: SessionCoordinator<T>,
    pub epg: RefreshScheduler<T>,
    pub artwork: KeyedLoadCoordinator<T>,
}

impl SyncContext<ReqwestTransport> {
    pub fn from_config(config: SyncConfig) -> Result<Self, anyhow::Error> {
        let options = config.session_options();
        let transport = Arc::new(ReqwestTransport::new(&options.user_agent())?);
        Self::with_transport(config, transport)
    }
}

impl<T: HttpTransport> SyncContext<T> {
    pub fn with_transport(config: SyncConfig, transport: Arc<T>) -> Result<Self, anyhow::Error> {
        let session = SessionCoordinator::new(Arc::clone(&transport), config.session_options());
        let epg = RefreshScheduler::with_lookahead(session.clone(), config.epg_hours);
        let artwork = KeyedLoadCoordinator::open(transport, config.artwork_dir(), config.artwork_capacity)?;
        Ok(Self {
            config,
            session,
            epg,
            artwork,
        })
    }

    /// Fetch the lineup and hand its channels to the scheduler.
    pub async fn load_lineup(&self) -> Result<Lineup, ApiError> {
        let lineup = fetch_lineup(&self.session, &self.config.favorite_channels).await?;
        self.epg.set_channels(lineup.channel_ids());
        Ok(lineup)
    }
}
