use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use iptv_sync_lib::channels::ALL_GROUP_ID;
use iptv_sync_lib::config::SyncConfig;
use iptv_sync_lib::context::SyncContext;
use iptv_sync_lib::epg::EpgEvent;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file to use instead of the platform config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and print the account state
    Login,
    /// List every channel of the lineup
    Channels,
    /// What is on now
    Now {
        #[arg(long)]
        channel: Option<i64>,
    },
    /// Download posters into the artwork cache
    Poster {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Keep the guide fresh and log updates until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::load_from(path)?,
        None => SyncConfig::load()?,
    };
    if !config.is_configured() {
        let location = config.path().map(|p| p.display().to_string()).unwrap_or_default();
        anyhow::bail!("no server configured, edit {}", location);
    }

    let ctx = SyncContext::from_config(config)?;

    match args.command {
        Command::Login => {
            ctx.session.ensure_session().await?;
            if let Some(account) = ctx.session.account() {
                println!("Account:  {}", account.account_id);
                if let Some(expire) = account.packet_expire {
                    println!("Expires:  {}", expire);
                }
                println!("Archive:  {}", if account.has_archive { "yes" } else { "no" });
            }
            println!("Shift:    {}h", ctx.session.time_shift());
        }
        Command::Channels => {
            let lineup = ctx.load_lineup().await?;
            for c in lineup.channels_in(ALL_GROUP_ID) {
                let star = if c.is_favorite { "*" } else { " " };
                println!("{star}{:>4}  {:<6} {}", c.number, c.id, c.title);
            }
        }
        Command::Now { channel } => {
            let lineup = ctx.load_lineup().await?;
            ctx.epg.refresh_at(Utc::now()).await?;
            let now = Utc::now();
            let ids = match channel {
                Some(id) => vec![id],
                None => lineup.channel_ids(),
            };
            for id in ids {
                let name = lineup.channel(id).map(|c| c.title.as_str()).unwrap_or("?");
                match ctx.epg.current(id, now) {
                    Some(p) => println!(
                        "{:<24} {} {:>3.0}%  {}",
                        name,
                        p.begin.with_timezone(&chrono::Local).format("%H:%M"),
                        p.progress(now) * 100.0,
                        p.title
                    ),
                    None => println!("{:<24} -", name),
                }
            }
        }
        Command::Poster { urls } => {
            let results = futures::future::join_all(urls.iter().map(|u| ctx.artwork.get(u))).await;
            for (url, result) in urls.iter().zip(results) {
                match result {
                    Ok(path) => println!("{}", path.display()),
                    Err(e) => println!("{}: {}", url, e),
                }
            }
        }
        Command::Watch => {
            ctx.load_lineup().await?;
            let mut events = ctx.epg.subscribe();
            ctx.epg.start();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(EpgEvent::Updated(ids)) => tracing::info!(channels = ids.len(), "guide updated"),
                        Ok(EpgEvent::Failed(e)) => tracing::warn!(error = %e, "{}", e.user_message()),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "event receiver lagged")
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            ctx.epg.stop();
        }
    }

    Ok(())
}
