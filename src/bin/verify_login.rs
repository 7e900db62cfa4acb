use iptv_sync_lib::config::SyncConfig;
use iptv_sync_lib::context::SyncContext;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = SyncConfig::load()?;
    println!("Config path: {:?}", config.path());
    if !config.is_configured() {
        println!("No server configured.");
        return Ok(());
    }

    let ctx = SyncContext::from_config(config)?;
    match ctx.session.ensure_session().await {
        Ok(_) => {
            println!("Login OK for {}", ctx.config.username);
            match ctx.load_lineup().await {
                Ok(lineup) => println!("Lineup: {} channels in {} groups", lineup.len(), lineup.groups().len()),
                Err(e) => println!("Lineup failed: {} ({:?})", e.user_message(), e.kind()),
            }
        }
        Err(e) => println!("Login failed: {} ({:?})", e.user_message(), e.kind()),
    }
    Ok(())
}
