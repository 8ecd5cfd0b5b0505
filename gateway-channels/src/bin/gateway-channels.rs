use anyhow::Context;
use anyhow::Result;
use diesel::r2d2;
use diesel::r2d2::ConnectionManager;
use diesel::PgConnection;
use gateway_channels::cache::ChannelCache;
use gateway_channels::cli::Opts;
use gateway_channels::config::Settings;
use gateway_channels::insights::Insights;
use gateway_channels::logger;
use tracing::metadata::LevelFilter;

/// Bootstraps the channel pool core's ambient stack: settings, logging, the connection pool
/// and embedded migrations. Wiring a concrete `Wallet` and `MessageSender` -- and the HTTP
/// surface that would sit in front of `ChannelManager`/`PaymentManager` -- belongs to the
/// deployment that embeds this crate, not to this repository.
#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::read();

    logger::init_tracing(LevelFilter::INFO, opts.json)?;

    let data_dir = opts.data_dir()?;
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).context("could not create data dir")?;
    }
    let settings = Settings::new(&data_dir).await;
    tracing::info!(channel_manager = ?settings.channel_manager, "loaded settings");

    let manager = ConnectionManager::<PgConnection>::new(opts.database.clone());
    let pool = r2d2::Pool::builder()
        .build(manager)
        .context("failed to create connection pool")?;

    let cache = ChannelCache::new(pool, Insights::new());
    cache.initialize().await?;

    tracing::info!("gateway channel pool core initialized");

    Ok(())
}
