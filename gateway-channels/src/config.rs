use crate::wallet::FundingStrategy;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SETTINGS_FILE_NAME: &str = "gateway-channels-settings.toml";

/// Serde adapter for `std::time::Duration`, following the documented "remote derive"
/// pattern since `Duration`'s own fields are private.
#[derive(Deserialize, Serialize)]
#[serde(remote = "Duration")]
struct DurationDef {
    #[serde(getter = "Duration::as_secs")]
    secs: u64,
    #[serde(getter = "Duration::subsec_nanos")]
    nanos: u32,
}

impl From<DurationDef> for Duration {
    fn from(def: DurationDef) -> Duration {
        Duration::new(def.secs, def.nanos)
    }
}

mod duration_seconds {
    use super::Duration;
    use super::DurationDef;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        DurationDef::serialize(value, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        DurationDef::deserialize(deserializer)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffStrategy {
    #[serde(with = "duration_seconds")]
    pub initial_delay: Duration,
    pub num_attempts: u32,
}

impl BackoffStrategy {
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.num_attempts).map(|n| self.initial_delay * 2u32.pow(n))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChallengeDuration {
    #[serde(with = "duration_seconds")]
    pub ledger_channel: Duration,
    #[serde(with = "duration_seconds")]
    pub payment_channel: Duration,
}

impl Default for ChallengeDuration {
    fn default() -> Self {
        Self {
            ledger_channel: Duration::from_secs(60 * 60),
            payment_channel: Duration::from_secs(10 * 60),
        }
    }
}

/// The capacity controller's tunables. Defaults match the design's exposed-knob values --
/// not derived from any fixed first principle, just pinned so behavior is reproducible.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelManagerConfig {
    pub funds_per_allocation: u64,
    pub payment_channel_funding_amount: u64,
    pub funding_strategy: FundingStrategy,
    pub use_ledger: bool,
    /// The on-chain asset holder contract every channel this process opens is funded
    /// against. One gateway instance talks to a single adjudicator deployment.
    pub asset_holder_address: String,
    pub chain_id: u64,
    pub ensure_allocations_concurrency: Option<usize>,
    #[serde(with = "duration_seconds")]
    pub sync_opening_channels_poll_interval: Duration,
    pub sync_opening_channels_max_attempts: u32,
    pub challenge_duration: ChallengeDuration,
    pub backoff_strategy: BackoffStrategy,
    pub create_channel_chunk_size: usize,
    pub close_channel_chunk_size: usize,
    pub sync_channels_concurrency: usize,
    pub close_retired_concurrency: usize,
}

impl ChannelManagerConfig {
    /// `⌊funds_per_allocation / payment_channel_funding_amount⌋`, the ceiling every
    /// provisioning request is clamped to.
    pub fn max_capacity(&self) -> u64 {
        self.funds_per_allocation / self.payment_channel_funding_amount
    }
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            funds_per_allocation: 1_000_000,
            payment_channel_funding_amount: 10_000,
            funding_strategy: FundingStrategy::Fake,
            use_ledger: true,
            asset_holder_address: "0x0000000000000000000000000000000000000000".to_string(),
            chain_id: 1,
            ensure_allocations_concurrency: Some(10),
            sync_opening_channels_poll_interval: Duration::from_secs(1),
            sync_opening_channels_max_attempts: 30,
            challenge_duration: ChallengeDuration::default(),
            backoff_strategy: BackoffStrategy {
                initial_delay: Duration::from_millis(50),
                num_attempts: 3,
            },
            create_channel_chunk_size: 50,
            close_channel_chunk_size: 50,
            sync_channels_concurrency: 4,
            close_retired_concurrency: 6,
        }
    }
}

impl Serialize for FundingStrategy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            FundingStrategy::Direct => serializer.serialize_str("direct"),
            FundingStrategy::Fake => serializer.serialize_str("fake"),
        }
    }
}

impl<'de> Deserialize<'de> for FundingStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "direct" => Ok(FundingStrategy::Direct),
            "fake" => Ok(FundingStrategy::Fake),
            other => Err(serde::de::Error::custom(format!(
                "unknown funding strategy `{other}`, expected `direct` or `fake`"
            ))),
        }
    }
}

/// Top-level settings, loaded from a TOML file with defaults persisted back to disk on
/// first run -- the same load-or-default-and-write pattern the teacher uses for its own
/// settings file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub channel_manager: ChannelManagerConfig,

    /// Special field, not written out: where this settings file lives.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_manager: ChannelManagerConfig::default(),
            path: None,
        }
    }
}

async fn read_settings(data_dir: &Path) -> Result<Settings> {
    let settings_path = data_dir.join(SETTINGS_FILE_NAME);
    let data = fs::read_to_string(settings_path).await?;
    toml::from_str(&data).context("unable to parse settings file")
}

impl Settings {
    pub async fn new(data_dir: &Path) -> Self {
        match read_settings(data_dir).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("unable to read {SETTINGS_FILE_NAME}, using defaults: {e:#}");
                let new = Settings {
                    path: Some(data_dir.join(SETTINGS_FILE_NAME)),
                    ..Settings::default()
                };
                if let Err(e) = new.write_to_file().await {
                    tracing::error!("unable to write default settings to file: {e:#}");
                } else {
                    tracing::info!("default settings written to file");
                }
                new
            }
        }
    }

    pub async fn write_to_file(&self) -> Result<()> {
        let data = toml::to_string_pretty(&self).context("unable to serialize settings to TOML")?;

        let settings_path = self.path.as_ref().context("settings path not set")?.clone();
        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(settings_path).await?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
