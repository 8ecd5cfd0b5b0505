use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use crate::types::LedgerSnapshot;
use crate::types::ObjectiveId;
use crate::types::OutgoingMessage;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// How a ledger channel's capital gets locked on-chain. `Fake` skips confirmation waits
/// entirely and is only meant for tests and development networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStrategy {
    Direct,
    Fake,
}

/// The start state handed to `create_channels`/`create_ledger_channel`: the participant
/// tuple, asset holder, attestation app address, chain id, per-channel amount and challenge
/// duration. The wallet is the only party that interprets its contents; the core treats it as
/// an opaque, serialisable blob it assembles from allocation + config data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartState {
    pub allocation: AllocationId,
    pub participants: (String, String),
    pub asset_holder_address: String,
    pub attestation_app_address: String,
    pub chain_id: u64,
    pub amount: num_bigint::BigUint,
    pub challenge_duration: Duration,
    pub ledger_channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelsResult {
    pub channel_results: Vec<ChannelSnapshot>,
    pub outbox: Vec<OutgoingMessage>,
    pub new_objectives: Vec<ObjectiveId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLedgerResult {
    pub channel_result: LedgerSnapshot,
    pub outbox: OutgoingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChannelParams {
    pub channel_id: ChannelId,
    pub allocations: Vec<u8>,
    pub app_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChannelResult {
    pub channel_result: ChannelSnapshot,
    pub outbox: Vec<OutgoingMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessageResult {
    pub channel_results: Vec<ChannelSnapshot>,
    pub outbox: Vec<OutgoingMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChannelResult {
    pub channel_result: ChannelSnapshot,
    pub outbox: Vec<OutgoingMessage>,
}

/// The cryptographic state-channel wallet: out of scope to implement, consumed here as a
/// trait so tests can substitute a fake. All operations may hit disk or a remote oracle, so
/// the trait is async.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn create_channels(
        &self,
        start_state: &StartState,
        n: usize,
    ) -> anyhow::Result<CreateChannelsResult>;

    async fn create_ledger_channel(
        &self,
        start_state: &StartState,
        strategy: FundingStrategy,
    ) -> anyhow::Result<CreateLedgerResult>;

    async fn update_channel(
        &self,
        params: UpdateChannelParams,
    ) -> anyhow::Result<UpdateChannelResult>;

    async fn push_message(&self, payload: &[u8]) -> anyhow::Result<PushMessageResult>;

    async fn sync_channel(&self, channel_id: &ChannelId) -> anyhow::Result<SyncChannelResult>;

    async fn close_channels(&self, ids: &[ChannelId]) -> anyhow::Result<Vec<OutgoingMessage>>;

    async fn get_channels(&self) -> anyhow::Result<Vec<ChannelSnapshot>>;

    async fn get_ledger_channels(
        &self,
        asset_holder_address: &str,
        participants: &(String, String),
    ) -> anyhow::Result<Vec<LedgerSnapshot>>;

    /// Fires exactly once per objective reaching terminal success.
    fn subscribe_objective_successes(&self) -> broadcast::Receiver<ObjectiveId>;

    async fn register_app_bytecode(&self, address: &str, bytecode: &[u8]) -> anyhow::Result<()>;

    fn signing_address(&self) -> String;
}
