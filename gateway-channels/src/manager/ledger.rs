use crate::cache::ChannelCache;
use crate::config::ChannelManagerConfig;
use crate::error::GatewayError;
use crate::exchange::run_exchange;
use crate::transport::MessageSender;
use crate::types::Allocation;
use crate::types::ChannelId;
use crate::wallet::StartState;
use crate::wallet::Wallet;
use std::time::Duration;

pub(super) fn build_start_state(
    allocation: &Allocation,
    wallet: &dyn Wallet,
    config: &ChannelManagerConfig,
    amount: num_bigint::BigUint,
    challenge_duration: Duration,
    ledger_channel_id: Option<ChannelId>,
) -> StartState {
    StartState {
        allocation: allocation.id.clone(),
        participants: (wallet.signing_address(), allocation.indexer_signing_address.clone()),
        asset_holder_address: config.asset_holder_address.clone(),
        attestation_app_address: allocation.deployment_id.clone(),
        chain_id: config.chain_id,
        amount,
        challenge_duration,
        ledger_channel_id,
    }
}

/// Finds an existing ledger channel for `allocation`, or creates and hands off a fresh one,
/// then waits for the wallet to report it funded and running either way. The actual on-chain
/// confirmation work for `Direct` funding is the wallet collaborator's problem (out of scope
/// here); this only polls for and waits on the outcome.
pub(super) async fn ensure_ledger_channel(
    cache: &ChannelCache,
    wallet: &dyn Wallet,
    sender: &dyn MessageSender,
    config: &ChannelManagerConfig,
    allocation: &Allocation,
) -> anyhow::Result<ChannelId> {
    let existing = cache.get_ledger_channels(&allocation.id).await?;
    if let Some(existing) = existing.into_iter().next() {
        // Found in the cache, but it may be behind -- a prior process could have created it
        // and crashed before on-chain funding confirmed.
        ensure_channel_open(wallet, config, allocation, &existing.channel_id).await?;
        return Ok(existing.channel_id);
    }

    let start_state = build_start_state(
        allocation,
        wallet,
        config,
        num_bigint::BigUint::from(config.funds_per_allocation),
        config.challenge_duration.ledger_channel,
        None,
    );

    let result = wallet
        .create_ledger_channel(&start_state, config.funding_strategy)
        .await?;

    cache
        .insert_ledger_channel(
            &allocation.id,
            &result.channel_result.channel_id,
            &result.channel_result.initial_outcome,
        )
        .await?;

    run_exchange(sender, wallet, result.outbox).await?;

    ensure_channel_open(wallet, config, allocation, &result.channel_result.channel_id).await?;

    Ok(result.channel_result.channel_id)
}

/// Polls the wallet until it reports the ledger channel as funded and running, or gives up
/// after `sync_opening_channels_max_attempts`. This is the on-chain confirmation wait a
/// `Direct` funding strategy needs; `Fake` is expected to resolve on the very first poll.
async fn ensure_channel_open(
    wallet: &dyn Wallet,
    config: &ChannelManagerConfig,
    allocation: &Allocation,
    channel_id: &ChannelId,
) -> anyhow::Result<()> {
    let participants = (wallet.signing_address(), allocation.indexer_signing_address.clone());

    for _ in 0..config.sync_opening_channels_max_attempts {
        let ledgers = wallet
            .get_ledger_channels(&config.asset_holder_address, &participants)
            .await?;
        if ledgers.iter().any(|l| &l.channel_id == channel_id) {
            return Ok(());
        }
        tokio::time::sleep(config.sync_opening_channels_poll_interval).await;
    }

    Err(GatewayError::LedgerNotConfirmed(allocation.id.clone()).into())
}
