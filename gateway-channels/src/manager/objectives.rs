use crate::config::ChannelManagerConfig;
use crate::error::GatewayError;
use crate::exchange::run_exchange;
use crate::transport::MessageSender;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use crate::types::ObjectiveId;
use crate::types::OutgoingMessage;
use crate::wallet::Wallet;
use std::collections::HashMap;
use tokio::sync::broadcast;

fn drain_successes(
    receiver: &mut broadcast::Receiver<ObjectiveId>,
    pending: &mut HashMap<ObjectiveId, ChannelId>,
) {
    loop {
        match receiver.try_recv() {
            Ok(id) => {
                pending.remove(&id);
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Drives a batch of newly created channels to their running state, retrying the exchange on
/// an exponential backoff schedule while the wallet's objective-success events have not yet
/// fired for every one of them.
pub(super) async fn ensure_objectives(
    wallet: &dyn Wallet,
    sender: &dyn MessageSender,
    config: &ChannelManagerConfig,
    objectives: Vec<(ObjectiveId, ChannelId)>,
    initial: OutgoingMessage,
) -> Result<HashMap<ChannelId, ChannelSnapshot>, GatewayError> {
    let mut success_events = wallet.subscribe_objective_successes();
    let mut pending: HashMap<ObjectiveId, ChannelId> = objectives.into_iter().collect();

    let mut results = run_exchange(sender, wallet, initial).await?;
    drain_successes(&mut success_events, &mut pending);

    for delay in config.backoff_strategy.delays() {
        if pending.is_empty() {
            return Ok(results);
        }

        tokio::time::sleep(delay).await;

        let still_pending: Vec<ChannelId> = pending.values().cloned().collect();
        for channel_id in still_pending {
            let synced = wallet
                .sync_channel(&channel_id)
                .await
                .map_err(|e| GatewayError::ProtocolViolation(e.to_string()))?;
            results.insert(
                synced.channel_result.channel_id.clone(),
                synced.channel_result,
            );
            if let Some(outgoing) = synced.outbox.into_iter().next() {
                let more = run_exchange(sender, wallet, outgoing).await?;
                results.extend(more);
            }
        }

        drain_successes(&mut success_events, &mut pending);
    }

    if !pending.is_empty() {
        return Err(GatewayError::ObjectivesNotCompleted(
            pending.into_keys().collect(),
        ));
    }

    Ok(results)
}
