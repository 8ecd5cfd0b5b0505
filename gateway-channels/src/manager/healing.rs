use crate::cache::ChannelCache;
use crate::config::ChannelManagerConfig;
use crate::exchange::run_exchange;
use crate::insights::insight;
use crate::insights::Event;
use crate::insights::Insights;
use crate::transport::MessageSender;
use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::wallet::Wallet;
use futures::stream::StreamExt;
use std::collections::HashSet;
use std::time::Duration;

/// Heals channels stuck on the peer's turn: re-sends the last outgoing payload and feeds
/// any response back into the cache. An allocation whose exchange fails outright is presumed
/// to have an uncooperative peer and is retired wholesale (see the open question on a
/// per-channel failure threshold, recorded in the design notes). When the caller did not
/// scope the scan to specific allocations we cannot attribute an opaque transport failure to
/// one, so it is just logged -- the channel stays stalled and is picked up by the next scan.
pub(super) async fn sync_channels(
    cache: &ChannelCache,
    wallet: &dyn Wallet,
    sender: &dyn MessageSender,
    config: &ChannelManagerConfig,
    insights: &Insights,
    stalled_for: Duration,
    limit: Option<i64>,
    allocation_ids: Option<&[AllocationId]>,
) -> anyhow::Result<Vec<ChannelId>> {
    let stalled: Vec<(Option<AllocationId>, ChannelId)> = match allocation_ids {
        Some(ids) => {
            let mut out = Vec::new();
            for id in ids {
                let channels = cache.stalled_channels(stalled_for, limit, Some(id)).await?;
                out.extend(channels.into_iter().map(|c| (Some(id.clone()), c)));
            }
            out
        }
        None => cache
            .stalled_channels(stalled_for, limit, None)
            .await?
            .into_iter()
            .map(|c| (None, c))
            .collect(),
    };

    let recovered = futures::stream::iter(stalled.into_iter().map(|(ctx, channel_id)| async move {
        match wallet.sync_channel(&channel_id).await {
            Ok(synced) => match synced.outbox.into_iter().next() {
                Some(outgoing) => match run_exchange(sender, wallet, outgoing).await {
                    Ok(results) => Ok(results.into_values().collect::<Vec<_>>()),
                    Err(e) => Err((ctx, e.to_string())),
                },
                None => Ok(vec![synced.channel_result]),
            },
            Err(e) => Err((ctx, e.to_string())),
        }
    }))
    .buffer_unordered(config.sync_channels_concurrency)
    .collect::<Vec<_>>()
    .await;

    let mut resumed = Vec::new();
    let mut synced_insights = Vec::new();
    let mut uncooperative: HashSet<AllocationId> = HashSet::new();

    for outcome in recovered {
        match outcome {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    if snapshot.turn_num % 2 == 0 && snapshot.turn_num >= 3 {
                        let channel_id = snapshot.channel_id.clone();
                        let context_id = snapshot.context_id.clone();
                        let turn_num = snapshot.turn_num;
                        let outcome = snapshot.outcome.clone();
                        match cache.submit_receipt(snapshot).await {
                            Ok(_) => {
                                resumed.push(channel_id.clone());
                                synced_insights
                                    .push(insight(channel_id, context_id, turn_num, outcome));
                            }
                            Err(e) => {
                                tracing::warn!(%e, "failed to return healed channel to the free pool");
                                uncooperative.insert(context_id);
                            }
                        }
                    }
                }
            }
            Err((ctx, error)) => {
                tracing::warn!(error, "channel heal exchange failed");
                if let Some(ctx) = ctx {
                    uncooperative.insert(ctx);
                }
            }
        }
    }

    for ctx in &uncooperative {
        if let Err(e) = cache.retire_channels(ctx).await {
            tracing::error!(%e, %ctx, "failed to retire channels for an uncooperative allocation");
        }
    }

    if !synced_insights.is_empty() {
        insights.post(Event::ChannelsSynced(synced_insights));
    }

    Ok(resumed)
}
