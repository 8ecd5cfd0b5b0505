use crate::cache::ChannelCache;
use crate::config::ChannelManagerConfig;
use crate::exchange::run_exchange;
use crate::insights::Event;
use crate::transport::MessageSender;
use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::wallet::Wallet;
use futures::stream::StreamExt;

/// The teacher's "6x6" fan-out: up to six allocations closed concurrently, each closing its
/// channels in chunks with an inner exchange concurrency of six.
const INNER_EXCHANGE_CONCURRENCY: usize = 6;

/// Closes every retired channel still sitting in the cache: asks the wallet to close each
/// chunk, removes the rows, and drains the resulting closing messages.
pub(super) async fn close_retired(
    cache: &ChannelCache,
    wallet: &dyn Wallet,
    sender: &dyn MessageSender,
    config: &ChannelManagerConfig,
    insights: &crate::insights::Insights,
) -> anyhow::Result<()> {
    let closable = cache.closable_channels().await?;

    let jobs = closable.into_iter().flat_map(|(ctx, ids)| {
        ids.chunks(config.close_channel_chunk_size)
            .map(|chunk| (ctx.clone(), chunk.to_vec()))
            .collect::<Vec<_>>()
    });

    futures::stream::iter(
        jobs.map(|(ctx, chunk)| close_chunk(cache, wallet, sender, insights, ctx, chunk)),
    )
    .buffer_unordered(config.close_retired_concurrency)
    .collect::<Vec<anyhow::Result<()>>>()
    .await
    .into_iter()
    .collect::<anyhow::Result<Vec<()>>>()?;

    Ok(())
}

async fn close_chunk(
    cache: &ChannelCache,
    wallet: &dyn Wallet,
    sender: &dyn MessageSender,
    insights: &crate::insights::Insights,
    ctx: AllocationId,
    ids: Vec<ChannelId>,
) -> anyhow::Result<()> {
    let outbox = wallet.close_channels(&ids).await?;

    let closed: Vec<_> = ids
        .iter()
        .map(|id| crate::insights::insight(id.clone(), ctx.clone(), 0, Vec::new()))
        .collect();
    insights.post(Event::ChannelsClosed(closed));

    cache.remove_channels(&ids).await?;

    futures::stream::iter(outbox.into_iter().map(|msg| run_exchange(sender, wallet, msg)))
        .buffer_unordered(INNER_EXCHANGE_CONCURRENCY)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(())
}
