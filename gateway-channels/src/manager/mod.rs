mod healing;
mod ledger;
mod objectives;
mod retire;

use crate::cache::ChannelCache;
use crate::config::ChannelManagerConfig;
use crate::error::GatewayError;
use crate::exchange::run_exchange;
use crate::insights::insight;
use crate::insights::Event;
use crate::insights::Insights;
use crate::transport::MessageSender;
use crate::types::Allocation;
use crate::types::AllocationId;
use crate::types::CapacityKind;
use crate::types::CapacityRequest;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use crate::wallet::Wallet;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// The capacity controller: keeps `active_channels(allocation) == requested_capacity` for
/// every known allocation, driving wallet operations and message exchanges to open, heal,
/// retire and close channels as needed. Holds the wallet and message transport as shared,
/// process-wide collaborators -- never behind lazy statics, always passed in explicitly so
/// tests can substitute fakes.
pub struct ChannelManager {
    cache: ChannelCache,
    wallet: Arc<dyn Wallet>,
    sender: Arc<dyn MessageSender>,
    insights: Insights,
    config: ChannelManagerConfig,
    sync_allocations_lock: tokio::sync::Mutex<()>,
}

impl ChannelManager {
    pub fn new(
        cache: ChannelCache,
        wallet: Arc<dyn Wallet>,
        sender: Arc<dyn MessageSender>,
        insights: Insights,
        config: ChannelManagerConfig,
    ) -> Self {
        Self {
            cache,
            wallet,
            sender,
            insights,
            config,
            sync_allocations_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn channel_insights(&self) -> &Insights {
        &self.insights
    }

    pub async fn channel_count(
        &self,
        filter: Option<&[AllocationId]>,
    ) -> anyhow::Result<HashMap<AllocationId, u64>> {
        Ok(self.cache.active_allocations(filter).await?)
    }

    /// Reconciles the cache from the wallet on startup: reads every channel the wallet still
    /// holds persistent state for and upserts it into the cache, grouped by allocation. Lets a
    /// fresh process pick up where a crashed one left off, since the wallet -- not the cache --
    /// is the durable source of truth for what actually exists.
    pub async fn populate_cache(&self) -> anyhow::Result<()> {
        let channels = self.wallet.get_channels().await?;

        let mut by_allocation: HashMap<AllocationId, Vec<ChannelSnapshot>> = HashMap::new();
        for snapshot in channels {
            by_allocation
                .entry(snapshot.context_id.clone())
                .or_default()
                .push(snapshot);
        }

        for (ctx, snapshots) in by_allocation {
            self.cache.insert_channels(&ctx, &snapshots).await?;
        }

        Ok(())
    }

    fn target_capacity(current: u64, request: &CapacityRequest) -> Result<u64, GatewayError> {
        match request.kind {
            CapacityKind::SetTo => {
                if request.num < 0 {
                    return Err(GatewayError::Validation(
                        "SetTo capacity must not be negative".to_string(),
                    ));
                }
                Ok(current.max(request.num as u64))
            }
            CapacityKind::IncreaseBy => {
                if request.num < 0 {
                    return Err(GatewayError::Validation(
                        "IncreaseBy amount must not be negative".to_string(),
                    ));
                }
                Ok(current + request.num as u64)
            }
            CapacityKind::ScaleBy => {
                if request.num < 1 {
                    return Err(GatewayError::Validation(
                        "ScaleBy factor must be at least 1".to_string(),
                    ));
                }
                if current == 0 {
                    return Err(GatewayError::Validation(
                        "cannot scale an allocation with zero current capacity".to_string(),
                    ));
                }
                Ok(current * request.num as u64)
            }
        }
    }

    /// Provisions every requested allocation in parallel, capped at
    /// `ensure_allocations_concurrency`.
    pub async fn ensure_allocations(&self, requests: &[CapacityRequest]) -> anyhow::Result<()> {
        let active = self.cache.active_allocations(None).await?;

        let mut planned = Vec::with_capacity(requests.len());
        for request in requests {
            let current = active.get(&request.allocation.id).copied().unwrap_or(0);
            let target = Self::target_capacity(current, request)?;
            planned.push((request.allocation.clone(), target));
        }

        let concurrency = self.config.ensure_allocations_concurrency.unwrap_or(planned.len().max(1));

        futures::stream::iter(
            planned
                .into_iter()
                .map(|(allocation, target)| self.ensure_allocation(allocation, target)),
        )
        .buffer_unordered(concurrency)
        .collect::<Vec<anyhow::Result<()>>>()
        .await
        .into_iter()
        .collect::<anyhow::Result<Vec<()>>>()?;

        Ok(())
    }

    async fn ensure_allocation(&self, allocation: Allocation, capacity: u64) -> anyhow::Result<()> {
        let max_capacity = self.config.max_capacity();
        let capacity = if capacity > max_capacity {
            tracing::warn!(
                allocation = %allocation.id,
                requested = capacity,
                max_capacity,
                "clamping requested capacity to the configured maximum"
            );
            max_capacity
        } else {
            capacity
        };

        let ledger_channel_id = if self.config.use_ledger {
            Some(
                ledger::ensure_ledger_channel(
                    &self.cache,
                    self.wallet.as_ref(),
                    self.sender.as_ref(),
                    &self.config,
                    &allocation,
                )
                .await?,
            )
        } else {
            None
        };

        let active = self.cache.active_channels(&allocation.id).await?;

        let readying = self.cache.readying_channels(&allocation.id).await?;
        if !readying.is_empty() {
            self.sync_channels(Duration::ZERO, None, Some(std::slice::from_ref(&allocation.id)))
                .await?;
        }

        let channels_required = capacity as i64 - active.len() as i64;
        if channels_required <= 0 {
            return Ok(());
        }
        let channels_required = channels_required as usize;

        let start_state = ledger::build_start_state(
            &allocation,
            self.wallet.as_ref(),
            &self.config,
            num_bigint::BigUint::from(self.config.payment_channel_funding_amount),
            self.config.challenge_duration.payment_channel,
            ledger_channel_id,
        );

        let mut remaining = channels_required;
        while remaining > 0 {
            let chunk_size = remaining.min(self.config.create_channel_chunk_size);
            remaining -= chunk_size;

            let created = self.wallet.create_channels(&start_state, chunk_size).await?;
            if created.outbox.len() != 1 {
                anyhow::bail!(GatewayError::ProtocolViolation(format!(
                    "expected exactly one outbox item from create_channels, got {}",
                    created.outbox.len()
                )));
            }

            let created_insights = created
                .channel_results
                .iter()
                .map(|c| insight(c.channel_id.clone(), allocation.id.clone(), c.turn_num, c.outcome.clone()))
                .collect();
            self.insights.post(Event::ChannelsCreated(created_insights));

            let objective_channels: Vec<(_, ChannelId)> = created
                .new_objectives
                .into_iter()
                .zip(created.channel_results.iter().map(|c| c.channel_id.clone()))
                .collect();

            let outgoing = created
                .outbox
                .into_iter()
                .next()
                .expect("checked len == 1 above");

            let running = objectives::ensure_objectives(
                self.wallet.as_ref(),
                self.sender.as_ref(),
                &self.config,
                objective_channels,
                outgoing,
            )
            .await?;

            let snapshots: Vec<_> = running.into_values().collect();
            self.cache.insert_channels(&allocation.id, &snapshots).await?;
        }

        Ok(())
    }

    /// Computes the set diff against what is currently active and reconciles it: ensures the
    /// requested allocations, then retires and closes whatever is no longer requested.
    /// Serialised by a named mutex so two concurrent plans cannot interleave their reads of
    /// `active_allocations` with their writes.
    pub async fn sync_allocations(&self, requests: &[CapacityRequest]) -> anyhow::Result<()> {
        let _guard = self.sync_allocations_lock.lock().await;

        let active = self.cache.active_allocations(None).await?;
        let requested: HashSet<AllocationId> =
            requests.iter().map(|r| r.allocation.id.clone()).collect();
        let to_remove: Vec<AllocationId> = active
            .keys()
            .filter(|id| !requested.contains(id))
            .cloned()
            .collect();

        self.ensure_allocations(requests).await?;
        self.remove_allocations(&to_remove).await?;

        Ok(())
    }

    /// Retires, closes and (if configured) tears down the ledgers of the given allocations.
    pub async fn remove_allocations(&self, ids: &[AllocationId]) -> anyhow::Result<()> {
        for id in ids {
            self.cache.retire_channels(id).await?;
        }

        retire::close_retired(
            &self.cache,
            self.wallet.as_ref(),
            self.sender.as_ref(),
            &self.config,
            &self.insights,
        )
        .await?;

        if self.config.use_ledger {
            for id in ids {
                let ledgers = self.cache.get_ledger_channels(id).await?;
                let ledger_ids: Vec<ChannelId> =
                    ledgers.into_iter().map(|l| l.channel_id).collect();
                if ledger_ids.is_empty() {
                    continue;
                }
                let outbox = self.wallet.close_channels(&ledger_ids).await?;
                self.cache.remove_ledger_channels(&ledger_ids).await?;
                for msg in outbox {
                    run_exchange(self.sender.as_ref(), self.wallet.as_ref(), msg).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn sync_channels(
        &self,
        stalled_for: Duration,
        limit: Option<i64>,
        allocation_ids: Option<&[AllocationId]>,
    ) -> anyhow::Result<Vec<ChannelId>> {
        healing::sync_channels(
            &self.cache,
            self.wallet.as_ref(),
            self.sender.as_ref(),
            &self.config,
            &self.insights,
            stalled_for,
            limit,
            allocation_ids,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: CapacityKind, num: i64) -> CapacityRequest {
        CapacityRequest {
            allocation: Allocation {
                id: AllocationId("allocation-a".to_string()),
                indexer_url: "https://indexer.example/".to_string(),
                indexer_signing_address: "0xindexer".to_string(),
                deployment_id: "deployment-1".to_string(),
            },
            kind,
            num,
        }
    }

    #[test]
    fn set_to_never_shrinks_below_current() {
        let target = ChannelManager::target_capacity(5, &request(CapacityKind::SetTo, 3)).unwrap();
        assert_eq!(target, 5);

        let target = ChannelManager::target_capacity(5, &request(CapacityKind::SetTo, 9)).unwrap();
        assert_eq!(target, 9);
    }

    #[test]
    fn set_to_rejects_negative_num() {
        let err = ChannelManager::target_capacity(5, &request(CapacityKind::SetTo, -1)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn increase_by_adds_to_current() {
        let target =
            ChannelManager::target_capacity(5, &request(CapacityKind::IncreaseBy, 4)).unwrap();
        assert_eq!(target, 9);
    }

    #[test]
    fn increase_by_rejects_negative_num() {
        let err =
            ChannelManager::target_capacity(5, &request(CapacityKind::IncreaseBy, -1)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn scale_by_multiplies_current() {
        let target = ChannelManager::target_capacity(5, &request(CapacityKind::ScaleBy, 3)).unwrap();
        assert_eq!(target, 15);
    }

    #[test]
    fn scale_by_rejects_factor_below_one() {
        let err = ChannelManager::target_capacity(5, &request(CapacityKind::ScaleBy, 0)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn scale_by_rejects_zero_current_capacity() {
        let err = ChannelManager::target_capacity(0, &request(CapacityKind::ScaleBy, 2)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
