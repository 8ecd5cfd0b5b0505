use crate::db;
use crate::error::GatewayError;
use crate::error::Result as GatewayResult;
use crate::insights;
use crate::insights::Event;
use crate::insights::Insights;
use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use crate::types::LedgerSnapshot;
use crate::types::RetireReport;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::Pool;
use diesel::Connection;
use diesel::PgConnection;
use num_bigint::BigUint;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;

pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;

/// The durable map of channels keyed by `channelId`, indexed by `contextId`, with the lease
/// broker that prevents two holders from mutating the same channel at once.
///
/// `ChannelCache` never refers back to `ChannelManager`; the dependency is one-way.
#[derive(Clone)]
pub struct ChannelCache {
    pool: ConnectionPool,
    insights: Insights,
}

impl ChannelCache {
    pub fn new(pool: ConnectionPool, insights: Insights) -> Self {
        Self { pool, insights }
    }

    fn conn(&self) -> GatewayResult<diesel::r2d2::PooledConnection<ConnectionManager<PgConnection>>> {
        Ok(self.pool.get()?)
    }

    /// Runs `diesel_migrations`' embedded migrations against the backing store. Idempotent.
    pub async fn initialize(&self) -> GatewayResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get()?;
            crate::run_migration(&mut conn);
            Ok(())
        })
        .await
        .expect("initialize task panicked")
    }

    /// Drops every row. Intended for test teardown, not production use.
    pub async fn clear_cache(&self) -> GatewayResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get()?;
            db::channels::clear_cache(&mut conn)?;
            Ok(())
        })
        .await
        .expect("clear_cache task panicked")
    }

    /// The pool has no separate teardown beyond being dropped; kept as an explicit, named
    /// lifecycle method so callers don't need to know that.
    pub fn destroy(self) {
        drop(self);
    }

    /// Inserts newly created channels, upserting on conflict (see `db::channels::insert_channels`
    /// for the exact "0 -> 3" promotion law). Returns the channel ids actually inserted or
    /// promoted, and posts `ChannelsReady` for every row promoted out of `turn_num = 0`.
    pub async fn insert_channels(
        &self,
        ctx: &AllocationId,
        channels: &[ChannelSnapshot],
    ) -> GatewayResult<Vec<ChannelId>> {
        let pool = self.pool.clone();
        let rows: Vec<db::channels::Row> = channels.iter().map(db::channels::Row::from).collect();
        let ctx = ctx.clone();
        let insights = self.insights.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<ChannelId>> {
            let mut conn = pool.get()?;
            let ids = db::channels::insert_channels(&mut conn, &rows)?;

            let ready: Vec<_> = rows
                .iter()
                .filter(|r| ids.contains(&r.channel_id) && r.turn_num == 3)
                .map(|r| {
                    insights::insight(
                        ChannelId(r.channel_id.clone()),
                        ctx.clone(),
                        r.turn_num as u64,
                        r.outcome.clone(),
                    )
                })
                .collect();
            if !ready.is_empty() {
                insights.post(Event::ChannelsReady(ready));
            }

            Ok(ids.into_iter().map(ChannelId).collect())
        })
        .await
        .expect("insert_channels task panicked")
    }

    pub async fn remove_channels(&self, ids: &[ChannelId]) -> GatewayResult<()> {
        let pool = self.pool.clone();
        let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get()?;
            db::channels::remove_channels(&mut conn, &ids)?;
            Ok(())
        })
        .await
        .expect("remove_channels task panicked")
    }

    /// Flips `retired = true` on every non-retired row for `ctx` and reports the total
    /// indexer balance retired. Posts `ChannelsRetired`.
    pub async fn retire_channels(&self, ctx: &AllocationId) -> GatewayResult<RetireReport> {
        let pool = self.pool.clone();
        let ctx_id = ctx.0.clone();
        let rows = tokio::task::spawn_blocking(move || -> GatewayResult<Vec<db::channels::Row>> {
            let mut conn = pool.get()?;
            Ok(db::channels::retire_channels(&mut conn, &ctx_id)?)
        })
        .await
        .expect("retire_channels task panicked")?;

        let amount = rows
            .iter()
            .fold(BigUint::from(0u32), |acc, r| {
                acc + db::channels::decimal_to_big_uint(&r.receiver_bal)
            });
        let channel_ids: Vec<ChannelId> = rows.into_iter().map(|r| ChannelId(r.channel_id)).collect();
        let report = RetireReport {
            amount,
            channel_ids,
        };
        self.insights.post(Event::ChannelsRetired {
            context_id: ctx.clone(),
            report: report.clone(),
        });
        Ok(report)
    }

    pub async fn active_channels(&self, ctx: &AllocationId) -> GatewayResult<Vec<ChannelId>> {
        let pool = self.pool.clone();
        let ctx_id = ctx.0.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<ChannelId>> {
            let mut conn = pool.get()?;
            Ok(db::channels::active_channels(&mut conn, &ctx_id)?
                .into_iter()
                .map(ChannelId)
                .collect())
        })
        .await
        .expect("active_channels task panicked")
    }

    pub async fn active_allocations(
        &self,
        filter: Option<&[AllocationId]>,
    ) -> GatewayResult<HashMap<AllocationId, u64>> {
        let pool = self.pool.clone();
        let filter = filter.map(|ids| ids.iter().map(|id| id.0.clone()).collect::<Vec<_>>());
        tokio::task::spawn_blocking(move || -> GatewayResult<HashMap<AllocationId, u64>> {
            let mut conn = pool.get()?;
            let counts =
                db::channels::active_allocation_counts(&mut conn, filter.as_deref())?;
            Ok(counts
                .into_iter()
                .map(|(ctx, count)| (AllocationId(ctx), count as u64))
                .collect())
        })
        .await
        .expect("active_allocations task panicked")
    }

    pub async fn closable_channels(&self) -> GatewayResult<HashMap<AllocationId, Vec<ChannelId>>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<HashMap<AllocationId, Vec<ChannelId>>> {
            let mut conn = pool.get()?;
            let rows = db::channels::closable_channels(&mut conn)?;
            let mut out: HashMap<AllocationId, Vec<ChannelId>> = HashMap::new();
            for (ctx, channel_id) in rows {
                out.entry(AllocationId(ctx))
                    .or_default()
                    .push(ChannelId(channel_id));
            }
            Ok(out)
        })
        .await
        .expect("closable_channels task panicked")
    }

    pub async fn readying_channels(&self, ctx: &AllocationId) -> GatewayResult<Vec<ChannelId>> {
        let pool = self.pool.clone();
        let ctx_id = ctx.0.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<ChannelId>> {
            let mut conn = pool.get()?;
            Ok(db::channels::readying_channels(&mut conn, &ctx_id)?
                .into_iter()
                .map(ChannelId)
                .collect())
        })
        .await
        .expect("readying_channels task panicked")
    }

    pub async fn stalled_channels(
        &self,
        min_age: Duration,
        limit: Option<i64>,
        ctx: Option<&AllocationId>,
    ) -> GatewayResult<Vec<ChannelId>> {
        let pool = self.pool.clone();
        let cutoff = OffsetDateTime::now_utc() - min_age;
        let ctx = ctx.map(|c| c.0.clone());
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<ChannelId>> {
            let mut conn = pool.get()?;
            Ok(
                db::channels::stalled_channels(&mut conn, cutoff, ctx.as_deref(), limit)?
                    .into_iter()
                    .map(ChannelId)
                    .collect(),
            )
        })
        .await
        .expect("stalled_channels task panicked")
    }

    pub async fn insert_ledger_channel(
        &self,
        ctx: &AllocationId,
        id: &ChannelId,
        initial_outcome: &[u8],
    ) -> GatewayResult<()> {
        let pool = self.pool.clone();
        let ctx = ctx.0.clone();
        let id = id.0.clone();
        let initial_outcome = initial_outcome.to_vec();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get()?;
            db::ledger_channels::insert(&mut conn, &ctx, &id, &initial_outcome)?;
            Ok(())
        })
        .await
        .expect("insert_ledger_channel task panicked")
    }

    pub async fn get_ledger_channels(&self, ctx: &AllocationId) -> GatewayResult<Vec<LedgerSnapshot>> {
        let pool = self.pool.clone();
        let ctx = ctx.0.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<LedgerSnapshot>> {
            let mut conn = pool.get()?;
            Ok(db::ledger_channels::get_for_context(&mut conn, &ctx)?
                .into_iter()
                .map(LedgerSnapshot::from)
                .collect())
        })
        .await
        .expect("get_ledger_channels task panicked")
    }

    pub async fn remove_ledger_channels(&self, ids: &[ChannelId]) -> GatewayResult<()> {
        let pool = self.pool.clone();
        let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get()?;
            db::ledger_channels::remove(&mut conn, &ids)?;
            Ok(())
        })
        .await
        .expect("remove_ledger_channels task panicked")
    }

    pub async fn submit_receipt(&self, result: ChannelSnapshot) -> GatewayResult<ChannelSnapshot> {
        if result.turn_num % 2 == 1 && result.turn_num != 0 {
            return Err(GatewayError::ProtocolViolation(format!(
                "refusing to submit receipt for channel {} at turn_num {} -- not a peer-move state",
                result.channel_id, result.turn_num
            )));
        }
        let pool = self.pool.clone();
        let row = db::channels::Row::from(&result);
        tokio::task::spawn_blocking(move || -> GatewayResult<ChannelSnapshot> {
            let mut conn = pool.get()?;
            db::channels::write_back(&mut conn, &row)?;
            let stored = db::channels::get_by_channel_id(&mut conn, &row.channel_id)?
                .ok_or_else(|| GatewayError::Storage(diesel::result::Error::NotFound))?;
            Ok(stored.into())
        })
        .await
        .expect("submit_receipt task panicked")
    }

    /// The lease protocol: picks one free row for `ctx` with `SELECT ... FOR UPDATE SKIP
    /// LOCKED`, hands the decoded snapshot to `critical`, and writes the returned snapshot
    /// back before committing -- all inside a single transaction, so at most one holder can
    /// be inside `critical` for a given channel at a time, across the whole process fleet.
    ///
    /// `critical` is async (it typically calls out to the wallet), but `diesel` transactions
    /// are synchronous, so the whole transaction runs on a blocking thread and `critical` is
    /// driven to completion with `Handle::block_on` from inside it -- the lock is held for the
    /// duration, never released early just because the call is awaiting I/O.
    pub async fn acquire_channel<F, Fut, R>(
        &self,
        ctx: &AllocationId,
        critical: F,
    ) -> anyhow::Result<R>
    where
        F: FnOnce(ChannelSnapshot) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<(ChannelSnapshot, R)>> + Send,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        let ctx = ctx.clone();
        let handle = tokio::runtime::Handle::current();

        tokio::task::spawn_blocking(move || -> anyhow::Result<R> {
            let mut conn = pool.get()?;
            conn.transaction(|conn: &mut PgConnection| -> anyhow::Result<R> {
                let row = db::channels::acquire_free_row(conn, &ctx.0)?
                    .ok_or_else(|| anyhow::Error::new(GatewayError::NoFreeChannels(ctx.clone())))?;
                let snapshot: ChannelSnapshot = row.into();

                let (new_snapshot, result) = handle.block_on(critical(snapshot))?;

                if !new_snapshot.retired {
                    let new_row = db::channels::Row::from(&new_snapshot);
                    db::channels::write_back(conn, &new_row)?;
                }

                Ok(result)
            })
        })
        .await
        .expect("acquire_channel task panicked")
    }
}
