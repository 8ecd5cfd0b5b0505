mod support;

use gateway_channels::cache::ChannelCache;
use gateway_channels::error::GatewayError;
use gateway_channels::insights::Insights;
use gateway_channels::types::AllocationId;
use gateway_channels::types::ChannelId;
use gateway_channels::types::ChannelSnapshot;
use num_bigint::BigUint;
use testcontainers::clients::Cli;
use time::OffsetDateTime;

fn channel(ctx: &AllocationId, n: u32) -> ChannelSnapshot {
    ChannelSnapshot {
        channel_id: ChannelId(format!("channel-{n}")),
        context_id: ctx.clone(),
        turn_num: 3,
        payer_bal: BigUint::from(8_000u32),
        receiver_bal: BigUint::from(2_000u32),
        app_data: vec![],
        outcome: vec![],
        retired: false,
        updated_at: OffsetDateTime::now_utc(),
    }
}

/// (P1) Lease uniqueness: with `M` eligible channels and `N` concurrent `acquire_channel`
/// calls for the same allocation, exactly `min(N, M)` succeed and no two callers observe the
/// same channel id.
#[tokio::test]
async fn concurrent_acquires_never_double_lease_a_channel() {
    let docker = Cli::default();
    let (_container, conn_spec) = support::start_postgres(&docker).unwrap();
    let pool = support::build_pool(&conn_spec);

    let ctx = AllocationId("allocation-a".to_string());
    let cache = ChannelCache::new(pool, Insights::new());

    let channels: Vec<_> = (0..3).map(|n| channel(&ctx, n)).collect();
    cache.insert_channels(&ctx, &channels).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            cache
                .acquire_channel(&ctx, |snapshot| async move {
                    // Hold the lease for long enough that a genuinely concurrent second
                    // acquirer could only succeed by picking a different row.
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    let channel_id = snapshot.channel_id.clone();
                    Ok((snapshot, channel_id))
                })
                .await
        }));
    }

    let mut succeeded = Vec::new();
    let mut no_free = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(channel_id) => succeeded.push(channel_id),
            Err(e) => match e.downcast_ref::<GatewayError>() {
                Some(GatewayError::NoFreeChannels(_)) => no_free += 1,
                _ => panic!("unexpected error: {e:#}"),
            },
        }
    }

    assert_eq!(succeeded.len(), 3, "exactly min(N, M) acquires should succeed");
    assert_eq!(no_free, 2);

    let unique: std::collections::HashSet<_> = succeeded.iter().collect();
    assert_eq!(unique.len(), succeeded.len(), "no channel leased twice");
}
