mod support;

use async_trait::async_trait;
use gateway_channels::attestation::AttestationApp;
use gateway_channels::attestation::AttestationUpdate;
use gateway_channels::attestation::QueryResponse;
use gateway_channels::cache::ChannelCache;
use gateway_channels::insights::Insights;
use gateway_channels::payment::Payment;
use gateway_channels::payment::PaymentManager;
use gateway_channels::types::AllocationId;
use gateway_channels::types::ChannelId;
use gateway_channels::types::ChannelSnapshot;
use gateway_channels::types::LedgerSnapshot;
use gateway_channels::types::ObjectiveId;
use gateway_channels::types::OutgoingMessage;
use gateway_channels::wallet::CreateChannelsResult;
use gateway_channels::wallet::CreateLedgerResult;
use gateway_channels::wallet::FundingStrategy;
use gateway_channels::wallet::PushMessageResult;
use gateway_channels::wallet::StartState;
use gateway_channels::wallet::SyncChannelResult;
use gateway_channels::wallet::UpdateChannelParams;
use gateway_channels::wallet::UpdateChannelResult;
use gateway_channels::wallet::Wallet;
use num_bigint::BigUint;
use std::sync::Arc;
use testcontainers::clients::Cli;
use time::OffsetDateTime;
use tokio::sync::broadcast;

fn channel(ctx: &AllocationId, payer_bal: u32, receiver_bal: u32) -> ChannelSnapshot {
    ChannelSnapshot {
        channel_id: ChannelId("channel-1".to_string()),
        context_id: ctx.clone(),
        turn_num: 3,
        payer_bal: BigUint::from(payer_bal),
        receiver_bal: BigUint::from(receiver_bal),
        app_data: vec![1],
        outcome: vec![2],
        retired: false,
        updated_at: OffsetDateTime::now_utc(),
    }
}

/// Settles the whole round trip in one call -- moves one unit from payer to receiver and
/// lands back on an odd `turn_num`, as if the peer's countersignature had already arrived,
/// so the channel is immediately free for another payment.
struct OneStepWallet;

#[async_trait]
impl Wallet for OneStepWallet {
    async fn create_channels(
        &self,
        _start_state: &StartState,
        _n: usize,
    ) -> anyhow::Result<CreateChannelsResult> {
        unimplemented!("not exercised by this test")
    }

    async fn create_ledger_channel(
        &self,
        _start_state: &StartState,
        _strategy: FundingStrategy,
    ) -> anyhow::Result<CreateLedgerResult> {
        unimplemented!("not exercised by this test")
    }

    async fn update_channel(
        &self,
        params: UpdateChannelParams,
    ) -> anyhow::Result<UpdateChannelResult> {
        let channel_result = ChannelSnapshot {
            channel_id: params.channel_id,
            context_id: AllocationId("allocation-a".to_string()),
            turn_num: 5,
            payer_bal: BigUint::from(900u32),
            receiver_bal: BigUint::from(100u32),
            app_data: params.app_data,
            outcome: vec![9],
            retired: false,
            updated_at: OffsetDateTime::now_utc(),
        };
        Ok(UpdateChannelResult {
            channel_result,
            outbox: vec![OutgoingMessage {
                recipient: "peer".to_string(),
                payload: vec![7],
            }],
        })
    }

    async fn push_message(&self, _payload: &[u8]) -> anyhow::Result<PushMessageResult> {
        Ok(PushMessageResult {
            channel_results: vec![ChannelSnapshot {
                channel_id: ChannelId("channel-1".to_string()),
                context_id: AllocationId("allocation-a".to_string()),
                turn_num: 4,
                payer_bal: BigUint::from(900u32),
                receiver_bal: BigUint::from(100u32),
                app_data: vec![5],
                outcome: vec![6],
                retired: false,
                updated_at: OffsetDateTime::now_utc(),
            }],
            outbox: vec![],
        })
    }

    async fn sync_channel(&self, _channel_id: &ChannelId) -> anyhow::Result<SyncChannelResult> {
        unimplemented!("not exercised by this test")
    }

    async fn close_channels(&self, _ids: &[ChannelId]) -> anyhow::Result<Vec<OutgoingMessage>> {
        unimplemented!("not exercised by this test")
    }

    async fn get_channels(&self) -> anyhow::Result<Vec<ChannelSnapshot>> {
        unimplemented!("not exercised by this test")
    }

    async fn get_ledger_channels(
        &self,
        _asset_holder_address: &str,
        _participants: &(String, String),
    ) -> anyhow::Result<Vec<LedgerSnapshot>> {
        unimplemented!("not exercised by this test")
    }

    fn subscribe_objective_successes(&self) -> broadcast::Receiver<ObjectiveId> {
        broadcast::channel(1).1
    }

    async fn register_app_bytecode(&self, _address: &str, _bytecode: &[u8]) -> anyhow::Result<()> {
        unimplemented!("not exercised by this test")
    }

    fn signing_address(&self) -> String {
        "0xfake".to_string()
    }
}

struct FakeAttestation;

impl AttestationApp for FakeAttestation {
    fn apply_payment(
        &self,
        _current_outcome: &[u8],
        _amount: &BigUint,
    ) -> anyhow::Result<AttestationUpdate> {
        Ok(AttestationUpdate {
            outcome: vec![9],
            app_data: vec![8],
        })
    }

    fn decode_response(&self, payload: &[u8]) -> anyhow::Result<QueryResponse> {
        if payload == [5] {
            Ok(QueryResponse::Accepted(payload.to_vec()))
        } else {
            Ok(QueryResponse::Declined(payload.to_vec()))
        }
    }
}

#[tokio::test]
async fn create_payment_rejects_amount_above_payer_balance() {
    let docker = Cli::default();
    let (_container, conn_spec) = support::start_postgres(&docker).unwrap();
    let pool = support::build_pool(&conn_spec);

    let ctx = AllocationId("allocation-a".to_string());
    let cache = ChannelCache::new(pool, Insights::new());
    cache
        .insert_channels(&ctx, &[channel(&ctx, 100, 0)])
        .await
        .unwrap();

    let manager = PaymentManager::new(cache, Arc::new(OneStepWallet), Arc::new(FakeAttestation));

    let result = manager
        .create_payment(Payment {
            allocation_id: ctx,
            amount: BigUint::from(500u32),
            request_cid: "cid-1".to_string(),
            subgraph_id: "subgraph-1".to_string(),
        })
        .await;

    assert!(result.is_err(), "payment above balance must be rejected");
}

#[tokio::test]
async fn create_payment_releases_the_channel_with_an_outgoing_message() {
    let docker = Cli::default();
    let (_container, conn_spec) = support::start_postgres(&docker).unwrap();
    let pool = support::build_pool(&conn_spec);

    let ctx = AllocationId("allocation-a".to_string());
    let cache = ChannelCache::new(pool, Insights::new());
    cache
        .insert_channels(&ctx, &[channel(&ctx, 1_000, 0)])
        .await
        .unwrap();

    let manager = PaymentManager::new(
        cache.clone(),
        Arc::new(OneStepWallet),
        Arc::new(FakeAttestation),
    );

    let outgoing = manager
        .create_payment(Payment {
            allocation_id: ctx.clone(),
            amount: BigUint::from(100u32),
            request_cid: "cid-1".to_string(),
            subgraph_id: "subgraph-1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(outgoing.recipient, "peer");

    // The channel must be free again for a second lease after the first was released.
    let second = manager
        .create_payment(Payment {
            allocation_id: ctx,
            amount: BigUint::from(100u32),
            request_cid: "cid-2".to_string(),
            subgraph_id: "subgraph-1".to_string(),
        })
        .await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn submit_receipt_decodes_the_attestation_response() {
    let docker = Cli::default();
    let (_container, conn_spec) = support::start_postgres(&docker).unwrap();
    let pool = support::build_pool(&conn_spec);

    let ctx = AllocationId("allocation-a".to_string());
    let cache = ChannelCache::new(pool, Insights::new());
    cache
        .insert_channels(&ctx, &[channel(&ctx, 1_000, 0)])
        .await
        .unwrap();

    let manager = PaymentManager::new(cache, Arc::new(OneStepWallet), Arc::new(FakeAttestation));

    let response = manager.submit_receipt(&[0]).await.unwrap();
    assert_eq!(response, QueryResponse::Accepted(vec![5]));
}
