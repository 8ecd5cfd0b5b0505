use crate::error::GatewayError;
use crate::transport::MessageSender;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use crate::types::OutgoingMessage;
use std::collections::HashMap;

/// Drives a single peer-to-peer handshake to quiescence: send, feed the response into
/// `push_message`, repeat while the wallet keeps handing back an outbox. Accumulates the
/// latest channel result seen per channel id, matching the teacher's message fan-out of
/// collecting the latest state per recipient rather than replaying history.
pub async fn run_exchange(
    sender: &dyn MessageSender,
    wallet: &dyn crate::wallet::Wallet,
    initial: OutgoingMessage,
) -> Result<HashMap<ChannelId, ChannelSnapshot>, GatewayError> {
    let mut accumulated: HashMap<ChannelId, ChannelSnapshot> = HashMap::new();
    let mut outgoing = initial;

    loop {
        let response = match sender.send(&outgoing.recipient, &outgoing.payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(recipient = %outgoing.recipient, error = %e, "transport failure, ending exchange");
                return Ok(accumulated);
            }
        };

        let Some(payload) = response else {
            return Ok(accumulated);
        };

        let result = wallet
            .push_message(&payload)
            .await
            .map_err(|e| GatewayError::ProtocolViolation(e.to_string()))?;

        for channel_result in result.channel_results {
            accumulated.insert(channel_result.channel_id.clone(), channel_result);
        }

        if result.outbox.is_empty() {
            return Ok(accumulated);
        }

        if result.outbox.len() != 1 {
            return Err(GatewayError::ProtocolViolation(format!(
                "expected at most one outbox item per exchange hop, got {}",
                result.outbox.len()
            )));
        }

        outgoing = result
            .outbox
            .into_iter()
            .next()
            .expect("checked len == 1 above");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFailure;
    use crate::types::AllocationId;
    use crate::types::ObjectiveId;
    use crate::wallet::CreateChannelsResult;
    use crate::wallet::CreateLedgerResult;
    use crate::wallet::FundingStrategy;
    use crate::wallet::PushMessageResult;
    use crate::wallet::StartState;
    use crate::wallet::SyncChannelResult;
    use crate::wallet::UpdateChannelParams;
    use crate::wallet::UpdateChannelResult;
    use crate::wallet::Wallet;
    use async_trait::async_trait;
    use num_bigint::BigUint;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use time::OffsetDateTime;
    use tokio::sync::broadcast;

    fn snapshot(channel_id: &str, turn_num: u64) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: ChannelId(channel_id.to_string()),
            context_id: AllocationId("ctx".to_string()),
            turn_num,
            payer_bal: BigUint::from(0u32),
            receiver_bal: BigUint::from(0u32),
            app_data: vec![],
            outcome: vec![],
            retired: false,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    struct RespondOnceSender {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for RespondOnceSender {
        async fn send(
            &self,
            _recipient: &str,
            _payload: &[u8],
        ) -> Result<Option<Vec<u8>>, TransportFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if call == 0 { Some(vec![1, 2, 3]) } else { None })
        }
    }

    struct OneHopWallet;

    #[async_trait]
    impl Wallet for OneHopWallet {
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
            _params: UpdateChannelParams,
        ) -> anyhow::Result<UpdateChannelResult> {
            unimplemented!("not exercised by this test")
        }

        async fn push_message(&self, _payload: &[u8]) -> anyhow::Result<PushMessageResult> {
            Ok(PushMessageResult {
                channel_results: vec![snapshot("channel-1", 3)],
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
        ) -> anyhow::Result<Vec<crate::types::LedgerSnapshot>> {
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

    #[tokio::test]
    async fn exchange_ends_when_outbox_is_empty() {
        let sender = RespondOnceSender {
            calls: AtomicUsize::new(0),
        };
        let wallet = OneHopWallet;
        let initial = OutgoingMessage {
            recipient: "peer".to_string(),
            payload: vec![0],
        };

        let results = run_exchange(&sender, &wallet, initial).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(
            results.get(&ChannelId("channel-1".to_string())).unwrap().turn_num,
            3
        );
    }

    struct AlwaysFailsSender;

    #[async_trait]
    impl MessageSender for AlwaysFailsSender {
        async fn send(
            &self,
            _recipient: &str,
            _payload: &[u8],
        ) -> Result<Option<Vec<u8>>, TransportFailure> {
            Err(TransportFailure("peer unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn transport_failure_is_absorbed_not_raised() {
        let sender = AlwaysFailsSender;
        let wallet = OneHopWallet;
        let initial = OutgoingMessage {
            recipient: "peer".to_string(),
            payload: vec![0],
        };

        let results = run_exchange(&sender, &wallet, initial).await.unwrap();
        assert!(results.is_empty());
    }
}
