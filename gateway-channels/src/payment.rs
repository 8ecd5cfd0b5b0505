use crate::attestation::AttestationApp;
use crate::attestation::QueryResponse;
use crate::cache::ChannelCache;
use crate::error::GatewayError;
use crate::types::AllocationId;
use crate::types::OutgoingMessage;
use crate::wallet::UpdateChannelParams;
use crate::wallet::Wallet;
use num_bigint::BigUint;
use std::sync::Arc;

/// A single micropayment request: one query response, for one allocation, for one amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub allocation_id: AllocationId,
    pub amount: BigUint,
    pub request_cid: String,
    pub subgraph_id: String,
}

/// The payment path: acquires a channel, advances it by one payment, and releases it. Never
/// holds a channel across a network round trip to the caller -- the outgoing payload is
/// handed back so the caller (or `MessageExchange`) can deliver it.
pub struct PaymentManager {
    cache: ChannelCache,
    wallet: Arc<dyn Wallet>,
    attestation: Arc<dyn AttestationApp>,
}

impl PaymentManager {
    pub fn new(cache: ChannelCache, wallet: Arc<dyn Wallet>, attestation: Arc<dyn AttestationApp>) -> Self {
        Self {
            cache,
            wallet,
            attestation,
        }
    }

    pub async fn create_payment(&self, payment: Payment) -> anyhow::Result<OutgoingMessage> {
        let wallet = self.wallet.clone();
        let attestation = self.attestation.clone();
        let amount = payment.amount.clone();

        self.cache
            .acquire_channel(&payment.allocation_id, move |snapshot| async move {
                if amount > snapshot.payer_bal {
                    return Err(GatewayError::Validation(format!(
                        "payment amount {amount} exceeds payer balance {}",
                        snapshot.payer_bal
                    ))
                    .into());
                }

                let update = attestation.apply_payment(&snapshot.outcome, &amount)?;

                let result = wallet
                    .update_channel(UpdateChannelParams {
                        channel_id: snapshot.channel_id.clone(),
                        allocations: snapshot.app_data.clone(),
                        app_data: update.app_data.clone(),
                    })
                    .await?;

                if result.outbox.len() != 1 {
                    return Err(GatewayError::ProtocolViolation(format!(
                        "expected exactly one outbox item from update_channel, got {}",
                        result.outbox.len()
                    ))
                    .into());
                }

                let outgoing = result
                    .outbox
                    .into_iter()
                    .next()
                    .expect("checked len == 1 above");

                Ok((result.channel_result, outgoing))
            })
            .await
    }

    pub async fn submit_receipt(&self, payload: &[u8]) -> anyhow::Result<QueryResponse> {
        let pushed = self.wallet.push_message(payload).await?;

        if pushed.channel_results.len() != 1 || !pushed.outbox.is_empty() {
            anyhow::bail!(GatewayError::ProtocolViolation(format!(
                "expected exactly one channel result and an empty outbox from a receipt, got {} results and {} outbox items",
                pushed.channel_results.len(),
                pushed.outbox.len()
            )));
        }

        let result = pushed
            .channel_results
            .into_iter()
            .next()
            .expect("checked len == 1 above");

        let app_data = result.app_data.clone();
        self.cache.submit_receipt(result).await?;

        Ok(self.attestation.decode_response(&app_data)?)
    }
}
