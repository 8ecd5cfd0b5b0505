use num_bigint::BigUint;

/// The decoded result of a completed query: the indexer either returned a response we can
/// certify payment for, or it declined (bad proof, wrong deployment, etc). The core only
/// forwards the opaque bytes; the attestation-app collaborator defines what is inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    Accepted(Vec<u8>),
    Declined(Vec<u8>),
}

/// A payment channel's `appData`/`outcome` pair, reinterpreted after one payment has been
/// applied: the payer bucket decremented by the payment amount, the receiver bucket credited.
pub struct AttestationUpdate {
    pub outcome: Vec<u8>,
    pub app_data: Vec<u8>,
}

/// The attestation application's state-transition rules: out of scope to implement in full
/// (it is an external collaborator per the design), but `PaymentManager` needs a narrow seam
/// to apply one payment and to decode one query response. Modelled as a trait so tests can
/// substitute a fake that tracks balances in memory.
pub trait AttestationApp: Send + Sync {
    /// Applies one payment of `amount` on top of `current_outcome`, returning the new
    /// `(outcome, app_data)` pair to hand to `wallet.update_channel`.
    fn apply_payment(
        &self,
        current_outcome: &[u8],
        amount: &BigUint,
    ) -> anyhow::Result<AttestationUpdate>;

    /// Decodes a peer's response payload into an accept/decline verdict.
    fn decode_response(&self, payload: &[u8]) -> anyhow::Result<QueryResponse>;
}
