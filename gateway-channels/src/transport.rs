use async_trait::async_trait;

/// A transport-level failure talking to a peer. The core never surfaces this across its
/// public API; `MessageExchange` absorbs it, logs it, and treats it as "no response".
#[derive(Debug, thiserror::Error)]
#[error("transport failure: {0}")]
pub struct TransportFailure(pub String);

/// The HTTP transport to the indexer is out of scope here; this is the narrow interface the
/// core consumes from it. No retry semantics are assumed.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, TransportFailure>;
}
