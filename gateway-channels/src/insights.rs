use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::types::RetireReport;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// A lifecycle snapshot posted onto the insights bus: just enough to let a subscriber track
/// what happened without re-querying the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInsight {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub turn_num: u64,
    pub first_outcome: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ChannelsCreated(Vec<ChannelInsight>),
    ChannelsReady(Vec<ChannelInsight>),
    ChannelsSynced(Vec<ChannelInsight>),
    ChannelsRetired {
        context_id: AllocationId,
        report: RetireReport,
    },
    ChannelsClosed(Vec<ChannelInsight>),
}

const INSIGHTS_BUFFER_SIZE: usize = 1024;

/// A typed, multi-consumer, non-blocking broadcast of channel lifecycle events. Modelled on
/// the notification fan-out in the teacher's message module, generalised from a directed
/// per-user channel to a topic every subscriber can tap into. Slow subscribers drop lagged
/// events (logged as a warning) rather than stall producers.
#[derive(Clone)]
pub struct Insights {
    sender: broadcast::Sender<Event>,
}

impl Default for Insights {
    fn default() -> Self {
        Self::new()
    }
}

impl Insights {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(INSIGHTS_BUFFER_SIZE);
        Self { sender }
    }

    /// Post is non-blocking. A topic with no subscribers silently drops the event -- that is
    /// the expected steady state when no one is watching the bus.
    pub(crate) fn post(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// The raw, unfiltered event stream.
    pub fn subscribe(&self) -> impl Stream<Item = Result<Event, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.sender.subscribe())
    }

    fn filtered<T: Clone + Send + 'static>(
        &self,
        project: impl Fn(Event) -> Option<T> + Send + 'static,
    ) -> impl Stream<Item = T> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |event| {
            let mapped = match event {
                Ok(event) => project(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "insights subscriber lagged behind");
                    None
                }
            };
            futures::future::ready(mapped)
        })
    }

    pub fn channels_created(&self) -> impl Stream<Item = Vec<ChannelInsight>> {
        self.filtered(|e| match e {
            Event::ChannelsCreated(v) => Some(v),
            _ => None,
        })
    }

    pub fn channels_ready(&self) -> impl Stream<Item = Vec<ChannelInsight>> {
        self.filtered(|e| match e {
            Event::ChannelsReady(v) => Some(v),
            _ => None,
        })
    }

    pub fn channels_synced(&self) -> impl Stream<Item = Vec<ChannelInsight>> {
        self.filtered(|e| match e {
            Event::ChannelsSynced(v) => Some(v),
            _ => None,
        })
    }

    pub fn channels_retired(&self) -> impl Stream<Item = (AllocationId, RetireReport)> {
        self.filtered(|e| match e {
            Event::ChannelsRetired { context_id, report } => Some((context_id, report)),
            _ => None,
        })
    }

    pub fn channels_closed(&self) -> impl Stream<Item = Vec<ChannelInsight>> {
        self.filtered(|e| match e {
            Event::ChannelsClosed(v) => Some(v),
            _ => None,
        })
    }
}

pub(crate) fn insight(
    channel_id: ChannelId,
    context_id: AllocationId,
    turn_num: u64,
    first_outcome: Vec<u8>,
) -> ChannelInsight {
    ChannelInsight {
        channel_id,
        context_id,
        turn_num,
        first_outcome,
    }
}
