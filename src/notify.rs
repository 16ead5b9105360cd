use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{CourtId, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Per-court broadcast of committed store events.
pub struct NotifyHub {
    channels: DashMap<CourtId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a court's events. Creates the channel if needed.
    pub fn subscribe(&self, court: CourtId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(court)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, court: CourtId, event: &Event) {
        if let Some(sender) = self.channels.get(&court) {
            let _ = sender.send(event.clone());
        }
    }
}
