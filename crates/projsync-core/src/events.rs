use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::index::ReconcileSummary;
use crate::sync::{BackupRun, RunTrigger};

pub const DEFAULT_MAX_SUBSCRIBERS: usize = 16;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    BackupStarted { trigger: RunTrigger },
    BackupCompleted { run: BackupRun },
    /// A scheduled tick found a run already active.
    BackupSkipped { trigger: RunTrigger },
    BackupError { message: String },
    IndexUpdated { root: String, summary: ReconcileSummary },
    IndexCleared { removed: usize },
}

/// Delivers engine events to a bounded set of subscribers, each over its own
/// bounded channel. A subscriber whose queue is full misses the event; one
/// whose receiver was dropped is unregistered.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
    max_subscribers: usize,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS, DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(max_subscribers: usize, queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            max_subscribers,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Result<Receiver<EngineEvent>, Error> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| Error::Other(format!("Failed to lock subscribers: {}", e)))?;
        if subscribers.len() >= self.max_subscribers {
            return Err(Error::Other(format!(
                "subscriber limit of {} reached",
                self.max_subscribers
            )));
        }
        let (tx, rx) = bounded(self.queue_capacity);
        subscribers.push(tx);
        debug!("Event subscriber registered ({} total)", subscribers.len());
        Ok(rx)
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event queue full, dropping event for one subscriber");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_event() {
        let bus = EventBus::default();
        let a = bus.subscribe().unwrap();
        let b = bus.subscribe().unwrap();
        bus.publish(EngineEvent::IndexCleared { removed: 3 });
        assert!(matches!(a.try_recv(), Ok(EngineEvent::IndexCleared { removed: 3 })));
        assert!(matches!(b.try_recv(), Ok(EngineEvent::IndexCleared { removed: 3 })));
    }

    #[test]
    fn test_subscriber_limit() {
        let bus = EventBus::new(1, 4);
        let _first = bus.subscribe().unwrap();
        assert!(bus.subscribe().is_err());
    }

    #[test]
    fn test_dropped_receiver_frees_slot() {
        let bus = EventBus::new(1, 4);
        let first = bus.subscribe().unwrap();
        drop(first);
        bus.publish(EngineEvent::BackupError {
            message: "x".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.subscribe().is_ok());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let bus = EventBus::new(2, 1);
        let rx = bus.subscribe().unwrap();
        bus.publish(EngineEvent::IndexCleared { removed: 1 });
        bus.publish(EngineEvent::IndexCleared { removed: 2 });
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::IndexCleared { removed: 1 })));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }
}
