use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::EpochMetrics;

/// Epoch-end notification for live progress consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// Run the epoch belongs to.
    pub run_id: Uuid,
    /// Model being trained.
    pub model_id: String,
    /// Finished epochs (1-based).
    pub epoch: usize,
    /// Effective epoch count.
    pub epochs: usize,
    /// 0..=100.
    pub progress_percent: u8,
    /// Epoch metrics.
    pub metrics: EpochMetrics,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

/// Broadcast fan-out of progress events; slow receivers lag instead of blocking training.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressHub {
    /// Hub buffering `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver seeing events sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Sends to current receivers and returns how many got it.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(epoch: usize) -> ProgressEvent {
        ProgressEvent {
            run_id: Uuid::new_v4(),
            model_id: "m-1".into(),
            epoch,
            epochs: 2,
            progress_percent: 50,
            metrics: EpochMetrics::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn publishing_without_receivers_is_ignored() {
        let hub = ProgressHub::new(4);
        assert_eq!(hub.publish(event(1)), 0);
    }

    #[test]
    fn receivers_see_events_in_order() {
        let hub = ProgressHub::new(4);
        let mut rx = hub.subscribe();
        hub.publish(event(1));
        hub.publish(event(2));
        assert_eq!(rx.try_recv().unwrap().epoch, 1);
        assert_eq!(rx.try_recv().unwrap().epoch, 2);
        assert!(rx.try_recv().is_err());
    }
}
