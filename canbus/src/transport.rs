use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{ArbitrationId, BusError, Frame};

pub type FrameFilter = Arc<dyn Fn(&ArbitrationId) -> bool + Send + Sync>;

/// Accept every frame on the bus.
pub fn match_all() -> FrameFilter {
    Arc::new(|_| true)
}

#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> Result<(), BusError>;

    /// Register an independent subscription. Every subscription receives
    /// every frame matching its filter; subscriptions never compete.
    fn subscribe(&self, filter: FrameFilter) -> BusSubscription;
}

pub struct BusSubscription {
    rx: broadcast::Receiver<Frame>,
    filter: FrameFilter,
}

impl BusSubscription {
    pub fn new(rx: broadcast::Receiver<Frame>, filter: FrameFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching frame, in bus delivery order. Returns `None` once the
    /// transport is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if (self.filter)(&frame.id) {
                        return Some(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("bus subscription lagged, {} frames dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-memory bus with fan-out delivery. Used by the tests to script
/// firmware nodes and by simulations that run without hardware.
pub struct LoopbackBus {
    tx: broadcast::Sender<Frame>,
}

impl LoopbackBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl BusTransport for LoopbackBus {
    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        // A frame sent while nobody listens is simply lost, as on a real bus.
        let _ = self.tx.send(frame);
        Ok(())
    }

    fn subscribe(&self, filter: FrameFilter) -> BusSubscription {
        BusSubscription::new(self.tx.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    fn frame(message_id: u16, target: NodeId) -> Frame {
        Frame {
            id: ArbitrationId::new(message_id, NodeId::Host, target),
            payload: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn every_matching_subscription_sees_the_frame() {
        let bus = LoopbackBus::new(16);
        let mut first = bus.subscribe(match_all());
        let mut second = bus.subscribe(match_all());

        bus.send(frame(0x010, NodeId::GantryX)).await.unwrap();

        assert_eq!(first.recv().await.unwrap().id.message_id, 0x010);
        assert_eq!(second.recv().await.unwrap().id.message_id, 0x010);
    }

    #[tokio::test]
    async fn filters_are_applied_per_subscription() {
        let bus = LoopbackBus::new(16);
        let mut gantry_only =
            bus.subscribe(Arc::new(|id: &ArbitrationId| id.target == NodeId::GantryX));

        bus.send(frame(0x010, NodeId::Head)).await.unwrap();
        bus.send(frame(0x011, NodeId::GantryX)).await.unwrap();

        let received = gantry_only.recv().await.unwrap();
        assert_eq!(received.id.message_id, 0x011);
    }
}
