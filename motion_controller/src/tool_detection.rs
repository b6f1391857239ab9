use std::sync::Arc;
use std::time::Duration;

use canbus::{BusTransport, NodeId};
use firmware::{Message, MessageId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ControlError;
use crate::messenger::Messenger;
use crate::models::{ToolMap, tool_map};

const EVENT_QUEUE: usize = 8;

/// Watches the head node for attached-tool notifications and republishes a
/// change event only when the mapping actually differs from the last known
/// one. Repeated identical notifications are no-ops.
pub struct ToolDetector<B: BusTransport> {
    messenger: Arc<Messenger<B>>,
    events: mpsc::Sender<ToolMap>,
}

impl<B: BusTransport> ToolDetector<B> {
    pub fn new(messenger: Arc<Messenger<B>>) -> (Self, mpsc::Receiver<ToolMap>) {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);
        (Self { messenger, events }, receiver)
    }

    /// Poll the head until the first notification arrives, with a bounded
    /// number of attempts spaced by `ready_wait`, then consume notifications
    /// until the event receiver is dropped. Exhausting the attempts raises
    /// `ToolDetectionFailure`.
    pub async fn run(self, retry_count: u32, ready_wait: Duration) -> Result<(), ControlError> {
        let own = self.messenger.own_node();
        let mut listener = self.messenger.listen(Box::new(move |id, message| {
            message.message_id() == MessageId::ToolsDetectedNotification
                && (id.target == own || id.target == NodeId::Broadcast)
        }));

        let mut attempt = 0;
        let mut known = loop {
            if attempt >= retry_count {
                return Err(ControlError::ToolDetectionFailure { attempts: attempt });
            }
            attempt += 1;

            self.messenger
                .send(NodeId::Head, &Message::AttachedToolsRequest)
                .await?;

            match tokio::time::timeout(ready_wait, listener.recv()).await {
                Ok(Some((Message::ToolsDetectedNotification(notification), _))) => {
                    break tool_map(&notification);
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(ControlError::Transport(canbus::BusError::Closed)),
                Err(_) => {
                    debug!("no tool notification within ready wait, attempt {}", attempt);
                }
            }
        };

        info!("attached tools: {:?}", known);
        if self.events.send(known.clone()).await.is_err() {
            return Ok(());
        }

        while let Some((message, _)) = listener.recv().await {
            if let Message::ToolsDetectedNotification(notification) = message {
                let mapping = tool_map(&notification);
                if mapping == known {
                    continue;
                }
                info!("attached tools changed: {:?}", mapping);
                known = mapping.clone();
                if self.events.send(mapping).await.is_err() {
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Carrier;
    use crate::testing::{loopback, spawn_responder};
    use firmware::{ToolType, ToolsDetectedNotification};
    use std::sync::Mutex;

    fn notification(left: ToolType, right: ToolType) -> Message {
        Message::ToolsDetectedNotification(ToolsDetectedNotification { left, right })
    }

    #[tokio::test]
    async fn identical_notifications_publish_a_single_change_event() {
        let bus = loopback();
        let messenger = Arc::new(Messenger::new(bus.clone(), NodeId::Host));
        spawn_responder(bus.clone(), NodeId::Head, |message| match message {
            Message::AttachedToolsRequest => {
                Some(notification(ToolType::Pipette, ToolType::None))
            }
            _ => None,
        });

        let (detector, mut events) = ToolDetector::new(messenger.clone());
        tokio::spawn(detector.run(3, Duration::from_millis(200)));

        let first = events.recv().await.unwrap();
        assert_eq!(first.get(&Carrier::Left), Some(&ToolType::Pipette));
        assert_eq!(first.get(&Carrier::Right), Some(&ToolType::None));

        // three identical notifications in a row change nothing
        for _ in 0..3 {
            bus.send(
                notification(ToolType::Pipette, ToolType::None)
                    .to_frame(NodeId::Head, NodeId::Host),
            )
            .await
            .unwrap();
        }
        // a different one publishes a second event
        bus.send(
            notification(ToolType::Pipette, ToolType::Gripper)
                .to_frame(NodeId::Head, NodeId::Host),
        )
        .await
        .unwrap();

        let second = events.recv().await.unwrap();
        assert_eq!(second.get(&Carrier::Right), Some(&ToolType::Gripper));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_retries_raise_tool_detection_failure() {
        let bus = loopback();
        let messenger = Arc::new(Messenger::new(bus.clone(), NodeId::Host));
        let requests = Arc::new(Mutex::new(0u32));
        {
            let requests = requests.clone();
            spawn_responder(bus.clone(), NodeId::Head, move |message| {
                if matches!(message, Message::AttachedToolsRequest) {
                    *requests.lock().unwrap() += 1;
                }
                None
            });
        }

        let (detector, _events) = ToolDetector::new(messenger.clone());
        let error = detector.run(3, Duration::from_millis(20)).await.unwrap_err();

        match error {
            ControlError::ToolDetectionFailure { attempts } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(*requests.lock().unwrap(), 3);
    }
}
