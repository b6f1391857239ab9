use std::collections::HashSet;
use std::time::Duration;

use canbus::{BusTransport, NodeId};
use firmware::{ErrorCode, Message, WriteMotorCurrentRequest};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::messenger::Messenger;
use crate::models::{CompleteCurrentSettings, PartialCurrentSettings};

/// Write hold and run currents to every node in `settings`. A node that
/// rejects the write or stays silent is logged and skipped; one misbehaving
/// node must not block configuring the rest. Only transport failures abort.
pub async fn set_currents<B: BusTransport>(
    messenger: &Messenger<B>,
    settings: &CompleteCurrentSettings,
    timeout: Duration,
) -> Result<(), ControlError> {
    for (node, (hold, run)) in settings {
        let request = WriteMotorCurrentRequest::from_amps(*hold, *run);
        write_current(messenger, *node, request, timeout).await?;
    }
    Ok(())
}

pub async fn set_run_current<B: BusTransport>(
    messenger: &Messenger<B>,
    settings: &PartialCurrentSettings,
    timeout: Duration,
) -> Result<(), ControlError> {
    for (node, run) in settings {
        let request = WriteMotorCurrentRequest::from_amps(0.0, *run);
        write_current(messenger, *node, request, timeout).await?;
    }
    Ok(())
}

pub async fn set_hold_current<B: BusTransport>(
    messenger: &Messenger<B>,
    settings: &PartialCurrentSettings,
    timeout: Duration,
) -> Result<(), ControlError> {
    for (node, hold) in settings {
        let request = WriteMotorCurrentRequest::from_amps(*hold, 0.0);
        write_current(messenger, *node, request, timeout).await?;
    }
    Ok(())
}

async fn write_current<B: BusTransport>(
    messenger: &Messenger<B>,
    node: NodeId,
    request: WriteMotorCurrentRequest,
    timeout: Duration,
) -> Result<(), ControlError> {
    let message = Message::WriteMotorCurrentRequest(request);
    let expected = HashSet::from([node]);

    match messenger.ensure_send(node, &message, &expected, timeout).await {
        Ok(ErrorCode::Ok) => debug!("node {:?} accepted current write", node),
        Ok(code) => warn!("node {:?} rejected current write: {:?}", node, code),
        Err(ControlError::CommandTimedOut { .. }) => {
            warn!("node {:?} did not acknowledge current write", node);
        }
        Err(e) => return Err(e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{loopback, spawn_responder};
    use firmware::Acknowledgement;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn current_node(
        bus: Arc<canbus::LoopbackBus>,
        node: NodeId,
        code: ErrorCode,
        seen: Arc<Mutex<Vec<WriteMotorCurrentRequest>>>,
    ) {
        spawn_responder(bus, node, move |message| match message {
            Message::WriteMotorCurrentRequest(request) => {
                seen.lock().unwrap().push(*request);
                Some(Message::Acknowledgement(Acknowledgement { error_code: code }))
            }
            _ => None,
        });
    }

    #[tokio::test]
    async fn a_rejecting_node_does_not_stop_the_others() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        let left_seen = Arc::new(Mutex::new(Vec::new()));
        let right_seen = Arc::new(Mutex::new(Vec::new()));
        current_node(
            bus.clone(),
            NodeId::PipetteLeft,
            ErrorCode::HardwareFault,
            left_seen.clone(),
        );
        current_node(
            bus.clone(),
            NodeId::PipetteRight,
            ErrorCode::Ok,
            right_seen.clone(),
        );

        let settings: CompleteCurrentSettings = HashMap::from([
            (NodeId::PipetteLeft, (0.1, 0.5)),
            (NodeId::PipetteRight, (0.2, 0.8)),
        ]);
        set_currents(&messenger, &settings, Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(left_seen.lock().unwrap().len(), 1);
        assert_eq!(right_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn silent_nodes_are_logged_and_skipped() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        let seen = Arc::new(Mutex::new(Vec::new()));
        // GantryX never acks
        spawn_responder(bus.clone(), NodeId::GantryX, |_| None);
        current_node(bus.clone(), NodeId::GantryY, ErrorCode::Ok, seen.clone());

        let settings: PartialCurrentSettings =
            HashMap::from([(NodeId::GantryX, 0.4), (NodeId::GantryY, 0.4)]);
        set_run_current(&messenger, &settings, Duration::from_millis(50))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        // a run-only write leaves the hold current untouched
        assert_eq!(seen[0].hold_current, 0);
        assert_eq!(seen[0].run_current, firmware::current_to_fixed(0.4));
    }
}
