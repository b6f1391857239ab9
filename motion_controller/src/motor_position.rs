use std::collections::{HashMap, HashSet};
use std::time::Duration;

use canbus::{BusTransport, NodeId};
use firmware::{Message, MessageId, MotorPositionStatus};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::messenger::Messenger;

/// Broadcast a position request and collect replies from `nodes`. If the
/// timeout elapses first the partial map is returned and the missing nodes
/// are only warned about.
pub async fn get_motor_position<B: BusTransport>(
    messenger: &Messenger<B>,
    nodes: &HashSet<NodeId>,
    timeout: Duration,
) -> Result<HashMap<NodeId, MotorPositionStatus>, ControlError> {
    let responses = match messenger
        .send_and_collect(
            NodeId::Broadcast,
            &Message::MotorPositionRequest,
            nodes,
            MessageId::MotorPositionResponse,
            timeout,
        )
        .await
    {
        Ok(responses) => responses,
        Err(ControlError::CommandTimedOut { missing, collected }) => {
            warn!("no position report from nodes {:?}", missing);
            collected
        }
        Err(e) => return Err(e),
    };

    Ok(decode_positions(responses))
}

/// Ask each node to re-derive its motor position from the encoder. The
/// update resets node-internal state, so nodes are processed strictly one
/// round trip at a time. A node whose stepper flag comes back not-OK fails
/// the whole operation; a silent node times it out naming every node still
/// waiting for its update.
pub async fn update_motor_position_estimation<B: BusTransport>(
    messenger: &Messenger<B>,
    nodes: &[NodeId],
    timeout: Duration,
) -> Result<HashMap<NodeId, MotorPositionStatus>, ControlError> {
    let mut updated = HashMap::new();

    for (index, node) in nodes.iter().enumerate() {
        let expected = HashSet::from([*node]);
        let responses = messenger
            .send_and_collect(
                *node,
                &Message::UpdateMotorPositionEstimationRequest,
                &expected,
                MessageId::UpdateMotorPositionEstimationResponse,
                timeout,
            )
            .await
            .map_err(|e| match e {
                ControlError::CommandTimedOut { mut missing, collected } => {
                    // the silent node plus everything not yet updated
                    missing.extend(nodes[index + 1..].iter().copied());
                    missing.sort();
                    missing.dedup();
                    ControlError::CommandTimedOut { missing, collected }
                }
                other => other,
            })?;

        let status = match responses.get(node) {
            Some(Message::UpdateMotorPositionEstimationResponse(response)) => response.status(),
            _ => {
                return Err(ControlError::RoboticsControl {
                    node: *node,
                    reason: "estimate update produced no usable response".to_string(),
                })
            }
        };

        if !status.motor_ok {
            return Err(ControlError::RoboticsControl {
                node: *node,
                reason: "stepper position flag not ok after estimate update".to_string(),
            });
        }

        debug!("node {:?} position estimate updated: {:?}", node, status);
        updated.insert(*node, status);
    }

    Ok(updated)
}

fn decode_positions(
    responses: HashMap<NodeId, Message>,
) -> HashMap<NodeId, MotorPositionStatus> {
    responses
        .into_iter()
        .filter_map(|(node, message)| match message {
            Message::MotorPositionResponse(response) => Some((node, response.status())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{loopback, respond_with, spawn_responder};
    use firmware::{MotorPositionResponse, PositionFlags};
    use std::sync::{Arc, Mutex};

    fn position_response(position_um: i32, flags: PositionFlags) -> Message {
        Message::MotorPositionResponse(MotorPositionResponse {
            current_position_um: position_um,
            encoder_position_um: position_um,
            flags,
        })
    }

    fn estimate_response(position_um: i32, flags: PositionFlags) -> Message {
        Message::UpdateMotorPositionEstimationResponse(MotorPositionResponse {
            current_position_um: position_um,
            encoder_position_um: position_um,
            flags,
        })
    }

    #[tokio::test]
    async fn partial_position_results_are_returned_without_error() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        let ok = PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK;
        spawn_responder(
            bus.clone(),
            NodeId::GantryX,
            respond_with(position_response(10_000, ok)),
        );
        spawn_responder(
            bus.clone(),
            NodeId::GantryY,
            respond_with(position_response(-2_500, ok)),
        );
        // Head stays silent

        let nodes = HashSet::from([NodeId::GantryX, NodeId::GantryY, NodeId::Head]);
        let positions = get_motor_position(&messenger, &nodes, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(positions.len(), 2);
        assert_eq!(positions.get(&NodeId::GantryX).unwrap().motor_position, 10.0);
        assert_eq!(positions.get(&NodeId::GantryY).unwrap().motor_position, -2.5);
    }

    #[tokio::test]
    async fn estimate_updates_run_one_node_at_a_time() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        let ok = PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK;
        let order = Arc::new(Mutex::new(Vec::new()));

        for node in [NodeId::GantryX, NodeId::GantryY] {
            let order = order.clone();
            spawn_responder(bus.clone(), node, move |message| match message {
                Message::UpdateMotorPositionEstimationRequest => {
                    order.lock().unwrap().push(node);
                    Some(estimate_response(5_000, ok))
                }
                _ => None,
            });
        }

        let updated = update_motor_position_estimation(
            &messenger,
            &[NodeId::GantryX, NodeId::GantryY],
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert_eq!(updated.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec![NodeId::GantryX, NodeId::GantryY]);
    }

    #[tokio::test]
    async fn a_bad_stepper_flag_names_the_offending_node() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        spawn_responder(
            bus.clone(),
            NodeId::GantryX,
            respond_with(estimate_response(5_000, PositionFlags::ENCODER_POSITION_OK)),
        );

        let error = update_motor_position_estimation(
            &messenger,
            &[NodeId::GantryX],
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        match error {
            ControlError::RoboticsControl { node, .. } => assert_eq!(node, NodeId::GantryX),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn estimate_timeout_names_the_silent_node_and_the_rest() {
        let bus = loopback();
        let messenger = Messenger::new(bus.clone(), NodeId::Host);
        let ok = PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK;
        spawn_responder(
            bus.clone(),
            NodeId::GantryX,
            respond_with(estimate_response(5_000, ok)),
        );
        // GantryY silent, Head never reached

        let error = update_motor_position_estimation(
            &messenger,
            &[NodeId::GantryX, NodeId::GantryY, NodeId::Head],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        match error {
            ControlError::CommandTimedOut { missing, .. } => {
                assert_eq!(missing, vec![NodeId::GantryY, NodeId::Head]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
