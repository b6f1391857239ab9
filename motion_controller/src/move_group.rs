use std::collections::{HashMap, HashSet};
use std::time::Duration;

use canbus::{BusTransport, NodeId};
use firmware::{
    LinearMoveRequest, Message, StopCondition, TipAction, TipActionRequest, mm_to_um, um_to_mm,
};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::messenger::Messenger;
use crate::models::MoveStatus;

/// Per-node command within one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepCommand {
    Linear {
        duration: Duration,
        velocity_mm_per_s: f32,
        acceleration_mm_per_s2: f32,
        stop_condition: StopCondition,
    },
    TipAction {
        action: TipAction,
        duration: Duration,
        velocity_mm_per_s: f32,
    },
}

impl StepCommand {
    fn to_message(self, group_id: u8, seq_id: u8) -> Message {
        match self {
            StepCommand::Linear {
                duration,
                velocity_mm_per_s,
                acceleration_mm_per_s2,
                stop_condition,
            } => Message::LinearMoveRequest(LinearMoveRequest {
                group_id,
                seq_id,
                duration_ms: duration.as_millis() as u32,
                velocity_um_per_s: mm_to_um(velocity_mm_per_s),
                acceleration_um_per_s2: mm_to_um(acceleration_mm_per_s2),
                stop_condition,
            }),
            StepCommand::TipAction {
                action,
                duration,
                velocity_mm_per_s,
            } => Message::TipActionRequest(TipActionRequest {
                group_id,
                seq_id,
                action,
                duration_ms: duration.as_millis() as u32,
                velocity_um_per_s: mm_to_um(velocity_mm_per_s),
            }),
        }
    }
}

/// All nodes in a step are commanded together and must all complete before
/// the runner advances.
pub type MoveStep = HashMap<NodeId, StepCommand>;

/// Steps execute strictly in listed order.
pub type MoveGroup = Vec<MoveStep>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerState {
    Idle,
    Running { group: usize, step: usize },
    Completed,
    Failed,
}

/// Sequences move groups across nodes. Created fresh per invocation and
/// consumed by `run`; terminal states are final.
pub struct MoveGroupRunner {
    groups: Vec<MoveGroup>,
    state: RunnerState,
}

impl MoveGroupRunner {
    pub fn new(groups: Vec<MoveGroup>) -> Self {
        Self {
            groups,
            state: RunnerState::Idle,
        }
    }

    pub async fn run<B: BusTransport>(
        self,
        messenger: &Messenger<B>,
        timeout_per_step: Duration,
    ) -> Result<HashMap<NodeId, MoveStatus>, ControlError> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(messenger, timeout_per_step, cancel_rx)
            .await
    }

    /// Like `run`, but aborts when `cancel` flips to true. On cancellation
    /// the error reports the last fully completed group and the nodes whose
    /// commands were sent but not yet acknowledged.
    pub async fn run_with_cancel<B: BusTransport>(
        mut self,
        messenger: &Messenger<B>,
        timeout_per_step: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<NodeId, MoveStatus>, ControlError> {
        let mut statuses: HashMap<NodeId, MoveStatus> = HashMap::new();
        let mut last_completed_group = None;

        for (group_index, group) in self.groups.iter().enumerate() {
            for (step_index, step) in group.iter().enumerate() {
                if step.is_empty() {
                    continue;
                }
                self.state = RunnerState::Running {
                    group: group_index,
                    step: step_index,
                };
                debug!("runner state {:?}", self.state);

                let step_statuses = match execute_step(
                    messenger,
                    group_index as u8,
                    step_index as u8,
                    step,
                    timeout_per_step,
                    &mut cancel,
                )
                .await
                {
                    Ok(step_statuses) => step_statuses,
                    Err(ControlError::Cancelled { outstanding, .. }) => {
                        self.state = RunnerState::Failed;
                        info!(
                            "move run cancelled in group {} step {}",
                            group_index, step_index
                        );
                        return Err(ControlError::Cancelled {
                            last_completed_group,
                            outstanding,
                        });
                    }
                    Err(e) => {
                        self.state = RunnerState::Failed;
                        return Err(e);
                    }
                };

                let failed = step_statuses.values().any(|status| !status.ack.is_success());
                statuses.extend(step_statuses.iter().map(|(node, status)| (*node, *status)));

                if failed {
                    self.state = RunnerState::Failed;
                    warn!(
                        "move group {} step {} reported failing acks",
                        group_index, step_index
                    );
                    let acks = step_statuses
                        .iter()
                        .map(|(node, status)| (*node, status.ack))
                        .collect();
                    return Err(ControlError::Motion {
                        group: group_index,
                        acks,
                    });
                }
            }
            last_completed_group = Some(group_index);
        }

        self.state = RunnerState::Completed;
        debug!("runner state {:?}", self.state);
        Ok(statuses)
    }
}

async fn execute_step<B: BusTransport>(
    messenger: &Messenger<B>,
    group_id: u8,
    seq_id: u8,
    step: &MoveStep,
    timeout_per_step: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<HashMap<NodeId, MoveStatus>, ControlError> {
    let expected: HashSet<NodeId> = step.keys().copied().collect();

    let own = messenger.own_node();
    let wanted = expected.clone();
    let mut listener = messenger.listen(Box::new(move |id, message| {
        if id.target != own || !wanted.contains(&id.originating) {
            return false;
        }
        match message {
            Message::MoveCompleted(done) => done.group_id == group_id && done.seq_id == seq_id,
            Message::TipActionResponse(done) => {
                done.group_id == group_id && done.seq_id == seq_id
            }
            _ => false,
        }
    }));

    // every command is dispatched before any completion wait begins
    for (node, command) in step {
        messenger
            .send(*node, &command.to_message(group_id, seq_id))
            .await?;
    }

    let deadline = Instant::now() + timeout_per_step;
    let mut statuses: HashMap<NodeId, MoveStatus> = HashMap::new();
    let mut raw: HashMap<NodeId, Message> = HashMap::new();

    while statuses.len() < expected.len() {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return Err(ControlError::Cancelled {
                    last_completed_group: None,
                    outstanding: remaining(&expected, &statuses),
                });
            }
            received = timeout_at(deadline, listener.recv()) => match received {
                Ok(Some((message, id))) => {
                    if statuses.contains_key(&id.originating) {
                        // retransmission, the first ack already counted
                        continue;
                    }
                    if let Some(status) = completion_status(&message) {
                        raw.insert(id.originating, message);
                        statuses.insert(id.originating, status);
                    }
                }
                Ok(None) => return Err(ControlError::Transport(canbus::BusError::Closed)),
                Err(_) => {
                    return Err(ControlError::CommandTimedOut {
                        missing: remaining(&expected, &statuses),
                        collected: raw,
                    });
                }
            }
        }
    }

    Ok(statuses)
}

fn remaining(expected: &HashSet<NodeId>, statuses: &HashMap<NodeId, MoveStatus>) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = expected
        .iter()
        .filter(|node| !statuses.contains_key(node))
        .copied()
        .collect();
    nodes.sort();
    nodes
}

fn completion_status(message: &Message) -> Option<MoveStatus> {
    match message {
        Message::MoveCompleted(done) => Some(MoveStatus {
            position: um_to_mm(done.current_position_um),
            encoder_position: um_to_mm(done.encoder_position_um),
            ack: done.ack,
        }),
        // tip motors carry no separate encoder, mirror the motor reading
        Message::TipActionResponse(done) => Some(MoveStatus {
            position: um_to_mm(done.current_position_um),
            encoder_position: um_to_mm(done.current_position_um),
            ack: done.ack,
        }),
        _ => None,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // sender gone, cancellation can no longer happen
        std::future::pending::<()>().await;
    }
}
