use canbus::{ArbitrationId, Frame, NodeId};

use crate::codec::{
    DecodeError, PayloadReader, PayloadWriter, current_to_fixed, fixed_to_current,
};
use crate::status::{
    ErrorCode, MotorPositionStatus, MoveAck, PositionFlags, StopCondition, TipAction, ToolType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    MotorPositionRequest = 0x010,
    MotorPositionResponse = 0x011,
    LinearMoveRequest = 0x020,
    MoveCompleted = 0x021,
    TipActionRequest = 0x030,
    TipActionResponse = 0x031,
    WriteMotorCurrentRequest = 0x040,
    Acknowledgement = 0x041,
    UpdateMotorPositionEstimationRequest = 0x050,
    UpdateMotorPositionEstimationResponse = 0x051,
    AttachedToolsRequest = 0x060,
    ToolsDetectedNotification = 0x061,
}

impl TryFrom<u16> for MessageId {
    type Error = DecodeError;

    fn try_from(raw: u16) -> Result<Self, DecodeError> {
        match raw {
            0x010 => Ok(MessageId::MotorPositionRequest),
            0x011 => Ok(MessageId::MotorPositionResponse),
            0x020 => Ok(MessageId::LinearMoveRequest),
            0x021 => Ok(MessageId::MoveCompleted),
            0x030 => Ok(MessageId::TipActionRequest),
            0x031 => Ok(MessageId::TipActionResponse),
            0x040 => Ok(MessageId::WriteMotorCurrentRequest),
            0x041 => Ok(MessageId::Acknowledgement),
            0x050 => Ok(MessageId::UpdateMotorPositionEstimationRequest),
            0x051 => Ok(MessageId::UpdateMotorPositionEstimationResponse),
            0x060 => Ok(MessageId::AttachedToolsRequest),
            0x061 => Ok(MessageId::ToolsDetectedNotification),
            other => Err(DecodeError::UnknownMessageId(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorPositionResponse {
    pub current_position_um: i32,
    pub encoder_position_um: i32,
    pub flags: PositionFlags,
}

impl MotorPositionResponse {
    const BODY: usize = 9;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_i32(self.current_position_um);
        writer.put_i32(self.encoder_position_um);
        writer.put_u8(self.flags.bits());
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            current_position_um: reader.get_i32(),
            encoder_position_um: reader.get_i32(),
            flags: PositionFlags::from_wire(reader.get_u8())?,
        })
    }

    pub fn status(&self) -> MotorPositionStatus {
        MotorPositionStatus::from_wire(self.current_position_um, self.encoder_position_um, self.flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMoveRequest {
    pub group_id: u8,
    pub seq_id: u8,
    pub duration_ms: u32,
    pub velocity_um_per_s: i32,
    pub acceleration_um_per_s2: i32,
    pub stop_condition: StopCondition,
}

impl LinearMoveRequest {
    const BODY: usize = 15;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u8(self.group_id);
        writer.put_u8(self.seq_id);
        writer.put_u32(self.duration_ms);
        writer.put_i32(self.velocity_um_per_s);
        writer.put_i32(self.acceleration_um_per_s2);
        writer.put_u8(self.stop_condition.bits());
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            group_id: reader.get_u8(),
            seq_id: reader.get_u8(),
            duration_ms: reader.get_u32(),
            velocity_um_per_s: reader.get_i32(),
            acceleration_um_per_s2: reader.get_i32(),
            stop_condition: StopCondition::from_wire(reader.get_u8())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCompleted {
    pub group_id: u8,
    pub seq_id: u8,
    pub current_position_um: i32,
    pub encoder_position_um: i32,
    pub flags: PositionFlags,
    pub ack: MoveAck,
}

impl MoveCompleted {
    const BODY: usize = 12;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u8(self.group_id);
        writer.put_u8(self.seq_id);
        writer.put_i32(self.current_position_um);
        writer.put_i32(self.encoder_position_um);
        writer.put_u8(self.flags.bits());
        writer.put_u8(self.ack as u8);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            group_id: reader.get_u8(),
            seq_id: reader.get_u8(),
            current_position_um: reader.get_i32(),
            encoder_position_um: reader.get_i32(),
            flags: PositionFlags::from_wire(reader.get_u8())?,
            ack: MoveAck::try_from(reader.get_u8())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipActionRequest {
    pub group_id: u8,
    pub seq_id: u8,
    pub action: TipAction,
    pub duration_ms: u32,
    pub velocity_um_per_s: i32,
}

impl TipActionRequest {
    const BODY: usize = 11;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u8(self.group_id);
        writer.put_u8(self.seq_id);
        writer.put_u8(self.action as u8);
        writer.put_u32(self.duration_ms);
        writer.put_i32(self.velocity_um_per_s);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            group_id: reader.get_u8(),
            seq_id: reader.get_u8(),
            action: TipAction::try_from(reader.get_u8())?,
            duration_ms: reader.get_u32(),
            velocity_um_per_s: reader.get_i32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipActionResponse {
    pub group_id: u8,
    pub seq_id: u8,
    pub action: TipAction,
    pub current_position_um: i32,
    pub ack: MoveAck,
}

impl TipActionResponse {
    const BODY: usize = 8;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u8(self.group_id);
        writer.put_u8(self.seq_id);
        writer.put_u8(self.action as u8);
        writer.put_i32(self.current_position_um);
        writer.put_u8(self.ack as u8);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            group_id: reader.get_u8(),
            seq_id: reader.get_u8(),
            action: TipAction::try_from(reader.get_u8())?,
            current_position_um: reader.get_i32(),
            ack: MoveAck::try_from(reader.get_u8())?,
        })
    }
}

/// Current targets in Q16.16 amps. A zero field leaves that current
/// unchanged on the node, which is how single-current writes are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMotorCurrentRequest {
    pub hold_current: u32,
    pub run_current: u32,
}

impl WriteMotorCurrentRequest {
    const BODY: usize = 8;

    pub fn from_amps(hold_amps: f32, run_amps: f32) -> Self {
        Self {
            hold_current: current_to_fixed(hold_amps),
            run_current: current_to_fixed(run_amps),
        }
    }

    pub fn hold_amps(&self) -> f32 {
        fixed_to_current(self.hold_current)
    }

    pub fn run_amps(&self) -> f32 {
        fixed_to_current(self.run_current)
    }

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u32(self.hold_current);
        writer.put_u32(self.run_current);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            hold_current: reader.get_u32(),
            run_current: reader.get_u32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub error_code: ErrorCode,
}

impl Acknowledgement {
    const BODY: usize = 2;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u16(self.error_code as u16);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            error_code: ErrorCode::try_from(reader.get_u16())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolsDetectedNotification {
    pub left: ToolType,
    pub right: ToolType,
}

impl ToolsDetectedNotification {
    const BODY: usize = 2;

    fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::with_capacity(Self::BODY);
        writer.put_u8(self.left as u8);
        writer.put_u8(self.right as u8);
        writer.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::checked(payload, Self::BODY)?;
        Ok(Self {
            left: ToolType::try_from(reader.get_u8())?,
            right: ToolType::try_from(reader.get_u8())?,
        })
    }
}

/// One variant per message id. Decoding yields a variant and handlers match
/// exhaustively; unknown ids never get past [`MessageId::try_from`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    MotorPositionRequest,
    MotorPositionResponse(MotorPositionResponse),
    LinearMoveRequest(LinearMoveRequest),
    MoveCompleted(MoveCompleted),
    TipActionRequest(TipActionRequest),
    TipActionResponse(TipActionResponse),
    WriteMotorCurrentRequest(WriteMotorCurrentRequest),
    Acknowledgement(Acknowledgement),
    UpdateMotorPositionEstimationRequest,
    UpdateMotorPositionEstimationResponse(MotorPositionResponse),
    AttachedToolsRequest,
    ToolsDetectedNotification(ToolsDetectedNotification),
}

fn decode_empty(payload: &[u8], message: Message) -> Result<Message, DecodeError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(DecodeError::LengthMismatch {
            expected: 0,
            received: payload.len(),
        })
    }
}

impl Message {
    pub fn message_id(&self) -> MessageId {
        match self {
            Message::MotorPositionRequest => MessageId::MotorPositionRequest,
            Message::MotorPositionResponse(_) => MessageId::MotorPositionResponse,
            Message::LinearMoveRequest(_) => MessageId::LinearMoveRequest,
            Message::MoveCompleted(_) => MessageId::MoveCompleted,
            Message::TipActionRequest(_) => MessageId::TipActionRequest,
            Message::TipActionResponse(_) => MessageId::TipActionResponse,
            Message::WriteMotorCurrentRequest(_) => MessageId::WriteMotorCurrentRequest,
            Message::Acknowledgement(_) => MessageId::Acknowledgement,
            Message::UpdateMotorPositionEstimationRequest => {
                MessageId::UpdateMotorPositionEstimationRequest
            }
            Message::UpdateMotorPositionEstimationResponse(_) => {
                MessageId::UpdateMotorPositionEstimationResponse
            }
            Message::AttachedToolsRequest => MessageId::AttachedToolsRequest,
            Message::ToolsDetectedNotification(_) => MessageId::ToolsDetectedNotification,
        }
    }

    /// Payload bytes, trailing checksum included. Empty-payload requests
    /// encode to zero bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::MotorPositionRequest
            | Message::UpdateMotorPositionEstimationRequest
            | Message::AttachedToolsRequest => Vec::new(),
            Message::MotorPositionResponse(inner) => inner.encode(),
            Message::LinearMoveRequest(inner) => inner.encode(),
            Message::MoveCompleted(inner) => inner.encode(),
            Message::TipActionRequest(inner) => inner.encode(),
            Message::TipActionResponse(inner) => inner.encode(),
            Message::WriteMotorCurrentRequest(inner) => inner.encode(),
            Message::Acknowledgement(inner) => inner.encode(),
            Message::UpdateMotorPositionEstimationResponse(inner) => inner.encode(),
            Message::ToolsDetectedNotification(inner) => inner.encode(),
        }
    }

    pub fn decode(id: MessageId, payload: &[u8]) -> Result<Self, DecodeError> {
        match id {
            MessageId::MotorPositionRequest => {
                decode_empty(payload, Message::MotorPositionRequest)
            }
            MessageId::MotorPositionResponse => {
                MotorPositionResponse::decode(payload).map(Message::MotorPositionResponse)
            }
            MessageId::LinearMoveRequest => {
                LinearMoveRequest::decode(payload).map(Message::LinearMoveRequest)
            }
            MessageId::MoveCompleted => MoveCompleted::decode(payload).map(Message::MoveCompleted),
            MessageId::TipActionRequest => {
                TipActionRequest::decode(payload).map(Message::TipActionRequest)
            }
            MessageId::TipActionResponse => {
                TipActionResponse::decode(payload).map(Message::TipActionResponse)
            }
            MessageId::WriteMotorCurrentRequest => {
                WriteMotorCurrentRequest::decode(payload).map(Message::WriteMotorCurrentRequest)
            }
            MessageId::Acknowledgement => {
                Acknowledgement::decode(payload).map(Message::Acknowledgement)
            }
            MessageId::UpdateMotorPositionEstimationRequest => {
                decode_empty(payload, Message::UpdateMotorPositionEstimationRequest)
            }
            MessageId::UpdateMotorPositionEstimationResponse => MotorPositionResponse::decode(payload)
                .map(Message::UpdateMotorPositionEstimationResponse),
            MessageId::AttachedToolsRequest => {
                decode_empty(payload, Message::AttachedToolsRequest)
            }
            MessageId::ToolsDetectedNotification => {
                ToolsDetectedNotification::decode(payload).map(Message::ToolsDetectedNotification)
            }
        }
    }

    pub fn to_frame(&self, originating: NodeId, target: NodeId) -> Frame {
        Frame {
            id: ArbitrationId::new(self.message_id() as u16, originating, target),
            payload: self.encode(),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<(Self, ArbitrationId), DecodeError> {
        let id = MessageId::try_from(frame.id.message_id)?;
        let message = Self::decode(id, &frame.payload)?;
        Ok((message, frame.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc16;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::MotorPositionRequest,
            Message::MotorPositionResponse(MotorPositionResponse {
                current_position_um: 123_456,
                encoder_position_um: -98_765,
                flags: PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK,
            }),
            Message::LinearMoveRequest(LinearMoveRequest {
                group_id: 2,
                seq_id: 7,
                duration_ms: 1_500,
                velocity_um_per_s: -40_000,
                acceleration_um_per_s2: 2_000,
                stop_condition: StopCondition::LIMIT_SWITCH | StopCondition::STALL,
            }),
            Message::MoveCompleted(MoveCompleted {
                group_id: 2,
                seq_id: 7,
                current_position_um: i32::MAX,
                encoder_position_um: i32::MIN,
                flags: PositionFlags::STEPPER_POSITION_OK,
                ack: MoveAck::StoppedByCondition,
            }),
            Message::TipActionRequest(TipActionRequest {
                group_id: 0,
                seq_id: 0,
                action: TipAction::Pickup,
                duration_ms: 400,
                velocity_um_per_s: 5_500,
            }),
            Message::TipActionResponse(TipActionResponse {
                group_id: 0,
                seq_id: 0,
                action: TipAction::Drop,
                current_position_um: -1,
                ack: MoveAck::CompleteWithoutCondition,
            }),
            Message::WriteMotorCurrentRequest(WriteMotorCurrentRequest {
                hold_current: 0,
                run_current: u32::MAX,
            }),
            Message::Acknowledgement(Acknowledgement {
                error_code: ErrorCode::HardwareFault,
            }),
            Message::UpdateMotorPositionEstimationRequest,
            Message::UpdateMotorPositionEstimationResponse(MotorPositionResponse {
                current_position_um: 0,
                encoder_position_um: 0,
                flags: PositionFlags::empty(),
            }),
            Message::AttachedToolsRequest,
            Message::ToolsDetectedNotification(ToolsDetectedNotification {
                left: ToolType::Pipette,
                right: ToolType::None,
            }),
        ]
    }

    #[test]
    fn every_message_round_trips_through_a_frame() {
        for message in sample_messages() {
            let frame = message.to_frame(NodeId::Host, NodeId::GantryY);
            let (decoded, id) = Message::from_frame(&frame).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(id.originating, NodeId::Host);
            assert_eq!(id.target, NodeId::GantryY);
            assert_eq!(id.message_id, message.message_id() as u16);
        }
    }

    #[test]
    fn flipping_any_payload_byte_fails_the_checksum() {
        let message = Message::MoveCompleted(MoveCompleted {
            group_id: 1,
            seq_id: 3,
            current_position_um: 42_000,
            encoder_position_um: 41_900,
            flags: PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK,
            ack: MoveAck::CompleteWithoutCondition,
        });
        let payload = message.encode();

        for index in 0..payload.len() {
            let mut corrupted = payload.clone();
            corrupted[index] ^= 0x01;
            let result = Message::decode(MessageId::MoveCompleted, &corrupted);
            assert!(
                matches!(result, Err(DecodeError::ChecksumMismatch { .. })),
                "byte {} flip was not detected: {:?}",
                index,
                result
            );
        }
    }

    #[test]
    fn truncated_payload_is_a_length_error() {
        let payload = Message::Acknowledgement(Acknowledgement {
            error_code: ErrorCode::Ok,
        })
        .encode();

        let result = Message::decode(MessageId::Acknowledgement, &payload[..payload.len() - 1]);
        assert!(matches!(result, Err(DecodeError::LengthMismatch { .. })));
    }

    #[test]
    fn unknown_message_id_is_a_typed_error() {
        assert!(matches!(
            MessageId::try_from(0x7FF),
            Err(DecodeError::UnknownMessageId(0x7FF))
        ));
    }

    #[test]
    fn empty_payload_messages_are_symmetric() {
        let frame = Message::MotorPositionRequest.to_frame(NodeId::Host, NodeId::Broadcast);
        assert!(frame.payload.is_empty());
        let (decoded, _) = Message::from_frame(&frame).unwrap();
        assert_eq!(decoded, Message::MotorPositionRequest);

        let trailing = Message::decode(MessageId::MotorPositionRequest, &[0x00]);
        assert!(matches!(
            trailing,
            Err(DecodeError::LengthMismatch {
                expected: 0,
                received: 1
            })
        ));
    }

    #[test]
    fn current_write_carries_q16_16_fields() {
        let message =
            Message::WriteMotorCurrentRequest(WriteMotorCurrentRequest::from_amps(0.1, 0.5));
        let payload = message.encode();

        assert_eq!(&payload[0..4], &6554u32.to_be_bytes());
        assert_eq!(&payload[4..8], &32768u32.to_be_bytes());

        let decoded = Message::decode(MessageId::WriteMotorCurrentRequest, &payload).unwrap();
        let Message::WriteMotorCurrentRequest(request) = decoded else {
            panic!("wrong variant");
        };
        assert!((request.hold_amps() - 0.1).abs() <= 1.0 / 65536.0);
        assert!((request.run_amps() - 0.5).abs() <= 1.0 / 65536.0);
    }

    #[test]
    fn invalid_enum_fields_are_rejected() {
        let good = Message::Acknowledgement(Acknowledgement {
            error_code: ErrorCode::Ok,
        })
        .encode();

        // rewrite the error code with an out-of-range value and fix the crc
        let mut bad = vec![0x00, 0x63];
        let crc = crc16(&bad);
        bad.push((crc & 0xFF) as u8);
        bad.push((crc >> 8) as u8);
        assert_eq!(bad.len(), good.len());

        assert!(matches!(
            Message::decode(MessageId::Acknowledgement, &bad),
            Err(DecodeError::InvalidField {
                field: "error_code",
                ..
            })
        ));
    }
}
