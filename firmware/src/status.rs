use bitflags::bitflags;

use crate::codec::{DecodeError, um_to_mm};

bitflags!(
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PositionFlags: u8 {
        const STEPPER_POSITION_OK = 0b0000_0001;
        const ENCODER_POSITION_OK = 0b0000_0010;
    }
);

impl PositionFlags {
    pub fn from_wire(value: u8) -> Result<Self, DecodeError> {
        Self::from_bits(value).ok_or(DecodeError::InvalidField {
            field: "position_flags",
            value: value as u32,
        })
    }
}

bitflags!(
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StopCondition: u8 {
        const LIMIT_SWITCH = 0b0000_0001;
        const ENCODER_POSITION = 0b0000_0010;
        const STALL = 0b0000_0100;
    }
);

impl StopCondition {
    pub fn from_wire(value: u8) -> Result<Self, DecodeError> {
        Self::from_bits(value).ok_or(DecodeError::InvalidField {
            field: "stop_condition",
            value: value as u32,
        })
    }
}

/// Terminal status a node reports for a commanded move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MoveAck {
    CompleteWithoutCondition = 1,
    StoppedByCondition = 2,
    Timeout = 3,
    PositionError = 4,
}

impl MoveAck {
    pub fn is_success(self) -> bool {
        matches!(self, MoveAck::CompleteWithoutCondition)
    }
}

impl TryFrom<u8> for MoveAck {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            1 => Ok(MoveAck::CompleteWithoutCondition),
            2 => Ok(MoveAck::StoppedByCondition),
            3 => Ok(MoveAck::Timeout),
            4 => Ok(MoveAck::PositionError),
            other => Err(DecodeError::InvalidField {
                field: "ack",
                value: other as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    InvalidInput = 1,
    HardwareFault = 2,
    Timeout = 3,
    EStop = 4,
}

impl TryFrom<u16> for ErrorCode {
    type Error = DecodeError;

    fn try_from(raw: u16) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(ErrorCode::Ok),
            1 => Ok(ErrorCode::InvalidInput),
            2 => Ok(ErrorCode::HardwareFault),
            3 => Ok(ErrorCode::Timeout),
            4 => Ok(ErrorCode::EStop),
            other => Err(DecodeError::InvalidField {
                field: "error_code",
                value: other as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TipAction {
    Pickup = 1,
    Drop = 2,
}

impl TryFrom<u8> for TipAction {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            1 => Ok(TipAction::Pickup),
            2 => Ok(TipAction::Drop),
            other => Err(DecodeError::InvalidField {
                field: "tip_action",
                value: other as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ToolType {
    None = 0,
    Pipette = 1,
    Gripper = 2,
}

impl TryFrom<u8> for ToolType {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(ToolType::None),
            1 => Ok(ToolType::Pipette),
            2 => Ok(ToolType::Gripper),
            other => Err(DecodeError::InvalidField {
                field: "tool_type",
                value: other as u32,
            }),
        }
    }
}

/// Decoded position snapshot in engineering units. Replaced wholesale on
/// every update, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorPositionStatus {
    pub motor_position: f32,
    pub encoder_position: f32,
    pub motor_ok: bool,
    pub encoder_ok: bool,
}

impl MotorPositionStatus {
    pub fn from_wire(position_um: i32, encoder_um: i32, flags: PositionFlags) -> Self {
        Self {
            motor_position: um_to_mm(position_um),
            encoder_position: um_to_mm(encoder_um),
            motor_ok: flags.contains(PositionFlags::STEPPER_POSITION_OK),
            encoder_ok: flags.contains(PositionFlags::ENCODER_POSITION_OK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_map_to_status_fields() {
        let status = MotorPositionStatus::from_wire(12_500, -3_000, PositionFlags::STEPPER_POSITION_OK);
        assert_eq!(status.motor_position, 12.5);
        assert_eq!(status.encoder_position, -3.0);
        assert!(status.motor_ok);
        assert!(!status.encoder_ok);
    }

    #[test]
    fn out_of_range_enum_values_are_typed_errors() {
        assert!(MoveAck::try_from(0).is_err());
        assert!(MoveAck::try_from(5).is_err());
        assert!(ErrorCode::try_from(99).is_err());
        assert!(ToolType::try_from(7).is_err());
        assert!(PositionFlags::from_wire(0b1000_0000).is_err());
    }
}
