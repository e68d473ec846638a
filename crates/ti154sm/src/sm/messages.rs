//! Wire format of Security Manager frames
//!
//! Every frame is `[kind u8][command u16 LE][payload]`. The code/nonce command
//! carries the authentication iteration in the low nibble of its id.

use super::constants::*;
use super::error::{SmError, SmResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// Outer message kind in the first byte of the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Opens a run (commissioning request or key refresh request)
    CommissionStart,
    /// Any other step of a run
    CommissionMsg,
}

impl MessageKind {
    pub fn to_u8(&self) -> u8 {
        match self {
            MessageKind::CommissionStart => SM_MSG_COMMISSION_START,
            MessageKind::CommissionMsg => SM_MSG_COMMISSION_MSG,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SM_MSG_COMMISSION_START => Some(MessageKind::CommissionStart),
            SM_MSG_COMMISSION_MSG => Some(MessageKind::CommissionMsg),
            _ => None,
        }
    }
}

/// Security Manager command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    ProcessRequest,
    ProcessResponse,
    MethodConfirm,
    PasskeyConfirm,
    PublicKey,
    SecurityVal,
    /// Code/nonce pair of the given iteration
    CodeNonce(u8),
    Success,
    Fail,
    KeyRefreshRequest,
}

impl CommandId {
    /// Convert to the on-air command id
    pub fn to_u16(&self) -> u16 {
        match self {
            CommandId::ProcessRequest => SM_CMD_PROCESS_REQUEST,
            CommandId::ProcessResponse => SM_CMD_PROCESS_RESPONSE,
            CommandId::MethodConfirm => SM_CMD_METHOD_CONFIRM,
            CommandId::PasskeyConfirm => SM_CMD_PASSKEY_CONFIRM,
            CommandId::PublicKey => SM_CMD_PUBLIC_KEY,
            CommandId::SecurityVal => SM_CMD_SECURITY_VAL,
            CommandId::CodeNonce(iteration) => {
                SM_CMD_CODE_NONCE | (u16::from(*iteration) & SM_CMD_ITERATION_MASK)
            }
            CommandId::Success => SM_CMD_SUCCESS,
            CommandId::Fail => SM_CMD_FAIL,
            CommandId::KeyRefreshRequest => SM_CMD_KEY_REFRESH_REQUEST,
        }
    }

    /// Decode an on-air command id. Only the code/nonce family may carry a
    /// non-zero low nibble.
    pub fn from_u16(value: u16) -> Option<Self> {
        let iteration = (value & SM_CMD_ITERATION_MASK) as u8;
        let command = match value & SM_CMD_FAMILY_MASK {
            SM_CMD_CODE_NONCE => return Some(CommandId::CodeNonce(iteration)),
            SM_CMD_PROCESS_REQUEST => CommandId::ProcessRequest,
            SM_CMD_PROCESS_RESPONSE => CommandId::ProcessResponse,
            SM_CMD_METHOD_CONFIRM => CommandId::MethodConfirm,
            SM_CMD_PASSKEY_CONFIRM => CommandId::PasskeyConfirm,
            SM_CMD_PUBLIC_KEY => CommandId::PublicKey,
            SM_CMD_SECURITY_VAL => CommandId::SecurityVal,
            SM_CMD_SUCCESS => CommandId::Success,
            SM_CMD_FAIL => CommandId::Fail,
            SM_CMD_KEY_REFRESH_REQUEST => CommandId::KeyRefreshRequest,
            _ => return None,
        };
        if iteration != 0 {
            return None;
        }
        Some(command)
    }

    /// Outer kind a frame carrying this command is sent with
    pub fn kind(&self) -> MessageKind {
        match self {
            CommandId::ProcessRequest | CommandId::KeyRefreshRequest => MessageKind::CommissionStart,
            _ => MessageKind::CommissionMsg,
        }
    }

    /// Failure notices bypass the awaited-message filter
    pub fn is_fail(&self) -> bool {
        matches!(self, CommandId::Fail)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandId::ProcessRequest => write!(f, "processRequest"),
            CommandId::ProcessResponse => write!(f, "processResponse"),
            CommandId::MethodConfirm => write!(f, "methodConfirm"),
            CommandId::PasskeyConfirm => write!(f, "passkeyConfirm"),
            CommandId::PublicKey => write!(f, "publicKey"),
            CommandId::SecurityVal => write!(f, "securityVal"),
            CommandId::CodeNonce(i) => write!(f, "codeNonce[{}]", i),
            CommandId::Success => write!(f, "success"),
            CommandId::Fail => write!(f, "fail"),
            CommandId::KeyRefreshRequest => write!(f, "keyRefreshRequest"),
        }
    }
}

/// A decoded Security Manager frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmMessage {
    pub kind: MessageKind,
    pub command: CommandId,
    pub payload: Vec<u8>,
}

impl SmMessage {
    /// Build a frame, picking the outer kind from the command
    pub fn new(command: CommandId, payload: Vec<u8>) -> Self {
        Self {
            kind: command.kind(),
            command,
            payload,
        }
    }

    /// Parse a frame from bytes
    pub fn parse(data: &[u8]) -> SmResult<Self> {
        if data.len() < SM_BASE_CMD_LENGTH {
            return Err(SmError::InvalidMessage(format!(
                "frame of {} bytes is shorter than the header",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let raw_kind = cursor
            .read_u8()
            .map_err(|e| SmError::InvalidMessage(e.to_string()))?;
        let raw_command = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| SmError::InvalidMessage(e.to_string()))?;

        let kind = MessageKind::from_u8(raw_kind)
            .ok_or_else(|| SmError::InvalidMessage(format!("unknown message kind {}", raw_kind)))?;
        let command = CommandId::from_u16(raw_command).ok_or(SmError::UnknownCommand(raw_command))?;

        Ok(Self {
            kind,
            command,
            payload: data[SM_BASE_CMD_LENGTH..].to_vec(),
        })
    }

    /// Serialize the frame to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SM_BASE_CMD_LENGTH + self.payload.len());
        // Writes into a Vec cannot fail
        let _ = data.write_u8(self.kind.to_u8());
        let _ = data.write_u16::<LittleEndian>(self.command.to_u16());
        data.extend_from_slice(&self.payload);
        data
    }

    /// First payload byte
    pub fn payload_u8(&self) -> SmResult<u8> {
        self.payload.first().copied().ok_or_else(|| {
            SmError::InvalidMessage(format!("{} payload is empty", self.command))
        })
    }

    /// Leading `N` payload bytes as an array
    pub fn payload_array<const N: usize>(&self) -> SmResult<[u8; N]> {
        if self.payload.len() < N {
            return Err(SmError::InvalidMessage(format!(
                "{} payload is {} bytes, expected {}",
                self.command,
                self.payload.len(),
                N
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.payload[..N]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids() {
        assert_eq!(CommandId::ProcessRequest.to_u16(), 0xCF10);
        assert_eq!(CommandId::KeyRefreshRequest.to_u16(), 0xCFA0);
        assert_eq!(CommandId::CodeNonce(3).to_u16(), 0xCF73);
        assert_eq!(CommandId::from_u16(0xCF74), Some(CommandId::CodeNonce(4)));
        assert_eq!(CommandId::from_u16(0xCF90), Some(CommandId::Fail));
        assert_eq!(CommandId::from_u16(0xCF91), None);
        assert_eq!(CommandId::from_u16(SM_CMD_NO_MSG), None);
    }

    #[test]
    fn test_kind_follows_command() {
        assert_eq!(CommandId::ProcessRequest.kind(), MessageKind::CommissionStart);
        assert_eq!(CommandId::KeyRefreshRequest.kind(), MessageKind::CommissionStart);
        assert_eq!(CommandId::PublicKey.kind(), MessageKind::CommissionMsg);
    }

    #[test]
    fn test_frame_layout() {
        let message = SmMessage::new(CommandId::ProcessResponse, vec![0x07]);
        let data = message.serialize();
        assert_eq!(data, vec![15, 0x20, 0xCF, 0x07]);
        assert_eq!(SmMessage::parse(&data).unwrap(), message);

        let nonce = SmMessage::parse(&[15, 0x72, 0xCF, 1, 2]).unwrap();
        assert_eq!(nonce.command, CommandId::CodeNonce(2));
        assert_eq!(nonce.payload, vec![1, 2]);
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(
            SmMessage::parse(&[15, 0x20]),
            Err(SmError::InvalidMessage(_))
        ));
        assert!(matches!(
            SmMessage::parse(&[99, 0x20, 0xCF]),
            Err(SmError::InvalidMessage(_))
        ));
        assert!(matches!(
            SmMessage::parse(&[15, 0x00, 0xAB]),
            Err(SmError::UnknownCommand(0xAB00))
        ));
    }

    #[test]
    fn test_payload_accessors() {
        let message = SmMessage::new(CommandId::SecurityVal, vec![9; 16]);
        assert_eq!(message.payload_array::<16>().unwrap(), [9; 16]);
        assert!(message.payload_array::<32>().is_err());
        assert_eq!(message.payload_u8().unwrap(), 9);
        assert!(SmMessage::new(CommandId::Success, vec![]).payload_u8().is_err());
    }
}
