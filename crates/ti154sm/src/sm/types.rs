//! Type definitions for the commissioning Security Manager
use super::constants::*;
use super::error::{SmError, SmResult};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

/// IEEE 802.15.4 extended address, stored least significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExtAddr {
    pub bytes: [u8; SM_EXT_ADDR_LEN],
}

impl ExtAddr {
    pub fn new(bytes: [u8; SM_EXT_ADDR_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= SM_EXT_ADDR_LEN {
            let mut bytes = [0u8; SM_EXT_ADDR_LEN];
            bytes.copy_from_slice(&slice[..SM_EXT_ADDR_LEN]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The 56 bits that enter f2/f3
    pub fn truncated(&self) -> [u8; SM_ADDRESS_LEN] {
        let mut out = [0u8; SM_ADDRESS_LEN];
        out.copy_from_slice(&self.bytes[..SM_ADDRESS_LEN]);
        out
    }
}

impl fmt::Display for ExtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().rev().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// MAC address in either of its two forms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Short(u16),
    Extended(ExtAddr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Short(addr) => write!(f, "0x{:04x}", addr),
            Address::Extended(addr) => write!(f, "{}", addr),
        }
    }
}

/// Identity of the peer being commissioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// PAN identifier
    pub pan_id: u16,
    /// Short address
    pub short_addr: u16,
    /// Extended address
    pub ext_addr: ExtAddr,
}

impl DeviceDescriptor {
    pub fn new(pan_id: u16, short_addr: u16, ext_addr: ExtAddr) -> Self {
        Self {
            pan_id,
            short_addr,
            ext_addr,
        }
    }

    /// Whether a frame source address belongs to this device
    pub fn matches(&self, source: &Address) -> bool {
        match source {
            Address::Short(addr) => *addr == self.short_addr,
            Address::Extended(addr) => *addr == self.ext_addr,
        }
    }

    /// Parse the on-air form carried by a commissioning request
    pub fn parse(data: &[u8]) -> SmResult<Self> {
        if data.len() < SM_DEVICE_DESCRIPTOR_LEN {
            return Err(SmError::InvalidMessage("Device descriptor too short".into()));
        }

        let mut cursor = Cursor::new(data);
        let pan_id = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| SmError::InvalidMessage(e.to_string()))?;
        let short_addr = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| SmError::InvalidMessage(e.to_string()))?;
        let mut bytes = [0u8; SM_EXT_ADDR_LEN];
        cursor
            .read_exact(&mut bytes)
            .map_err(|e| SmError::InvalidMessage(e.to_string()))?;

        Ok(Self::new(pan_id, short_addr, ExtAddr::new(bytes)))
    }

    /// Serialize to the on-air form
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SM_DEVICE_DESCRIPTOR_LEN);
        // Writes into a Vec cannot fail
        let _ = data.write_u16::<LittleEndian>(self.pan_id);
        let _ = data.write_u16::<LittleEndian>(self.short_addr);
        data.extend_from_slice(&self.ext_addr.bytes);
        data
    }
}

/// MAC security parameters applied to outgoing SM frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityDescriptor {
    /// Key source (key-id-mode-3 lookup data)
    pub key_source: [u8; SM_KEY_SOURCE_LEN],
    /// Security level
    pub security_level: u8,
    /// Key identifier mode
    pub key_id_mode: u8,
    /// Key index
    pub key_index: u8,
}

bitflags! {
    /// Authentication methods a party supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthMethods: u8 {
        const PASSKEY = SM_AUTH_METHOD_PASSKEY;
        const DEFAULT_CODE = SM_AUTH_METHOD_DEFAULT_CODE;
        const JUST_ALLOWED = SM_AUTH_METHOD_JUST_ALLOWED;
    }
}

impl AuthMethods {
    /// Pick the method both sides support, scanning from passkey upward.
    /// Returns `None` when nothing is in common.
    pub fn negotiate(self, foreign: AuthMethods) -> Option<AuthMethod> {
        let common = self & foreign;
        if common.is_empty() {
            return None;
        }

        let mut candidate = SM_AUTH_METHOD_PASSKEY;
        while candidate != 0 {
            if common.bits() & candidate != 0 {
                return AuthMethod::from_u8(candidate);
            }
            candidate <<= 1;
        }
        None
    }
}

/// The single authentication method agreed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// User-entered passkey
    Passkey,
    /// Preconfigured code shared by both sides
    DefaultCode,
    /// No secret, passkey fixed to zero
    JustAllowed,
}

impl AuthMethod {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            AuthMethod::Passkey => SM_AUTH_METHOD_PASSKEY,
            AuthMethod::DefaultCode => SM_AUTH_METHOD_DEFAULT_CODE,
            AuthMethod::JustAllowed => SM_AUTH_METHOD_JUST_ALLOWED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SM_AUTH_METHOD_PASSKEY => Some(AuthMethod::Passkey),
            SM_AUTH_METHOD_DEFAULT_CODE => Some(AuthMethod::DefaultCode),
            SM_AUTH_METHOD_JUST_ALLOWED => Some(AuthMethod::JustAllowed),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Passkey => write!(f, "Passkey"),
            AuthMethod::DefaultCode => write!(f, "Default Code"),
            AuthMethod::JustAllowed => write!(f, "Just Allowed"),
        }
    }
}

/// Side of the handshake this context plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Network coordinator (collector); drives the handshake
    Coordinator,
    /// Joining device (sensor)
    Device,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Device => write!(f, "device"),
        }
    }
}

/// Why the passkey callback is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyReason {
    EntryRequested,
    Entered,
    TimedOut,
}

/// Overall progress of the most recent run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningStatus {
    NotStarted,
    InProgress,
    Finished,
}

/// Security Manager configuration
#[derive(Debug, Clone)]
pub struct SmConfig {
    /// Our own extended address
    pub own_ext_addr: ExtAddr,
    /// Our own short address (used by devices to key their seed entry)
    pub own_short_addr: u16,
    /// Code used when the default-code method is agreed
    pub default_auth_code: u32,
    /// Data polling interval of sleepy devices
    pub polling_interval_ms: u32,
    /// Time allowed for the user to enter a passkey
    pub user_input_timeout_ms: u32,
    /// Width of the passkey in bits
    pub passkey_bits: u8,
    /// Passkey bits tested per authentication iteration (1 or 4)
    pub passkey_test_bits: u8,
    /// Transmission attempts for a single packet
    pub max_packet_retries: u8,
    /// Commissioning attempts before giving up on a device
    pub max_commissioning_attempts: u8,
    /// Interval between coordinator key-refresh sweeps
    pub key_refresh_period_ms: u32,
    /// Frequency hopping enabled (extended addressing toward rx-on-idle peers)
    pub frequency_hopping: bool,
    /// Security applied to sources with no seed entry
    pub default_security: SecurityDescriptor,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            own_ext_addr: ExtAddr::default(),
            own_short_addr: 0,
            default_auth_code: SM_DEFAULT_AUTH_CODE,
            polling_interval_ms: SM_POLLING_INTERVAL,
            user_input_timeout_ms: SM_USER_INPUT_TIMEOUT,
            passkey_bits: SM_PASSKEY_SIZE_BITS,
            passkey_test_bits: SM_PASSKEY_TEST_ONE_DIGIT,
            max_packet_retries: SM_PKT_MAX_RETRY_ATTEMPTS,
            max_commissioning_attempts: SM_CM_MAX_RETRY_ATTEMPTS,
            key_refresh_period_ms: SM_KEY_REFRESH_PERIOD,
            frequency_hopping: false,
            default_security: SecurityDescriptor::default(),
        }
    }
}

impl SmConfig {
    /// Create a configuration for the given local addresses
    pub fn new(own_ext_addr: ExtAddr, own_short_addr: u16) -> Self {
        Self {
            own_ext_addr,
            own_short_addr,
            ..Self::default()
        }
    }

    /// Number of authentication iterations
    pub fn auth_iterations(&self) -> usize {
        if self.passkey_test_bits == 0 {
            return 0;
        }
        (self.passkey_bits / self.passkey_test_bits) as usize
    }

    /// Response timeout armed after each protocol message
    pub fn commissioning_status_timeout_ms(&self) -> u32 {
        let retries = u32::from(self.max_commissioning_attempts.saturating_sub(1));
        self.polling_interval_ms
            .saturating_add(retries.saturating_mul(self.user_input_timeout_ms))
    }

    /// Long timeout covering the peer's passkey entry
    pub fn passkey_wait_timeout_ms(&self) -> u32 {
        self.user_input_timeout_ms
            .saturating_add(self.commissioning_status_timeout_ms())
    }

    /// Check internal consistency
    pub fn validate(&self) -> SmResult<()> {
        if self.passkey_test_bits != SM_PASSKEY_TEST_ONE_BIT
            && self.passkey_test_bits != SM_PASSKEY_TEST_ONE_DIGIT
        {
            return Err(SmError::InvalidParameter(format!(
                "passkey test width must be 1 or 4 bits, got {}",
                self.passkey_test_bits
            )));
        }
        if self.passkey_bits > 32 {
            return Err(SmError::InvalidParameter(format!(
                "passkey wider than 32 bits: {}",
                self.passkey_bits
            )));
        }
        let iterations = self.auth_iterations();
        if iterations == 0 || iterations > SM_MAX_AUTH_ITERATIONS {
            return Err(SmError::InvalidParameter(format!(
                "unsupported authentication iteration count {}",
                iterations
            )));
        }
        Ok(())
    }
}
