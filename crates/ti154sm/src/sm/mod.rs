//! TI 15.4 commissioning Security Manager
//!
//! This module implements the commissioning handshake run between a
//! coordinator and a joining device:
//! - Authentication method negotiation and passkey entry
//! - P-256 public key exchange and iterative code/nonce authentication
//! - Device key derivation (AES-CMAC f1/f2/f3) and confirmation
//! - Seed key bookkeeping for key refresh and key recovery

pub mod constants;
mod auth;
mod crypto;
mod ecc;
mod error;
mod keys;
mod manager;
mod messages;
mod refresh;
mod state;
mod timer;
mod transport;
mod types;

#[cfg(test)]
mod tests;

// Re-export public API
pub use self::auth::{AuthIndex, AuthSession, AuthStep, CodeNonce};
pub use self::crypto::{
    aes_cmac, f1, f2, f3, generate_subkeys, passkey_slice, AesBlockCipher, DerivedKeys, SoftwareAes,
};
pub use self::ecc::{x_coordinate, CryptoProvider, EccKeyMaterial, PublicKeyBytes, SoftwareCrypto};
pub use self::error::{ErrorCode, SmError, SmResult};
pub use self::keys::*;
pub use self::manager::{
    CommissioningContext, Dispatch, FailureReport, RecoveryStatus, SmCallbacks, SmServices,
};
pub use self::messages::{CommandId, MessageKind, SmMessage};
pub use self::refresh::{DeviceRoster, RecommissionStatus, RefreshStatus, RosterEntry};
pub use self::state::{Event, EventQueue, State};
pub use self::timer::{ManualTimer, TimerKind, TimerService};
pub use self::transport::{DataRequest, MemoryTransport, PacketSender, SendOutcome, Transport};
pub use self::types::*;
