//! ti154sm - Commissioning Security Manager for TI 15.4 networks
//!
//! This library runs the key-establishment handshake between a network
//! coordinator and a joining device. The two sides agree on an
//! authentication method, exchange P-256 public keys, authenticate each
//! other with a passkey in several rounds and derive a shared device key with
//! AES-CMAC. The same seed is later reused for periodic key refresh.
//!
//! The MAC data service, timers, key table, non-volatile storage and user
//! interface are reached through traits so the state machine can run on
//! top of any stack.

pub mod sm;

// Re-export common types for convenience
pub use sm::{
    AuthMethod, AuthMethods, CommissioningContext, CommissioningStatus, DeviceDescriptor,
    Dispatch, ErrorCode, ExtAddr, FailureReport, Role, SmCallbacks, SmConfig, SmError, SmResult,
    SmServices, State,
};
