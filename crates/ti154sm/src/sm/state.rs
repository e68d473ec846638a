//! Commissioning states, their legal transitions and the pending-event set

use super::error::{SmError, SmResult};
use super::types::Role;
use std::collections::BTreeSet;
use std::fmt;

/// Commissioning state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Idle
    Entry,
    /// Coordinator sent the commissioning request
    Start,
    /// Authentication method negotiation
    AuthMethod,
    /// Passkey selection or entry
    Passkey,
    /// Public key exchange
    KeyExchange,
    /// Iterative code/nonce exchange
    Authentication,
    /// Key derivation and confirmation
    KeyGen,
    FinishSuccess,
    FinishFail,
}

impl State {
    /// Validate a move to `to`. Failure is reachable from anywhere; every
    /// other step follows the handshake order.
    pub fn transition(self, to: State, role: Role, refresh: bool) -> SmResult<State> {
        let allowed = match (self, to) {
            (_, State::FinishFail) => true,
            (State::Entry, State::Start) => role == Role::Coordinator,
            (State::Entry, State::AuthMethod) => role == Role::Device,
            (State::Entry, State::KeyGen) => refresh,
            (State::Start, State::AuthMethod) => role == Role::Coordinator,
            (State::AuthMethod, State::Passkey) => true,
            (State::Passkey, State::KeyExchange) => true,
            (State::KeyExchange, State::Authentication) => true,
            (State::Authentication, State::KeyGen) => true,
            (State::KeyGen, State::FinishSuccess) => true,
            (State::FinishSuccess, State::Entry) | (State::FinishFail, State::Entry) => true,
            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(SmError::InvalidTransition { from: self, to })
        }
    }

    /// States in which peer messages are accepted
    pub fn accepts_messages(&self) -> bool {
        !matches!(self, State::Entry | State::FinishFail)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Entry => write!(f, "Entry"),
            State::Start => write!(f, "Start"),
            State::AuthMethod => write!(f, "AuthMethod"),
            State::Passkey => write!(f, "Passkey"),
            State::KeyExchange => write!(f, "KeyExchange"),
            State::Authentication => write!(f, "Authentication"),
            State::KeyGen => write!(f, "KeyGen"),
            State::FinishSuccess => write!(f, "FinishSuccess"),
            State::FinishFail => write!(f, "FinishFail"),
        }
    }
}

/// Work items raised while handling inputs. Declaration order is the
/// processing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Event {
    /// Process timer expired
    Timeout,
    /// A failure notice was delivered to the peer
    SentFail,
    /// A transmission failed and the last packet must be resent
    SendFailed,
    /// Coordinator opens a run
    CoordinatorStart,
    /// Passkey (or fixed code) is known
    Passkey,
    /// A code/nonce pair arrived
    AuthResponse,
    /// A security value arrived while in key generation
    KeyGen,
    /// The state changed; run the entry action of the new state
    StateChange,
    /// Key-refresh sweep timer expired
    KeyRefreshSweep,
}

/// Pending events. Raising an event that is already pending is a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    pending: BTreeSet<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.pending.insert(event);
    }

    /// Take the highest-priority pending event
    pub fn pop(&mut self) -> Option<Event> {
        self.pending.pop_first()
    }

    pub fn contains(&self, event: Event) -> bool {
        self.pending.contains(&event)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
