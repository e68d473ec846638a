//! Iterative passkey authentication
//!
//! Each iteration tests a slice of the passkey. The generator sends
//! `f1(own X, peer X, nonce, slice)` together with its nonce and the verifier
//! recomputes the code from the nonce. The device runs one step behind the
//! coordinator: it generates first, then on every pair it receives it
//! verifies and generates the next one. The coordinator verifies and
//! answers at the same iteration.

use super::constants::*;
use super::crypto::{f1, passkey_slice};
use super::ecc::{CryptoProvider, EccKeyMaterial};
use super::error::{SmError, SmResult};
use super::messages::CommandId;
use super::types::Role;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Position in the iteration sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthIndex {
    /// Device before its first generation
    #[default]
    Pending,
    /// Iteration in progress
    At(usize),
}

impl AuthIndex {
    fn next(self) -> usize {
        match self {
            AuthIndex::Pending => 0,
            AuthIndex::At(i) => i + 1,
        }
    }
}

/// One code/nonce pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Zeroize)]
pub struct CodeNonce {
    pub code: [u8; SM_AUTH_CODE_LEN],
    pub nonce: [u8; SM_AUTH_NONCE_LEN],
}

impl CodeNonce {
    /// Payload form: code followed by nonce
    pub fn to_bytes(&self) -> [u8; SM_AUTH_CODE_NONCE_LEN] {
        let mut out = [0u8; SM_AUTH_CODE_NONCE_LEN];
        out[..SM_AUTH_CODE_LEN].copy_from_slice(&self.code);
        out[SM_AUTH_CODE_LEN..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(data: &[u8; SM_AUTH_CODE_NONCE_LEN]) -> Self {
        let mut pair = Self::default();
        pair.code.copy_from_slice(&data[..SM_AUTH_CODE_LEN]);
        pair.nonce.copy_from_slice(&data[SM_AUTH_CODE_LEN..]);
        pair
    }
}

/// What the state machine must do after one authentication step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send `pair` as `CodeNonce(iteration)` and wait for `awaiting`
    Send {
        iteration: usize,
        pair: CodeNonce,
        awaiting: CommandId,
    },
    /// The peer's code did not verify
    Mismatch { iteration: usize },
    /// Every iteration verified; move on to key generation
    Complete,
}

/// Code/nonce history of one run
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthSession {
    #[zeroize(skip)]
    index: AuthIndex,
    iterations: usize,
    local: [CodeNonce; SM_MAX_AUTH_ITERATIONS],
    foreign: [CodeNonce; SM_MAX_AUTH_ITERATIONS],
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new(0)
    }
}

impl AuthSession {
    pub fn new(iterations: usize) -> Self {
        Self {
            index: AuthIndex::Pending,
            iterations: iterations.min(SM_MAX_AUTH_ITERATIONS),
            local: [CodeNonce::default(); SM_MAX_AUTH_ITERATIONS],
            foreign: [CodeNonce::default(); SM_MAX_AUTH_ITERATIONS],
        }
    }

    /// Wipe all pairs and start over with `iterations` iterations
    pub fn reset(&mut self, iterations: usize) {
        self.zeroize();
        self.index = AuthIndex::Pending;
        self.iterations = iterations.min(SM_MAX_AUTH_ITERATIONS);
    }

    pub fn index(&self) -> AuthIndex {
        self.index
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Coordinator: the first pair from the device opens iteration 0
    pub fn begin(&mut self) {
        self.index = AuthIndex::At(0);
    }

    /// Coordinator: each further pair opens the next iteration
    pub fn advance(&mut self) -> SmResult<()> {
        let next = self.index.next();
        if next >= self.iterations {
            return Err(SmError::InvalidMessage(format!(
                "code/nonce beyond the last iteration ({})",
                next
            )));
        }
        self.index = AuthIndex::At(next);
        Ok(())
    }

    /// Record the peer's pair for the current iteration
    pub fn store_foreign(&mut self, pair: CodeNonce) -> SmResult<()> {
        match self.index {
            AuthIndex::At(i) if i < self.iterations => {
                self.foreign[i] = pair;
                Ok(())
            }
            index => Err(SmError::InvalidMessage(format!(
                "no iteration open for a code/nonce pair ({:?})",
                index
            ))),
        }
    }

    /// Seed both histories from lookup data for a key refresh
    pub fn seed_from_lookup(&mut self, lookup: &[u8; SM_KEY_SOURCE_LEN]) {
        self.local.zeroize();
        self.foreign.zeroize();
        self.local[0].nonce[..SM_KEY_SOURCE_LEN].copy_from_slice(lookup);
        self.foreign[0].nonce[..SM_KEY_SOURCE_LEN].copy_from_slice(lookup);
    }

    /// Run one authentication step
    pub fn step<P: CryptoProvider + ?Sized>(
        &mut self,
        role: Role,
        provider: &mut P,
        ecc: &EccKeyMaterial,
        passkey: u32,
        test_bits: u8,
    ) -> SmResult<AuthStep> {
        let local_x = ecc.local_x();
        let foreign_x = ecc.foreign_x();

        if let AuthIndex::At(i) = self.index {
            let received = &self.foreign[i];
            let expected = f1(
                &*provider,
                &foreign_x,
                &local_x,
                &received.nonce,
                passkey_slice(passkey, i, test_bits),
            )?;
            if expected != received.code {
                warn!(iteration = i, "authentication code mismatch");
                return Ok(AuthStep::Mismatch { iteration: i });
            }
            debug!(iteration = i, "authentication code verified");
        } else if role == Role::Coordinator {
            return Err(SmError::InvalidMessage(
                "coordinator stepped before receiving a pair".into(),
            ));
        }

        if role == Role::Device {
            let next = self.index.next();
            if next >= self.iterations {
                return Ok(AuthStep::Complete);
            }
            self.index = AuthIndex::At(next);
        }

        let AuthIndex::At(i) = self.index else {
            return Err(SmError::InvalidMessage("authentication index not set".into()));
        };

        let mut pair = CodeNonce::default();
        provider.random_bytes(&mut pair.nonce)?;
        pair.code = f1(
            &*provider,
            &local_x,
            &foreign_x,
            &pair.nonce,
            passkey_slice(passkey, i, test_bits),
        )?;
        self.local[i] = pair;

        let awaiting = match role {
            Role::Device => CommandId::CodeNonce(i as u8),
            Role::Coordinator if i + 1 == self.iterations => CommandId::SecurityVal,
            Role::Coordinator => CommandId::CodeNonce((i + 1) as u8),
        };

        Ok(AuthStep::Send {
            iteration: i,
            pair,
            awaiting,
        })
    }

    /// XOR of every local nonce
    pub fn fold_local(&self) -> [u8; SM_AUTH_NONCE_LEN] {
        fold(&self.local[..self.iterations.max(1)])
    }

    /// XOR of every foreign nonce
    pub fn fold_foreign(&self) -> [u8; SM_AUTH_NONCE_LEN] {
        fold(&self.foreign[..self.iterations.max(1)])
    }
}

fn fold(pairs: &[CodeNonce]) -> [u8; SM_AUTH_NONCE_LEN] {
    let mut out = [0u8; SM_AUTH_NONCE_LEN];
    for pair in pairs {
        for (o, n) in out.iter_mut().zip(pair.nonce.iter()) {
            *o ^= *n;
        }
    }
    out
}
