//! Outbound path: MAC data requests and bounded retransmission

use super::constants::*;
use super::messages::{CommandId, SmMessage};
use super::types::{Address, DeviceDescriptor, SecurityDescriptor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

/// A single MAC data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Destination address
    pub dst: Address,
    /// Send with the extended source address
    pub src_extended: bool,
    /// Destination PAN
    pub pan_id: u16,
    /// Handle echoed back in the send confirmation
    pub msdu_handle: u8,
    /// Request an acknowledgement
    pub ack: bool,
    /// Queue for indirect (polled) delivery
    pub indirect: bool,
    /// Frame security
    pub security: SecurityDescriptor,
    /// Serialized SM frame
    pub payload: Vec<u8>,
}

impl DataRequest {
    /// Build the request carrying `message` to `peer`
    pub fn new(
        peer: &DeviceDescriptor,
        security: &SecurityDescriptor,
        rx_on_idle: bool,
        frequency_hopping: bool,
        message: &SmMessage,
    ) -> Self {
        let extended = frequency_hopping && rx_on_idle;
        let dst = if extended {
            Address::Extended(peer.ext_addr)
        } else {
            Address::Short(peer.short_addr)
        };
        let msdu_handle = if message.command.is_fail() {
            SM_FAIL_MSDU_HANDLE
        } else {
            SM_DATA_MSDU_HANDLE
        };

        Self {
            dst,
            src_extended: extended,
            pan_id: peer.pan_id,
            msdu_handle,
            ack: true,
            indirect: !rx_on_idle,
            security: *security,
            payload: message.serialize(),
        }
    }
}

/// MAC data service
pub trait Transport {
    /// Queue a frame; `false` means the MAC refused it outright
    fn send_data(&mut self, request: &DataRequest) -> bool;
}

impl<T: Transport + ?Sized> Transport for Rc<RefCell<T>> {
    fn send_data(&mut self, request: &DataRequest) -> bool {
        self.borrow_mut().send_data(request)
    }
}

/// Result of one transmission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The MAC queued the frame
    Admitted,
    /// The MAC refused the frame; a retry may follow
    Rejected,
    /// The attempt ceiling for this packet was exceeded
    Exhausted {
        /// Command of the abandoned packet
        command: CommandId,
    },
}

/// Keeps the last outbound packet so it can be retransmitted
#[derive(Debug, Clone)]
pub struct PacketSender {
    last: Option<(CommandId, DataRequest)>,
    attempts: u8,
    max_attempts: u8,
}

impl PacketSender {
    pub fn new(max_attempts: u8) -> Self {
        Self {
            last: None,
            attempts: 0,
            max_attempts,
        }
    }

    /// Send a new packet, restarting the attempt count
    pub fn send<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: CommandId,
        request: DataRequest,
    ) -> SendOutcome {
        debug!(%command, dst = %request.dst, "sending");
        self.last = Some((command, request));
        self.attempts = 0;
        self.attempt(transport)
    }

    /// Retransmit the last packet
    pub fn resend<T: Transport + ?Sized>(&mut self, transport: &mut T) -> SendOutcome {
        self.attempt(transport)
    }

    fn attempt<T: Transport + ?Sized>(&mut self, transport: &mut T) -> SendOutcome {
        let Some((command, request)) = self.last.as_ref() else {
            warn!("retransmit requested with no packet pending");
            return SendOutcome::Rejected;
        };

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            warn!(command = %command, attempts = self.attempts - 1, "packet retries exhausted");
            return SendOutcome::Exhausted { command: *command };
        }
        if self.attempts > 1 {
            debug!(command = %command, attempt = self.attempts, "retransmitting");
        }

        if transport.send_data(request) {
            SendOutcome::Admitted
        } else {
            SendOutcome::Rejected
        }
    }

    /// Transmission attempts made for the current packet
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Command of the current packet
    pub fn last_command(&self) -> Option<CommandId> {
        self.last.as_ref().map(|(command, _)| *command)
    }
}

/// Transport that records every request, for tests and demos
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Vec<DataRequest>,
    /// Number of upcoming requests to refuse
    pub reject_next: usize,
    /// Refuse every request
    pub reject_all: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the requests admitted so far
    pub fn take_sent(&mut self) -> Vec<DataRequest> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent(&self) -> &[DataRequest] {
        &self.sent
    }
}

impl Transport for MemoryTransport {
    fn send_data(&mut self, request: &DataRequest) -> bool {
        if self.reject_all {
            return false;
        }
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return false;
        }
        self.sent.push(request.clone());
        true
    }
}
