//! Commissioning state machine
//!
//! [`CommissioningContext`] owns every piece of per-run state plus the
//! collaborators it talks to (crypto provider, MAC transport, timers, key
//! table, non-volatile storage, application callbacks). Inputs arrive through
//! `start_*`, `stop_commissioning`, `on_message_received`, `on_timer_fired`,
//! `on_send_feedback` and `set_passkey`. Each input raises events that are
//! drained before the call returns, so every call is one processing pass.

use super::auth::{AuthSession, AuthStep, CodeNonce};
use super::constants::*;
use super::crypto::{f2, f3};
use super::ecc::{CryptoProvider, EccKeyMaterial, SoftwareCrypto};
use super::error::{ErrorCode, SmError, SmResult};
use super::keys::*;
use super::messages::{CommandId, SmMessage};
use super::refresh::DeviceRoster;
use super::state::{Event, EventQueue, State};
use super::timer::{TimerKind, TimerService};
use super::transport::{DataRequest, PacketSender, SendOutcome, Transport};
use super::types::*;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Application hooks
pub trait SmCallbacks {
    /// Passkey entry UI notification
    fn request_passkey(&mut self, reason: PasskeyReason);

    /// A run completed and the device key is installed
    fn on_success(&mut self, device: &DeviceDescriptor, refresh: bool);

    /// A run failed; all key material from it has been discarded
    fn on_failure(&mut self, report: &FailureReport);
}

impl<T: SmCallbacks + ?Sized> SmCallbacks for Rc<RefCell<T>> {
    fn request_passkey(&mut self, reason: PasskeyReason) {
        self.borrow_mut().request_passkey(reason)
    }

    fn on_success(&mut self, device: &DeviceDescriptor, refresh: bool) {
        self.borrow_mut().on_success(device, refresh)
    }

    fn on_failure(&mut self, report: &FailureReport) {
        self.borrow_mut().on_failure(report)
    }
}

/// Details handed to [`SmCallbacks::on_failure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub device: DeviceDescriptor,
    pub rx_on_idle: bool,
    /// The failed run was a key refresh
    pub refresh: bool,
    pub error_code: ErrorCode,
    /// Commissioning attempts made so far, this one included
    pub attempts: u8,
    /// Whether starting another attempt for this device makes sense
    pub retry_allowed: bool,
    /// The run was cancelled with `stop_commissioning`
    pub force_stopped: bool,
}

/// How a received frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Fed into the running handshake
    Handled,
    /// Dropped by the receive guard
    Ignored,
    /// The peer wants to open a run; the application decides whether to
    /// call `start_commissioning` or `start_key_refresh`
    StartRequested { refresh: bool },
}

/// Outcome of [`CommissioningContext::poll_key_recovery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// Recommissioning of this device started
    Started(DeviceDescriptor),
    /// Another run is in progress
    Busy,
    /// No device is waiting for recommissioning
    Complete,
}

/// Collaborators of a commissioning context
pub struct SmServices {
    pub crypto: Box<dyn CryptoProvider>,
    pub transport: Box<dyn Transport>,
    pub timers: Box<dyn TimerService>,
    pub key_table: Box<dyn KeyTable>,
    pub storage: Box<dyn DeviceKeyStorage>,
    pub callbacks: Box<dyn SmCallbacks>,
}

impl SmServices {
    /// Services using the software crypto provider
    pub fn software(
        transport: Box<dyn Transport>,
        timers: Box<dyn TimerService>,
        key_table: Box<dyn KeyTable>,
        storage: Box<dyn DeviceKeyStorage>,
        callbacks: Box<dyn SmCallbacks>,
    ) -> Self {
        Self {
            crypto: Box::new(SoftwareCrypto::new()),
            transport,
            timers,
            key_table,
            storage,
            callbacks,
        }
    }
}

/// Keys and check values of the key generation step
#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct KeyGenValues {
    confirm_key: [u8; SM_KEY_LEN],
    device_key: [u8; SM_KEY_LEN],
    local_e: [u8; SM_KEY_LEN],
    expected_e: [u8; SM_KEY_LEN],
    received_e: [u8; SM_KEY_LEN],
}

/// Minimum payload length of each command
fn payload_len(command: CommandId) -> usize {
    match command {
        CommandId::ProcessRequest => SM_DEVICE_DESCRIPTOR_LEN,
        CommandId::ProcessResponse | CommandId::MethodConfirm => 1,
        CommandId::PublicKey => SM_ECC_PUBLIC_KEY_LEN,
        CommandId::CodeNonce(_) => SM_AUTH_CODE_NONCE_LEN,
        CommandId::SecurityVal => SM_KEY_LEN,
        CommandId::PasskeyConfirm
        | CommandId::Success
        | CommandId::KeyRefreshRequest
        | CommandId::Fail => 0,
    }
}

/// One commissioning endpoint
pub struct CommissioningContext {
    config: SmConfig,
    crypto: Box<dyn CryptoProvider>,
    transport: Box<dyn Transport>,
    timers: Box<dyn TimerService>,
    key_table: Box<dyn KeyTable>,
    storage: Box<dyn DeviceKeyStorage>,
    callbacks: Box<dyn SmCallbacks>,

    state: State,
    status: CommissioningStatus,
    role: Role,
    /// Peer of the current run
    device: DeviceDescriptor,
    security: SecurityDescriptor,
    rx_on_idle: bool,
    local_methods: AuthMethods,
    foreign_methods: AuthMethods,
    auth_method: Option<AuthMethod>,
    passkey: u32,
    awaiting_passkey: bool,
    /// Message the receive guard lets through
    waiting: Option<CommandId>,
    /// Send confirmations are relevant to the last packet
    use_send_status: bool,
    refresh: bool,
    force_stopped: bool,
    /// A failure notice went out; the next timeout ends the run
    fail_sent: bool,
    error_code: ErrorCode,
    attempts: u8,
    process_timeout_ms: u32,

    ecc: EccKeyMaterial,
    auth: AuthSession,
    keygen: KeyGenValues,
    sender: PacketSender,
    events: EventQueue,
    seeds: SeedKeyStore,
    roster: DeviceRoster,
}

impl CommissioningContext {
    /// Create an idle context
    pub fn new(config: SmConfig, services: SmServices) -> SmResult<Self> {
        config.validate()?;
        let iterations = config.auth_iterations();
        let max_packet_retries = config.max_packet_retries;

        Ok(Self {
            config,
            crypto: services.crypto,
            transport: services.transport,
            timers: services.timers,
            key_table: services.key_table,
            storage: services.storage,
            callbacks: services.callbacks,
            state: State::Entry,
            status: CommissioningStatus::NotStarted,
            role: Role::Coordinator,
            device: DeviceDescriptor::default(),
            security: SecurityDescriptor::default(),
            rx_on_idle: true,
            local_methods: AuthMethods::empty(),
            foreign_methods: AuthMethods::empty(),
            auth_method: None,
            passkey: 0,
            awaiting_passkey: false,
            waiting: None,
            use_send_status: false,
            refresh: false,
            force_stopped: false,
            fail_sent: false,
            error_code: ErrorCode::None,
            attempts: 0,
            process_timeout_ms: 0,
            ecc: EccKeyMaterial::new(),
            auth: AuthSession::new(iterations),
            keygen: KeyGenValues::default(),
            sender: PacketSender::new(max_packet_retries),
            events: EventQueue::new(),
            seeds: SeedKeyStore::new(),
            roster: DeviceRoster::new(),
        })
    }

    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn status(&self) -> CommissioningStatus {
        self.status
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Error code of the current or last run
    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    /// Failed commissioning attempts since the last success
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Start counting attempts afresh (for a device seen for the first time)
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.auth_method
    }

    pub fn foreign_methods(&self) -> AuthMethods {
        self.foreign_methods
    }

    /// Message the receive guard is waiting for
    pub fn awaiting(&self) -> Option<CommandId> {
        self.waiting
    }

    pub fn is_awaiting_passkey(&self) -> bool {
        self.awaiting_passkey
    }

    pub fn seeds(&self) -> &SeedKeyStore {
        &self.seeds
    }

    pub fn roster(&self) -> &DeviceRoster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut DeviceRoster {
        &mut self.roster
    }

    /// Update the local short address once the network assigns it
    pub fn set_own_short_addr(&mut self, short_addr: u16) {
        self.config.own_short_addr = short_addr;
    }

    /// Open a commissioning run with `device`
    pub fn start_commissioning(
        &mut self,
        device: DeviceDescriptor,
        security: SecurityDescriptor,
        role: Role,
        rx_on_idle: bool,
        methods: AuthMethods,
    ) -> SmResult<()> {
        self.begin_commissioning(device, security, role, rx_on_idle, methods)?;
        self.process_events()
    }

    /// Derive a fresh device key from the stored seed of `device`
    pub fn start_key_refresh(
        &mut self,
        device: DeviceDescriptor,
        security: SecurityDescriptor,
        role: Role,
        rx_on_idle: bool,
    ) -> SmResult<()> {
        let started = self.begin_key_refresh(device, security, role, rx_on_idle);
        self.process_events()?;
        started
    }

    /// Abort the current run. A no-op when nothing is in progress.
    pub fn stop_commissioning(&mut self) -> SmResult<()> {
        if self.status != CommissioningStatus::InProgress {
            debug!("stop requested with no run in progress");
            return Ok(());
        }

        info!(device = %self.device.ext_addr, state = %self.state, "commissioning stopped");
        self.attempts = self.config.max_commissioning_attempts;
        self.force_stopped = true;
        self.switch_state(State::FinishFail);
        self.process_events()
    }

    /// Feed a received frame from `source` into the handshake
    pub fn on_message_received(&mut self, source: Address, frame: &[u8]) -> SmResult<Dispatch> {
        let message = SmMessage::parse(frame)?;
        if let Some(dispatch) = self.guard(&source, &message)? {
            return Ok(dispatch);
        }

        self.timers.stop(TimerKind::Process);
        self.waiting = None;
        self.use_send_status = false;
        debug!(command = %message.command, state = %self.state, "received");

        let handled = self.handle_message(&message);
        if let Err(e) = &handled {
            error!(error = %e, command = %message.command, "message handling failed");
            self.abort(e);
        }
        self.process_events()?;
        handled
    }

    /// A timer armed by this context expired
    pub fn on_timer_fired(&mut self, kind: TimerKind) -> SmResult<()> {
        match kind {
            TimerKind::Process => {
                if self.status == CommissioningStatus::InProgress {
                    self.events.push(Event::Timeout);
                }
            }
            TimerKind::KeyRefresh => self.events.push(Event::KeyRefreshSweep),
        }
        self.process_events()
    }

    /// MAC send confirmation for a frame with `msdu_handle`
    pub fn on_send_feedback(&mut self, msdu_handle: u8, success: bool) -> SmResult<()> {
        if self.status != CommissioningStatus::InProgress || !self.use_send_status {
            return Ok(());
        }

        match (msdu_handle, success) {
            (SM_FAIL_MSDU_HANDLE, true) => self.events.push(Event::SentFail),
            (SM_FAIL_MSDU_HANDLE, false) | (SM_DATA_MSDU_HANDLE, false) => {
                debug!(msdu_handle, "send failed");
                self.events.push(Event::SendFailed);
            }
            _ => {}
        }
        self.process_events()
    }

    /// Passkey typed in by the user
    pub fn set_passkey(&mut self, passkey: u32) -> SmResult<()> {
        if self.state != State::Passkey
            || !self.awaiting_passkey
            || self.auth_method != Some(AuthMethod::Passkey)
            || !self.timers.is_active(TimerKind::Process)
        {
            return Err(SmError::InvalidParameter("no passkey entry pending".into()));
        }

        self.timers.stop(TimerKind::Process);
        self.awaiting_passkey = false;
        self.passkey = passkey & self.passkey_mask();
        self.events.push(Event::Passkey);
        self.process_events()
    }

    /// Arm the periodic coordinator key refresh
    pub fn start_key_refresh_sweep(&mut self) {
        self.timers
            .start(TimerKind::KeyRefresh, self.config.key_refresh_period_ms);
    }

    pub fn stop_key_refresh_sweep(&mut self) {
        self.timers.stop(TimerKind::KeyRefresh);
    }

    /// Recommission the next device flagged as having lost its keys
    pub fn poll_key_recovery(
        &mut self,
        security: SecurityDescriptor,
        methods: AuthMethods,
    ) -> SmResult<RecoveryStatus> {
        if self.status == CommissioningStatus::InProgress {
            return Ok(RecoveryStatus::Busy);
        }

        match self.roster.next_recommission() {
            Some(entry) => {
                info!(device = %entry.device.ext_addr, "recommissioning device");
                self.attempts = 0;
                self.begin_commissioning(
                    entry.device,
                    security,
                    Role::Coordinator,
                    entry.rx_on_idle,
                    methods,
                )?;
                self.process_events()?;
                Ok(RecoveryStatus::Started(entry.device))
            }
            None => {
                info!("key recovery complete");
                Ok(RecoveryStatus::Complete)
            }
        }
    }

    /// Device side: reinstall the key persisted before a reboot. Returns
    /// `false` when nothing was stored.
    pub fn recover_key_info(&mut self, parent_ext_addr: ExtAddr) -> SmResult<bool> {
        let Some(info) = self.storage.load_device_key_info()? else {
            return Ok(false);
        };

        let own_ext = self.config.own_ext_addr;
        self.seeds.restore(&own_ext, self.config.own_short_addr, &info);
        let entry = self
            .seeds
            .get_by_ext(&own_ext)
            .cloned()
            .ok_or(SmError::MissingSeedEntry)?;
        self.key_table.add_device_key(&DeviceKeyEntry::new(
            &entry,
            &info.device_key,
            true,
            parent_ext_addr,
        ))?;

        info!(index = entry.index, key_id = entry.key_id(), "device key recovered");
        Ok(true)
    }

    /// Frame security to expect from a source
    pub fn src_device_security(&self, ext_addr: &ExtAddr, short_addr: u16) -> SecurityDescriptor {
        match self.seeds.get(ext_addr, short_addr) {
            Some(entry) => SecurityDescriptor {
                key_source: entry.lookup_data,
                security_level: SM_SEC_LEVEL_ENC_MIC_32,
                key_id_mode: SM_KEY_ID_MODE_8,
                key_index: short_addr as u8,
            },
            None => self.config.default_security,
        }
    }

    /// Forget a device; returns whether anything was known about it
    pub fn remove_device(&mut self, ext_addr: &ExtAddr) -> bool {
        let had_seed = self.seeds.remove(ext_addr);
        let had_entry = self.roster.remove(ext_addr);
        had_seed || had_entry
    }

    /// Drain pending events. Called by every input; exposed for callers that
    /// raise work between inputs.
    pub fn process_events(&mut self) -> SmResult<()> {
        let mut first_error = None;
        while let Some(event) = self.events.pop() {
            if let Err(e) = self.handle_event(event) {
                error!(error = %e, ?event, "event handling failed");
                self.abort(&e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn begin_commissioning(
        &mut self,
        device: DeviceDescriptor,
        security: SecurityDescriptor,
        role: Role,
        rx_on_idle: bool,
        methods: AuthMethods,
    ) -> SmResult<()> {
        if self.status == CommissioningStatus::InProgress {
            warn!(device = %device.ext_addr, "commissioning already in progress");
            return Err(SmError::InProgress);
        }

        info!(%role, device = %device.ext_addr, ?methods, "commissioning started");
        self.reset_run(device, security, role, rx_on_idle, false);
        self.local_methods = methods;

        match role {
            Role::Coordinator => self.events.push(Event::CoordinatorStart),
            Role::Device => self.switch_state(State::AuthMethod),
        }
        Ok(())
    }

    fn begin_key_refresh(
        &mut self,
        device: DeviceDescriptor,
        security: SecurityDescriptor,
        role: Role,
        rx_on_idle: bool,
    ) -> SmResult<()> {
        if self.status == CommissioningStatus::InProgress {
            warn!(device = %device.ext_addr, "key refresh refused, run in progress");
            return Err(SmError::InProgress);
        }
        if self.state != State::Entry {
            return Err(SmError::InvalidTransition {
                from: self.state,
                to: State::KeyGen,
            });
        }

        self.reset_run(device, security, role, rx_on_idle, true);
        self.local_methods = AuthMethods::empty();

        let (ext_addr, short_addr) = self.seed_identity();
        let seed = self
            .seeds
            .get(&ext_addr, short_addr)
            .filter(|entry| entry.key_id() != 0)
            .cloned();
        let Some(seed) = seed else {
            warn!(device = %device.ext_addr, "no usable seed entry for key refresh");
            self.error_code = ErrorCode::MissingKey;
            self.switch_state(State::FinishFail);
            return Err(SmError::MissingSeedEntry);
        };

        info!(%role, device = %device.ext_addr, key_id = seed.key_id(), "key refresh started");
        self.ecc.load_seed(&seed.seed_key);
        self.auth.seed_from_lookup(&seed.lookup_data);
        self.switch_state(State::KeyGen);
        Ok(())
    }

    fn reset_run(
        &mut self,
        device: DeviceDescriptor,
        security: SecurityDescriptor,
        role: Role,
        rx_on_idle: bool,
        refresh: bool,
    ) {
        self.status = CommissioningStatus::InProgress;
        self.role = role;
        self.device = device;
        self.security = security;
        self.rx_on_idle = rx_on_idle;
        self.refresh = refresh;
        self.foreign_methods = AuthMethods::empty();
        self.auth_method = None;
        self.passkey = 0;
        self.awaiting_passkey = false;
        self.waiting = None;
        self.use_send_status = false;
        self.fail_sent = false;
        self.error_code = ErrorCode::None;
        self.timers.stop(TimerKind::Process);
        self.clear_key_material();
        self.state = State::Entry;
    }

    fn clear_key_material(&mut self) {
        self.ecc.clear();
        self.auth.reset(self.config.auth_iterations());
        self.keygen.zeroize();
    }

    /// Seed-table key of the current run: the peer on a coordinator,
    /// ourselves on a device
    fn seed_identity(&self) -> (ExtAddr, u16) {
        match self.role {
            Role::Coordinator => (self.device.ext_addr, self.device.short_addr),
            Role::Device => (self.config.own_ext_addr, self.config.own_short_addr),
        }
    }

    fn passkey_mask(&self) -> u32 {
        match self.config.passkey_bits {
            bits if bits >= 32 => u32::MAX,
            bits => (1u32 << bits) - 1,
        }
    }

    /// Returns `Some` when the frame must not reach the handshake
    fn guard(&self, source: &Address, message: &SmMessage) -> SmResult<Option<Dispatch>> {
        if !self.state.accepts_messages() {
            if self.state == State::Entry {
                match message.command {
                    CommandId::ProcessRequest => {
                        return Ok(Some(Dispatch::StartRequested { refresh: false }))
                    }
                    CommandId::KeyRefreshRequest => {
                        return Ok(Some(Dispatch::StartRequested { refresh: true }))
                    }
                    _ => {}
                }
            }
            debug!(command = %message.command, state = %self.state, "dropped, no run active");
            return Ok(Some(Dispatch::Ignored));
        }

        if !self.device.matches(source) {
            debug!(%source, "dropped frame from unexpected source");
            return Ok(Some(Dispatch::Ignored));
        }

        if let Some(expected) = self.waiting {
            if message.command != expected && !message.command.is_fail() {
                debug!(%expected, received = %message.command, "dropped unexpected message");
                return Ok(Some(Dispatch::Ignored));
            }
        }

        let required = payload_len(message.command);
        if message.payload.len() < required {
            warn!(command = %message.command, len = message.payload.len(), required, "dropped short frame");
            return Err(SmError::InvalidMessage(format!(
                "{} payload is {} bytes, expected {}",
                message.command,
                message.payload.len(),
                required
            )));
        }

        Ok(None)
    }

    fn handle_message(&mut self, message: &SmMessage) -> SmResult<Dispatch> {
        let coordinator = self.role == Role::Coordinator;

        match message.command {
            CommandId::ProcessResponse => {
                if coordinator && self.state == State::Start {
                    self.foreign_methods = AuthMethods::from_bits_truncate(message.payload_u8()?);
                    self.switch_state(State::AuthMethod);
                }
            }
            CommandId::MethodConfirm => {
                if !coordinator && self.state == State::AuthMethod {
                    let raw = message.payload_u8()?;
                    match AuthMethod::from_u8(raw) {
                        Some(method) => {
                            debug!(%method, "auth method confirmed by coordinator");
                            self.auth_method = Some(method);
                            self.switch_state(State::Passkey);
                        }
                        None => {
                            warn!(method = raw, "coordinator confirmed an unknown method");
                            self.fail_run(ErrorCode::UnsupportedAuthMethod);
                        }
                    }
                }
            }
            CommandId::PasskeyConfirm => match (self.role, self.state) {
                (Role::Coordinator, State::AuthMethod) => self.switch_state(State::Passkey),
                (Role::Device, State::Passkey) => self.switch_state(State::KeyExchange),
                _ => {}
            },
            CommandId::PublicKey => {
                self.ecc.set_foreign(&message.payload)?;
                match (self.role, self.state) {
                    (Role::Coordinator, State::Passkey) => self.switch_state(State::KeyExchange),
                    (Role::Device, State::KeyExchange) => {
                        self.ecc.compute_shared_secret(&mut *self.crypto)?;
                        self.switch_state(State::Authentication);
                    }
                    _ => {}
                }
            }
            CommandId::CodeNonce(_) => {
                let pair = CodeNonce::from_bytes(&message.payload_array()?);
                match (self.role, self.state) {
                    (Role::Coordinator, State::KeyExchange) => {
                        self.auth.begin();
                        self.auth.store_foreign(pair)?;
                        self.switch_state(State::Authentication);
                    }
                    (Role::Coordinator, State::Authentication) => {
                        self.auth.advance()?;
                        self.auth.store_foreign(pair)?;
                        self.events.push(Event::AuthResponse);
                    }
                    (Role::Device, State::Authentication) => {
                        self.auth.store_foreign(pair)?;
                        self.events.push(Event::AuthResponse);
                    }
                    _ => {}
                }
            }
            CommandId::SecurityVal => {
                self.keygen.received_e = message.payload_array()?;
                trace!(received = %hex::encode(self.keygen.received_e), "security value received");
                if coordinator && self.state == State::Authentication {
                    self.switch_state(State::KeyGen);
                } else if self.state == State::KeyGen && (self.refresh || !coordinator) {
                    self.events.push(Event::KeyGen);
                }
            }
            CommandId::Success => {
                if self.state == State::KeyGen {
                    self.switch_state(State::FinishSuccess);
                }
            }
            CommandId::Fail => {
                let code = ErrorCode::from(message.payload.first().copied().unwrap_or(0));
                if code == ErrorCode::UnsupportedAuthMethod {
                    if let Some(methods) = message.payload.get(1) {
                        self.foreign_methods = AuthMethods::from_bits_truncate(*methods);
                    }
                }
                warn!(error = %code, state = %self.state, "peer reported failure");
                self.error_code = code;
                self.switch_state(State::FinishFail);
            }
            CommandId::ProcessRequest | CommandId::KeyRefreshRequest => {
                debug!(command = %message.command, "run already active");
                return Ok(Dispatch::Ignored);
            }
        }
        Ok(Dispatch::Handled)
    }

    fn handle_event(&mut self, event: Event) -> SmResult<()> {
        match event {
            Event::Timeout => self.handle_timeout(),
            Event::SentFail => {
                self.switch_state(State::FinishFail);
                Ok(())
            }
            Event::SendFailed => {
                self.handle_send_failed();
                Ok(())
            }
            Event::CoordinatorStart => {
                self.switch_state(State::Start);
                Ok(())
            }
            Event::Passkey => {
                self.handle_passkey_ready();
                Ok(())
            }
            Event::AuthResponse => self.auth_step(),
            Event::KeyGen => {
                self.check_security_value();
                Ok(())
            }
            Event::StateChange => self.enter_state(),
            Event::KeyRefreshSweep => {
                self.sweep_key_refresh();
                Ok(())
            }
        }
    }

    /// Route the current run to failure after a local error
    /// End the run after a local error. The peer is told through a Fail
    /// frame unless one was already sent.
    fn abort(&mut self, err: &SmError) {
        if self.status != CommissioningStatus::InProgress || self.state == State::FinishFail {
            return;
        }
        let code = match self.error_code {
            ErrorCode::None => err.error_code(),
            code => code,
        };
        if self.fail_sent || !self.state.accepts_messages() {
            self.error_code = code;
            self.switch_state(State::FinishFail);
        } else {
            self.fail_run(code);
        }
    }

    fn switch_state(&mut self, to: State) {
        match self.state.transition(to, self.role, self.refresh) {
            Ok(next) => {
                debug!(from = %self.state, to = %next, "state change");
                self.state = next;
                self.events.push(Event::StateChange);
            }
            Err(e) => warn!(error = %e, "state change rejected"),
        }
    }

    fn arm(&mut self, duration_ms: u32) {
        self.process_timeout_ms = duration_ms;
        self.timers.start(TimerKind::Process, duration_ms);
    }

    fn arm_status_timer(&mut self) {
        self.arm(self.config.commissioning_status_timeout_ms());
    }

    fn send(&mut self, command: CommandId, payload: Vec<u8>) {
        let message = SmMessage::new(command, payload);
        let request = DataRequest::new(
            &self.device,
            &self.security,
            self.rx_on_idle,
            self.config.frequency_hopping,
            &message,
        );
        let outcome = self.sender.send(&mut *self.transport, command, request);
        self.handle_send_outcome(outcome);
    }

    fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Admitted => self.use_send_status = true,
            SendOutcome::Rejected => self.events.push(Event::SendFailed),
            SendOutcome::Exhausted { command } => {
                if command == CommandId::ProcessRequest {
                    self.error_code = ErrorCode::PeerUnresponsive;
                } else if self.error_code == ErrorCode::None {
                    self.error_code = ErrorCode::Timeout;
                }
                warn!(%command, error = %self.error_code, "peer not reachable");
                self.switch_state(State::FinishFail);
            }
        }
    }

    fn handle_send_failed(&mut self) {
        if self.status != CommissioningStatus::InProgress || self.sender.last_command().is_none() {
            return;
        }

        let timer_was_active = self.timers.stop(TimerKind::Process);
        let outcome = self.sender.resend(&mut *self.transport);
        self.handle_send_outcome(outcome);
        if timer_was_active {
            let duration = self.process_timeout_ms;
            self.arm(duration);
        }
    }

    /// Tell the peer the run failed and wait for the notice to go out
    fn fail_run(&mut self, code: ErrorCode) {
        warn!(error = %code, state = %self.state, "failing run");
        self.error_code = code;
        self.fail_sent = true;
        self.waiting = None;

        let mut payload = vec![u8::from(code)];
        if code == ErrorCode::UnsupportedAuthMethod {
            payload.push(self.local_methods.bits());
        }
        self.send(CommandId::Fail, payload);
        self.arm_status_timer();
    }

    fn handle_timeout(&mut self) -> SmResult<()> {
        if self.status != CommissioningStatus::InProgress {
            return Ok(());
        }

        warn!(state = %self.state, awaiting = ?self.waiting, "timed out");
        if self.awaiting_passkey {
            self.awaiting_passkey = false;
            self.callbacks.request_passkey(PasskeyReason::TimedOut);
        }
        if self.fail_sent {
            self.switch_state(State::FinishFail);
        } else {
            self.fail_run(ErrorCode::Timeout);
        }
        Ok(())
    }

    fn enter_state(&mut self) -> SmResult<()> {
        match self.state {
            State::Entry => {
                if self.role == Role::Device {
                    self.force_stopped = false;
                }
                Ok(())
            }
            State::Start => {
                self.enter_start();
                Ok(())
            }
            State::AuthMethod => {
                self.enter_auth_method();
                Ok(())
            }
            State::Passkey => self.enter_passkey(),
            State::KeyExchange => self.enter_key_exchange(),
            State::Authentication => self.auth_step(),
            State::KeyGen => self.enter_key_gen(),
            State::FinishSuccess => self.finish_success(),
            State::FinishFail => {
                self.finish_fail();
                Ok(())
            }
        }
    }

    fn enter_start(&mut self) {
        self.waiting = Some(CommandId::ProcessResponse);
        self.force_stopped = false;
        let descriptor = self.device.serialize();
        self.send(CommandId::ProcessRequest, descriptor);
        self.arm_status_timer();
    }

    fn enter_auth_method(&mut self) {
        match self.role {
            Role::Coordinator => match self.local_methods.negotiate(self.foreign_methods) {
                Some(method) => {
                    info!(%method, "auth method agreed");
                    self.auth_method = Some(method);
                    self.waiting = Some(CommandId::PasskeyConfirm);
                    self.send(CommandId::MethodConfirm, vec![method.to_u8()]);
                    self.arm(self.config.passkey_wait_timeout_ms());
                }
                None => {
                    warn!(
                        local = ?self.local_methods,
                        foreign = ?self.foreign_methods,
                        "no auth method in common"
                    );
                    self.fail_run(ErrorCode::UnsupportedAuthMethod);
                }
            },
            Role::Device => {
                self.waiting = Some(CommandId::MethodConfirm);
                self.send(CommandId::ProcessResponse, vec![self.local_methods.bits()]);
                self.arm_status_timer();
            }
        }
    }

    fn enter_passkey(&mut self) -> SmResult<()> {
        match self.auth_method {
            Some(AuthMethod::DefaultCode) => {
                self.passkey = self.config.default_auth_code & self.passkey_mask();
                self.events.push(Event::Passkey);
            }
            Some(AuthMethod::JustAllowed) => {
                self.passkey = 0;
                self.events.push(Event::Passkey);
            }
            Some(AuthMethod::Passkey) => {
                self.arm(self.config.user_input_timeout_ms);
                self.awaiting_passkey = true;
                if self.attempts < self.config.max_commissioning_attempts {
                    self.callbacks.request_passkey(PasskeyReason::EntryRequested);
                }
            }
            None => {
                return Err(SmError::InvalidParameter(
                    "passkey state entered without an agreed method".into(),
                ))
            }
        }
        Ok(())
    }

    fn handle_passkey_ready(&mut self) {
        if self.state != State::Passkey {
            return;
        }

        if self.attempts < self.config.max_commissioning_attempts {
            self.callbacks.request_passkey(PasskeyReason::Entered);
        }
        match self.role {
            Role::Coordinator => {
                self.waiting = Some(CommandId::PublicKey);
                self.send(CommandId::PasskeyConfirm, Vec::new());
                self.arm_status_timer();
            }
            Role::Device => {
                self.waiting = Some(CommandId::PasskeyConfirm);
                self.send(CommandId::PasskeyConfirm, Vec::new());
                self.arm(self.config.passkey_wait_timeout_ms());
            }
        }
    }

    fn enter_key_exchange(&mut self) -> SmResult<()> {
        self.ecc.generate_local(&mut *self.crypto)?;
        match self.role {
            Role::Coordinator => {
                self.ecc.compute_shared_secret(&mut *self.crypto)?;
                self.waiting = Some(CommandId::CodeNonce(0));
            }
            Role::Device => self.waiting = Some(CommandId::PublicKey),
        }

        let public_key = self.ecc.local_public_key.to_vec();
        self.send(CommandId::PublicKey, public_key);
        self.arm_status_timer();
        Ok(())
    }

    fn auth_step(&mut self) -> SmResult<()> {
        if self.state != State::Authentication {
            return Ok(());
        }

        let step = self.auth.step(
            self.role,
            &mut *self.crypto,
            &self.ecc,
            self.passkey,
            self.config.passkey_test_bits,
        )?;
        match step {
            AuthStep::Send {
                iteration,
                pair,
                awaiting,
            } => {
                self.waiting = Some(awaiting);
                self.send(CommandId::CodeNonce(iteration as u8), pair.to_bytes().to_vec());
                self.arm_status_timer();
            }
            AuthStep::Mismatch { .. } => self.fail_run(ErrorCode::NoMatchAuthVal),
            AuthStep::Complete => self.switch_state(State::KeyGen),
        }
        Ok(())
    }

    fn derive_keys(&mut self) -> SmResult<()> {
        let xor_local = self.auth.fold_local();
        let xor_foreign = self.auth.fold_foreign();

        let mut au = [0u8; SM_AUTH_METHOD_BUF_LEN];
        au[0] = self.auth_method.map_or(0, |method| method.to_u8());
        let mut r = [0u8; SM_PASSKEY_BUF_LEN];
        r[SM_PASSKEY_BUF_LEN - 4..].copy_from_slice(&self.passkey.to_le_bytes());

        let w = self.ecc.secret_x();
        let own = self.config.own_ext_addr.truncated();
        let peer = self.device.ext_addr.truncated();
        let cipher = &*self.crypto;

        let keys = match self.role {
            Role::Coordinator => f2(cipher, &w, &xor_local, &xor_foreign, &own, &peer)?,
            Role::Device => f2(cipher, &w, &xor_foreign, &xor_local, &peer, &own)?,
        };
        let local_e = f3(
            cipher,
            &keys.confirm_key,
            &xor_local,
            &xor_foreign,
            &r,
            &au,
            &own,
            &peer,
        )?;
        let expected_e = f3(
            cipher,
            &keys.confirm_key,
            &xor_foreign,
            &xor_local,
            &r,
            &au,
            &peer,
            &own,
        )?;

        self.keygen.confirm_key = keys.confirm_key;
        self.keygen.device_key = keys.device_key;
        self.keygen.local_e = local_e;
        self.keygen.expected_e = expected_e;
        trace!(local = %hex::encode(local_e), expected = %hex::encode(expected_e), "security values");
        Ok(())
    }

    fn enter_key_gen(&mut self) -> SmResult<()> {
        self.derive_keys()?;
        let local_e = self.keygen.local_e.to_vec();

        if self.refresh {
            self.waiting = Some(CommandId::SecurityVal);
            match self.role {
                Role::Coordinator => self.send(CommandId::KeyRefreshRequest, Vec::new()),
                Role::Device => self.send(CommandId::SecurityVal, local_e),
            }
            self.arm_status_timer();
            return Ok(());
        }

        match self.role {
            Role::Device => {
                self.waiting = Some(CommandId::SecurityVal);
                self.send(CommandId::SecurityVal, local_e);
                self.arm_status_timer();
            }
            Role::Coordinator => self.check_security_value(),
        }
        Ok(())
    }

    fn check_security_value(&mut self) {
        if self.state != State::KeyGen {
            return;
        }

        if self.keygen.expected_e != self.keygen.received_e {
            self.fail_run(ErrorCode::NoMatchKeyConfirm);
            return;
        }

        debug!("security value confirmed");
        match self.role {
            Role::Coordinator => {
                let local_e = self.keygen.local_e.to_vec();
                self.send(CommandId::SecurityVal, local_e);
            }
            Role::Device => self.send(CommandId::Success, Vec::new()),
        }
        self.waiting = Some(CommandId::Success);
        self.arm_status_timer();
    }

    fn finish_success(&mut self) -> SmResult<()> {
        let seed = self.ecc.shared_secret;
        let (ext_addr, short_addr) = self.seed_identity();
        // Staged on a copy; the table only changes once the key is installed.
        let mut seeds = self.seeds.clone();
        let result = if self.refresh {
            seeds.add(&ext_addr, short_addr, &seed)?
        } else {
            seeds.replace(&ext_addr, short_addr, &seed)?
        };
        let entry = seeds
            .get_by_ext(&ext_addr)
            .cloned()
            .ok_or(SmError::MissingSeedEntry)?;
        let new_key = result == AddResult::New;

        if self.role == Role::Device {
            self.storage.save_device_key_info(&DeviceKeyInfo {
                lookup_data: entry.lookup_data,
                device_key: self.keygen.device_key,
                seed_key: entry.seed_key,
                index: entry.index,
            })?;
        }
        self.key_table.add_device_key(&DeviceKeyEntry::new(
            &entry,
            &self.keygen.device_key,
            new_key,
            self.device.ext_addr,
        ))?;

        self.seeds = seeds;
        if self.role == Role::Coordinator {
            self.roster
                .record_success(&self.device, self.rx_on_idle, new_key, self.refresh);
        }

        info!(
            device = %self.device.ext_addr,
            index = entry.index,
            key_id = entry.key_id(),
            refresh = self.refresh,
            "commissioning succeeded"
        );

        self.waiting = None;
        self.clear_key_material();
        self.status = CommissioningStatus::Finished;
        self.attempts = 0;
        if self.role == Role::Coordinator {
            self.send(CommandId::Success, Vec::new());
        }
        self.callbacks.on_success(&self.device, self.refresh);
        self.switch_state(State::Entry);
        Ok(())
    }

    fn finish_fail(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.role == Role::Coordinator {
            self.roster.record_failure(&self.device.ext_addr, self.error_code);
        }

        self.timers.stop(TimerKind::Process);
        self.waiting = None;
        self.awaiting_passkey = false;
        self.fail_sent = false;
        self.clear_key_material();
        self.status = CommissioningStatus::NotStarted;

        let max = self.config.max_commissioning_attempts;
        let retry_allowed =
            !(self.refresh || self.error_code.is_authentication_failure() || self.attempts >= max);
        let report = FailureReport {
            device: self.device,
            rx_on_idle: self.rx_on_idle,
            refresh: self.refresh,
            error_code: self.error_code,
            attempts: self.attempts,
            retry_allowed,
            force_stopped: self.force_stopped,
        };
        if self.role == Role::Device && self.attempts >= max {
            self.attempts = 0;
        }

        info!(
            device = %self.device.ext_addr,
            error = %self.error_code,
            attempts = report.attempts,
            retry_allowed,
            "commissioning failed"
        );
        self.callbacks.on_failure(&report);
        self.switch_state(State::Entry);
    }

    fn sweep_key_refresh(&mut self) {
        if self.status != CommissioningStatus::InProgress {
            if let Some(entry) = self.roster.next_refresh() {
                let security = self.config.default_security;
                if let Err(e) = self.begin_key_refresh(
                    entry.device,
                    security,
                    Role::Coordinator,
                    entry.rx_on_idle,
                ) {
                    warn!(error = %e, device = %entry.device.ext_addr, "key refresh not started");
                }
            }
        }
        self.timers
            .start(TimerKind::KeyRefresh, self.config.key_refresh_period_ms);
    }
}
