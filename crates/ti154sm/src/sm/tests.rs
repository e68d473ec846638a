//! End-to-end tests: a coordinator and a device context talking through
//! in-memory transports.

use super::constants::*;
use super::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

const PAN_ID: u16 = 0xACDC;
const COORDINATOR_SHORT: u16 = 0x0000;
const DEVICE_SHORT: u16 = 0x0001;

fn coordinator_ext() -> ExtAddr {
    ExtAddr::new([0x00, 0x12, 0x4B, 0x00, 0x11, 0x22, 0x33, 0x44])
}

fn device_ext() -> ExtAddr {
    ExtAddr::new([0x00, 0x12, 0x4B, 0x00, 0x55, 0x66, 0x77, 0x88])
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct Recorder {
    passkey_requests: Vec<PasskeyReason>,
    successes: Vec<(DeviceDescriptor, bool)>,
    failures: Vec<FailureReport>,
}

impl SmCallbacks for Recorder {
    fn request_passkey(&mut self, reason: PasskeyReason) {
        self.passkey_requests.push(reason);
    }

    fn on_success(&mut self, device: &DeviceDescriptor, refresh: bool) {
        self.successes.push((*device, refresh));
    }

    fn on_failure(&mut self, report: &FailureReport) {
        self.failures.push(report.clone());
    }
}

struct Party {
    ctx: CommissioningContext,
    role: Role,
    /// How the other side addresses this party
    descriptor: DeviceDescriptor,
    methods: AuthMethods,
    /// Passkey the user types in, if any
    passkey: Option<u32>,
    /// Device answers commissioning and refresh requests by itself
    auto_start: bool,
    transport: Rc<RefCell<MemoryTransport>>,
    timer: Rc<RefCell<ManualTimer>>,
    key_table: Rc<RefCell<MemoryKeyTable>>,
    storage: Rc<RefCell<MemoryKeyStorage>>,
    recorder: Rc<RefCell<Recorder>>,
    errors: Vec<SmError>,
}

impl Party {
    fn new(role: Role, seed: u64) -> Self {
        Self::with_storage(role, seed, Rc::new(RefCell::new(MemoryKeyStorage::new())))
    }

    fn with_storage(role: Role, seed: u64, storage: Rc<RefCell<MemoryKeyStorage>>) -> Self {
        let (ext_addr, short_addr) = match role {
            Role::Coordinator => (coordinator_ext(), COORDINATOR_SHORT),
            Role::Device => (device_ext(), DEVICE_SHORT),
        };
        let config = SmConfig::new(ext_addr, short_addr);
        let transport = Rc::new(RefCell::new(MemoryTransport::new()));
        let timer = Rc::new(RefCell::new(ManualTimer::new()));
        let key_table = Rc::new(RefCell::new(MemoryKeyTable::new()));
        let recorder = Rc::new(RefCell::new(Recorder::default()));

        let services = SmServices {
            crypto: Box::new(SoftwareCrypto::with_rng(StdRng::seed_from_u64(seed))),
            transport: Box::new(transport.clone()),
            timers: Box::new(timer.clone()),
            key_table: Box::new(key_table.clone()),
            storage: Box::new(storage.clone()),
            callbacks: Box::new(recorder.clone()),
        };

        Self {
            ctx: CommissioningContext::new(config, services).unwrap(),
            role,
            descriptor: DeviceDescriptor::new(PAN_ID, short_addr, ext_addr),
            methods: AuthMethods::all(),
            passkey: Some(0x12345),
            auto_start: true,
            transport,
            timer,
            key_table,
            storage,
            recorder,
            errors: Vec::new(),
        }
    }

    fn source(&self) -> Address {
        Address::Short(self.descriptor.short_addr)
    }

    fn key(&self, index: u8) -> Option<[u8; SM_KEY_LEN]> {
        self.key_table.borrow().get(index).map(|entry| entry.key)
    }

    fn successes(&self) -> usize {
        self.recorder.borrow().successes.len()
    }

    fn failures(&self) -> Vec<FailureReport> {
        self.recorder.borrow().failures.clone()
    }

    fn expire_process_timer(&mut self) {
        assert!(self.timer.borrow_mut().expire(TimerKind::Process));
        self.ctx.on_timer_fired(TimerKind::Process).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Coordinator,
    Device,
}

fn deliver(from: &mut Party, to: &mut Party, request: &DataRequest) {
    match to.ctx.on_message_received(from.source(), &request.payload) {
        Ok(Dispatch::StartRequested { refresh }) if to.role == Role::Device && to.auto_start => {
            let peer = from.descriptor;
            let security = SecurityDescriptor::default();
            let started = if refresh {
                to.ctx.start_key_refresh(peer, security, Role::Device, true)
            } else {
                to.ctx
                    .start_commissioning(peer, security, Role::Device, true, to.methods)
            };
            if let Err(e) = started {
                to.errors.push(e);
            }
        }
        Ok(_) => {}
        Err(e) => to.errors.push(e),
    }
    from.ctx.on_send_feedback(request.msdu_handle, true).unwrap();
}

struct Harness {
    coord: Party,
    device: Party,
    air: VecDeque<(Side, DataRequest)>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        Self {
            coord: Party::new(Role::Coordinator, 1),
            device: Party::new(Role::Device, 2),
            air: VecDeque::new(),
        }
    }

    fn start(&mut self) {
        let device = self.device.descriptor;
        let methods = self.coord.methods;
        self.coord
            .ctx
            .start_commissioning(device, SecurityDescriptor::default(), Role::Coordinator, true, methods)
            .unwrap();
    }

    fn collect(&mut self) {
        let sent = self.coord.transport.borrow_mut().take_sent();
        self.air
            .extend(sent.into_iter().map(|request| (Side::Coordinator, request)));
        let sent = self.device.transport.borrow_mut().take_sent();
        self.air
            .extend(sent.into_iter().map(|request| (Side::Device, request)));
    }

    /// Frames currently on the air, oldest first
    fn in_flight(&mut self) -> Vec<(Side, CommandId)> {
        self.collect();
        self.air
            .iter()
            .map(|(side, request)| (*side, SmMessage::parse(&request.payload).unwrap().command))
            .collect()
    }

    fn drop_frames(&mut self) {
        self.collect();
        self.air.clear();
    }

    /// Deliver one frame or one passkey entry; `false` once nothing moves
    fn step(&mut self) -> bool {
        self.collect();
        if let Some((side, request)) = self.air.pop_front() {
            match side {
                Side::Coordinator => deliver(&mut self.coord, &mut self.device, &request),
                Side::Device => deliver(&mut self.device, &mut self.coord, &request),
            }
            return true;
        }

        for party in [&mut self.coord, &mut self.device] {
            if party.ctx.is_awaiting_passkey() {
                if let Some(passkey) = party.passkey {
                    party.ctx.set_passkey(passkey).unwrap();
                    return true;
                }
            }
        }
        false
    }

    fn run(&mut self) {
        let mut budget = 1000;
        while self.step() {
            budget -= 1;
            assert!(budget > 0, "handshake did not settle");
        }
    }

    fn run_until(&mut self, done: impl Fn(&Harness) -> bool) {
        let mut budget = 1000;
        while !done(self) {
            assert!(self.step(), "ran out of work before reaching the target");
            budget -= 1;
            assert!(budget > 0, "handshake did not settle");
        }
    }

    fn commission(&mut self) {
        self.start();
        self.run();
        assert_eq!(self.coord.ctx.status(), CommissioningStatus::Finished);
        assert_eq!(self.device.ctx.status(), CommissioningStatus::Finished);
    }

    fn assert_keys_match(&self, index: u8) -> [u8; SM_KEY_LEN] {
        let coord_key = self.coord.key(index).expect("coordinator key installed");
        let device_key = self.device.key(index).expect("device key installed");
        assert_eq!(coord_key, device_key);
        coord_key
    }
}

#[test]
fn test_passkey_commissioning() {
    let mut h = Harness::new();
    h.commission();

    assert_eq!(h.coord.ctx.auth_method(), Some(AuthMethod::Passkey));
    assert_eq!(h.coord.successes(), 1);
    assert_eq!(h.device.successes(), 1);
    assert!(h.coord.failures().is_empty());
    assert!(h.device.failures().is_empty());
    assert_eq!(h.coord.ctx.state(), State::Entry);
    assert_eq!(h.device.ctx.state(), State::Entry);
    assert!(h.coord.errors.is_empty() && h.device.errors.is_empty());

    h.assert_keys_match(1);
    assert_eq!(
        h.coord.recorder.borrow().passkey_requests,
        vec![PasskeyReason::EntryRequested, PasskeyReason::Entered]
    );

    let coord_seed = h.coord.ctx.seeds().get(&device_ext(), DEVICE_SHORT).unwrap();
    let device_seed = h.device.ctx.seeds().get(&device_ext(), DEVICE_SHORT).unwrap();
    assert_eq!(coord_seed.lookup_data, device_seed.lookup_data);
    assert_eq!(coord_seed.key_id(), 1);
    assert_eq!(coord_seed.index, 1);

    let entry = h.coord.key_table.borrow().get(1).cloned().unwrap();
    assert!(entry.new_key);
    assert_eq!(entry.frame_counter, 0);
    assert_eq!(entry.peer_ext_addr, device_ext());
    assert_eq!(entry.lookup_data[8], DEVICE_SHORT as u8);

    let stored = h.device.storage.borrow().stored().cloned().unwrap();
    assert_eq!(stored.index, 1);
    assert_eq!(stored.lookup_data, device_seed.lookup_data);
    assert_eq!(Some(stored.device_key), h.device.key(1));

    let roster = h.coord.ctx.roster().get(&device_ext()).unwrap();
    assert_eq!(roster.refresh_status, RefreshStatus::Required);
}

#[test]
fn test_fixed_code_methods() {
    for method in [AuthMethods::DEFAULT_CODE, AuthMethods::JUST_ALLOWED] {
        let mut h = Harness::new();
        h.coord.methods = method;
        h.device.methods = method;
        h.coord.passkey = None;
        h.device.passkey = None;
        h.commission();

        assert_eq!(h.coord.ctx.auth_method(), method.negotiate(method));
        assert_eq!(h.coord.successes(), 1);
        assert_eq!(h.device.successes(), 1);
        assert!(h.coord.recorder.borrow().passkey_requests.iter().all(|r| *r == PasskeyReason::Entered));
        h.assert_keys_match(1);
    }
}

#[test]
fn test_negotiates_common_method() {
    let mut h = Harness::new();
    h.coord.methods = AuthMethods::DEFAULT_CODE | AuthMethods::JUST_ALLOWED;
    h.device.methods = AuthMethods::PASSKEY | AuthMethods::JUST_ALLOWED;
    h.commission();

    assert_eq!(h.coord.ctx.auth_method(), Some(AuthMethod::JustAllowed));
    assert_eq!(h.device.ctx.auth_method(), Some(AuthMethod::JustAllowed));
    h.assert_keys_match(1);
}

#[test]
fn test_no_common_method() {
    let mut h = Harness::new();
    h.coord.methods = AuthMethods::JUST_ALLOWED;
    h.device.methods = AuthMethods::PASSKEY;
    h.start();
    h.run();

    let device_failure = h.device.failures().pop().unwrap();
    assert_eq!(device_failure.error_code, ErrorCode::UnsupportedAuthMethod);
    assert!(!device_failure.retry_allowed);
    assert_eq!(h.device.ctx.foreign_methods(), AuthMethods::JUST_ALLOWED);

    let coord_failure = h.coord.failures().pop().unwrap();
    assert_eq!(coord_failure.error_code, ErrorCode::UnsupportedAuthMethod);
    assert!(h.coord.ctx.seeds().is_empty());
    assert!(h.coord.key_table.borrow().is_empty());
}

#[test]
fn test_wrong_passkey() {
    let mut h = Harness::new();
    h.device.passkey = Some(0x12346);
    h.start();
    h.run();

    for party in [&h.coord, &h.device] {
        let failures = party.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_code, ErrorCode::NoMatchAuthVal);
        assert!(!failures[0].retry_allowed);
        assert!(party.ctx.seeds().is_empty());
        assert!(party.key_table.borrow().is_empty());
        assert_eq!(party.ctx.status(), CommissioningStatus::NotStarted);
    }
}

#[test]
fn test_timeout_from_start() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.coord.ctx.state(), State::Start);
    assert_eq!(h.in_flight(), vec![(Side::Coordinator, CommandId::ProcessRequest)]);
    h.drop_frames();

    h.coord.expire_process_timer();
    assert_eq!(h.in_flight(), vec![(Side::Coordinator, CommandId::Fail)]);
    assert!(h.coord.failures().is_empty());
    h.drop_frames();

    h.coord.expire_process_timer();
    let failures = h.coord.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code, ErrorCode::Timeout);
    assert!(failures[0].retry_allowed);
    assert_eq!(failures[0].attempts, 1);
    assert_eq!(h.coord.ctx.state(), State::Entry);
    assert!(h.coord.ctx.seeds().is_empty());
    assert!(h.coord.key_table.borrow().is_empty());
}

#[test]
fn test_passkey_entry_timeout() {
    let mut h = Harness::new();
    h.device.passkey = None;
    h.start();
    h.run();
    assert!(h.device.ctx.is_awaiting_passkey());

    h.device.expire_process_timer();
    assert!(h
        .device
        .recorder
        .borrow()
        .passkey_requests
        .contains(&PasskeyReason::TimedOut));
    h.run();

    assert_eq!(h.device.failures()[0].error_code, ErrorCode::Timeout);
    assert_eq!(h.coord.failures()[0].error_code, ErrorCode::Timeout);
}

#[test]
fn test_stop_from_every_state() {
    let targets = [
        State::Start,
        State::AuthMethod,
        State::Passkey,
        State::KeyExchange,
        State::Authentication,
        State::KeyGen,
    ];

    for target in targets {
        let mut h = Harness::new();
        if target == State::Passkey {
            h.coord.passkey = None;
        }
        h.start();
        h.run_until(|h| h.coord.ctx.state() == target);
        if target == State::Passkey {
            assert!(h.coord.ctx.is_awaiting_passkey());
        }

        h.coord.ctx.stop_commissioning().unwrap();
        assert_eq!(h.coord.ctx.state(), State::Entry, "stopped in {}", target);
        assert_eq!(h.coord.ctx.status(), CommissioningStatus::NotStarted);

        let failures = h.coord.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].force_stopped);
        assert!(!failures[0].retry_allowed);
        assert!(h.coord.ctx.seeds().is_empty());
        assert!(!h.coord.timer.borrow().is_active(TimerKind::Process));
    }
}

#[test]
fn test_stop_while_idle() {
    let mut h = Harness::new();
    h.coord.ctx.stop_commissioning().unwrap();
    assert_eq!(h.coord.ctx.state(), State::Entry);
    assert!(h.coord.failures().is_empty());
    assert!(h.in_flight().is_empty());
}

#[test]
fn test_start_while_running() {
    let mut h = Harness::new();
    h.start();
    let device = h.device.descriptor;
    let err = h
        .coord
        .ctx
        .start_commissioning(
            device,
            SecurityDescriptor::default(),
            Role::Coordinator,
            true,
            AuthMethods::all(),
        )
        .unwrap_err();
    assert!(matches!(err, SmError::InProgress));
    assert_eq!(h.coord.ctx.state(), State::Start);
}

#[test]
fn test_key_refresh() {
    let mut h = Harness::new();
    h.commission();
    let initial_key = h.assert_keys_match(1);

    let device = h.device.descriptor;
    h.coord
        .ctx
        .start_key_refresh(device, SecurityDescriptor::default(), Role::Coordinator, true)
        .unwrap();
    assert_eq!(h.coord.ctx.state(), State::KeyGen);
    assert_eq!(h.in_flight(), vec![(Side::Coordinator, CommandId::KeyRefreshRequest)]);
    h.run();

    assert_eq!(h.coord.successes(), 2);
    assert_eq!(h.device.successes(), 2);
    assert_eq!(h.coord.recorder.borrow().successes[1], (device, true));
    assert!(h.coord.failures().is_empty() && h.device.failures().is_empty());

    let refreshed_key = h.assert_keys_match(1);
    assert_ne!(initial_key, refreshed_key);

    let coord_seed = h.coord.ctx.seeds().get(&device_ext(), DEVICE_SHORT).unwrap();
    let device_seed = h.device.ctx.seeds().get(&device_ext(), DEVICE_SHORT).unwrap();
    assert_eq!(coord_seed.key_id(), 2);
    assert_eq!(coord_seed.lookup_data, device_seed.lookup_data);
    assert!(!h.coord.key_table.borrow().get(1).unwrap().new_key);
    assert_eq!(h.device.storage.borrow().stored().unwrap().lookup_data[7], 2);
}

#[test]
fn test_key_refresh_without_seed() {
    let mut h = Harness::new();
    let device = h.device.descriptor;
    let err = h
        .coord
        .ctx
        .start_key_refresh(device, SecurityDescriptor::default(), Role::Coordinator, true)
        .unwrap_err();
    assert!(matches!(err, SmError::MissingSeedEntry));

    let failures = h.coord.failures();
    assert_eq!(failures[0].error_code, ErrorCode::MissingKey);
    assert!(failures[0].refresh);
    assert!(!failures[0].retry_allowed);
    assert_eq!(h.coord.ctx.state(), State::Entry);
    assert!(h.in_flight().is_empty());
}

#[test]
fn test_retries_exhausted_on_request() {
    let mut h = Harness::new();
    h.coord.transport.borrow_mut().reject_all = true;
    h.start();

    let failures = h.coord.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code, ErrorCode::PeerUnresponsive);
    assert_eq!(h.coord.ctx.state(), State::Entry);
    assert!(h.in_flight().is_empty());
}

#[test]
fn test_transient_rejections_are_retried() {
    let mut h = Harness::new();
    h.coord.transport.borrow_mut().reject_next = 2;
    h.device.transport.borrow_mut().reject_next = 3;
    h.commission();
    h.assert_keys_match(1);
}

#[test]
fn test_failed_confirmation_resends() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.in_flight().len(), 1);

    h.coord.ctx.on_send_feedback(SM_DATA_MSDU_HANDLE, false).unwrap();
    assert_eq!(
        h.in_flight(),
        vec![
            (Side::Coordinator, CommandId::ProcessRequest),
            (Side::Coordinator, CommandId::ProcessRequest)
        ]
    );
    assert!(h.coord.timer.borrow().is_active(TimerKind::Process));
}

#[test]
fn test_receive_guard() {
    let mut h = Harness::new();
    h.start();
    h.drop_frames();
    let response = SmMessage::new(CommandId::ProcessResponse, vec![AuthMethods::all().bits()]);
    let frame = response.serialize();

    let stranger = Address::Short(0x0BAD);
    assert_eq!(h.coord.ctx.on_message_received(stranger, &frame).unwrap(), Dispatch::Ignored);

    let early = SmMessage::new(CommandId::PublicKey, vec![0x04; SM_ECC_PUBLIC_KEY_LEN]);
    let source = h.device.source();
    assert_eq!(
        h.coord.ctx.on_message_received(source, &early.serialize()).unwrap(),
        Dispatch::Ignored
    );
    assert_eq!(h.coord.ctx.state(), State::Start);
    assert_eq!(h.coord.ctx.awaiting(), Some(CommandId::ProcessResponse));

    let short = SmMessage::new(CommandId::ProcessResponse, Vec::new());
    assert!(h.coord.ctx.on_message_received(source, &short.serialize()).is_err());
    assert!(h.coord.timer.borrow().is_active(TimerKind::Process));

    let by_ext = Address::Extended(device_ext());
    assert_eq!(h.coord.ctx.on_message_received(by_ext, &frame).unwrap(), Dispatch::Handled);
    assert_eq!(h.coord.ctx.state(), State::AuthMethod);
}

#[test]
fn test_invalid_public_key_fails_both_sides() {
    let mut h = Harness::new();
    h.start();
    h.run_until(|h| h.coord.ctx.awaiting() == Some(CommandId::PublicKey));
    h.drop_frames();

    let off_curve = SmMessage::new(CommandId::PublicKey, vec![0x04; SM_ECC_PUBLIC_KEY_LEN]);
    let source = h.device.source();
    let result = h.coord.ctx.on_message_received(source, &off_curve.serialize());
    assert!(matches!(result, Err(SmError::Crypto(_))));
    assert_eq!(h.in_flight(), vec![(Side::Coordinator, CommandId::Fail)]);

    h.run();
    for party in [&h.coord, &h.device] {
        let failures = party.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_code, ErrorCode::UnexpectedMessage);
        assert!(party.ctx.seeds().is_empty());
        assert!(party.key_table.borrow().is_empty());
        assert_eq!(party.ctx.state(), State::Entry);
    }
}

#[test]
fn test_storage_failure_leaves_tables_untouched() {
    let mut h = Harness::new();
    h.device.storage.borrow_mut().fail_saves = true;
    h.start();
    h.run();

    let failures = h.device.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code, ErrorCode::MissingKey);
    assert_eq!(h.device.successes(), 0);
    assert!(h.device.ctx.seeds().is_empty());
    assert!(h.device.key_table.borrow().is_empty());
    assert!(h.device.storage.borrow().stored().is_none());
    assert_eq!(h.device.ctx.status(), CommissioningStatus::NotStarted);
}

#[test]
fn test_empty_fail_ends_run() {
    let mut h = Harness::new();
    h.start();
    h.drop_frames();

    let fail = SmMessage::new(CommandId::Fail, Vec::new());
    let source = h.device.source();
    assert_eq!(
        h.coord.ctx.on_message_received(source, &fail.serialize()).unwrap(),
        Dispatch::Handled
    );
    assert_eq!(h.coord.ctx.state(), State::Entry);
    let failures = h.coord.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code, ErrorCode::Other(0));
}

#[test]
fn test_idle_device_reports_requests() {
    let mut h = Harness::new();
    let request = SmMessage::new(CommandId::ProcessRequest, h.device.descriptor.serialize());
    let refresh = SmMessage::new(CommandId::KeyRefreshRequest, Vec::new());
    let source = h.coord.source();

    assert_eq!(
        h.device.ctx.on_message_received(source, &request.serialize()).unwrap(),
        Dispatch::StartRequested { refresh: false }
    );
    assert_eq!(
        h.device.ctx.on_message_received(source, &refresh.serialize()).unwrap(),
        Dispatch::StartRequested { refresh: true }
    );
    let success = SmMessage::new(CommandId::Success, Vec::new());
    assert_eq!(
        h.device.ctx.on_message_received(source, &success.serialize()).unwrap(),
        Dispatch::Ignored
    );
}

#[test]
fn test_passkey_rejected_when_not_requested() {
    let mut h = Harness::new();
    assert!(h.coord.ctx.set_passkey(1234).is_err());

    h.start();
    assert!(h.coord.ctx.set_passkey(1234).is_err());
}

#[test]
fn test_src_device_security() {
    let mut h = Harness::new();
    let default = h.coord.ctx.src_device_security(&device_ext(), DEVICE_SHORT);
    assert_eq!(default, h.coord.ctx.config().default_security);

    h.commission();
    let security = h.coord.ctx.src_device_security(&device_ext(), DEVICE_SHORT);
    let seed = h.coord.ctx.seeds().get(&device_ext(), DEVICE_SHORT).unwrap();
    assert_eq!(security.key_source, seed.lookup_data);
    assert_eq!(security.security_level, SM_SEC_LEVEL_ENC_MIC_32);
    assert_eq!(security.key_id_mode, SM_KEY_ID_MODE_8);
    assert_eq!(security.key_index, DEVICE_SHORT as u8);
}

#[test]
fn test_device_recovers_stored_key() {
    let mut h = Harness::new();
    h.commission();
    let key = h.assert_keys_match(1);

    let mut rebooted = Party::with_storage(Role::Device, 3, h.device.storage.clone());
    assert!(rebooted.ctx.recover_key_info(coordinator_ext()).unwrap());
    assert_eq!(rebooted.key(1), Some(key));
    let entry = rebooted.key_table.borrow().get(1).cloned().unwrap();
    assert!(entry.new_key);
    assert_eq!(entry.peer_ext_addr, coordinator_ext());
    assert!(rebooted.ctx.seeds().get(&device_ext(), DEVICE_SHORT).is_some());

    let mut fresh = Party::new(Role::Device, 4);
    assert!(!fresh.ctx.recover_key_info(coordinator_ext()).unwrap());
    assert!(fresh.key_table.borrow().is_empty());
}

#[test]
fn test_key_refresh_sweep() {
    let mut h = Harness::new();
    h.commission();

    h.coord.ctx.start_key_refresh_sweep();
    let period = h.coord.ctx.config().key_refresh_period_ms;
    assert_eq!(h.coord.timer.borrow().armed(TimerKind::KeyRefresh), Some(period));

    assert!(h.coord.timer.borrow_mut().expire(TimerKind::KeyRefresh));
    h.coord.ctx.on_timer_fired(TimerKind::KeyRefresh).unwrap();
    assert!(h.coord.timer.borrow().is_active(TimerKind::KeyRefresh));
    h.run();

    assert_eq!(h.coord.recorder.borrow().successes.last(), Some(&(h.device.descriptor, true)));
    let entry = h.coord.ctx.roster().get(&device_ext()).unwrap();
    assert_eq!(entry.refresh_status, RefreshStatus::Attempted);
    assert_eq!(entry.refresh_count, 1);

    // Nothing left to refresh: the cycle restarts without a run
    assert!(h.coord.timer.borrow_mut().expire(TimerKind::KeyRefresh));
    h.coord.ctx.on_timer_fired(TimerKind::KeyRefresh).unwrap();
    assert!(h.in_flight().is_empty());
    assert_eq!(
        h.coord.ctx.roster().get(&device_ext()).unwrap().refresh_status,
        RefreshStatus::Required
    );
}

#[test]
fn test_key_recovery() {
    let mut h = Harness::new();
    h.commission();
    let methods = h.coord.methods;
    assert!(h.coord.ctx.roster_mut().require_recommission(&device_ext()));

    let status = h
        .coord
        .ctx
        .poll_key_recovery(SecurityDescriptor::default(), methods)
        .unwrap();
    assert_eq!(status, RecoveryStatus::Started(h.device.descriptor));
    assert_eq!(
        h.coord
            .ctx
            .poll_key_recovery(SecurityDescriptor::default(), methods)
            .unwrap(),
        RecoveryStatus::Busy
    );
    h.run();

    assert_eq!(h.coord.successes(), 2);
    let entry = h.coord.ctx.roster().get(&device_ext()).unwrap();
    assert_eq!(entry.recommission, RecommissionStatus::NotRequired);
    // Recommissioning restarts the lookup data
    assert_eq!(h.coord.ctx.seeds().get_by_ext(&device_ext()).unwrap().key_id(), 1);
    h.assert_keys_match(1);

    assert_eq!(
        h.coord
            .ctx
            .poll_key_recovery(SecurityDescriptor::default(), methods)
            .unwrap(),
        RecoveryStatus::Complete
    );
}

#[test]
fn test_remove_device() {
    let mut h = Harness::new();
    h.commission();
    assert!(h.coord.ctx.remove_device(&device_ext()));
    assert!(h.coord.ctx.seeds().is_empty());
    assert!(h.coord.ctx.roster().is_empty());
    assert!(!h.coord.ctx.remove_device(&device_ext()));
}
