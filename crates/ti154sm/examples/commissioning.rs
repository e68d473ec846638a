/// Commission a device over an in-memory link and refresh its key afterwards
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use ti154sm::sm::*;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Console {
    name: &'static str,
    passkey_pending: bool,
}

impl SmCallbacks for Console {
    fn request_passkey(&mut self, reason: PasskeyReason) {
        println!("[{}] passkey: {:?}", self.name, reason);
        self.passkey_pending = reason == PasskeyReason::EntryRequested;
    }

    fn on_success(&mut self, device: &DeviceDescriptor, refresh: bool) {
        println!(
            "[{}] {} with {} succeeded",
            self.name,
            if refresh { "key refresh" } else { "commissioning" },
            device.ext_addr
        );
    }

    fn on_failure(&mut self, report: &FailureReport) {
        println!(
            "[{}] failed with {}: {} (retry allowed: {})",
            self.name, report.device.ext_addr, report.error_code, report.retry_allowed
        );
    }
}

struct Node {
    ctx: CommissioningContext,
    descriptor: DeviceDescriptor,
    transport: Rc<RefCell<MemoryTransport>>,
    key_table: Rc<RefCell<MemoryKeyTable>>,
    console: Rc<RefCell<Console>>,
}

impl Node {
    fn new(name: &'static str, ext_addr: ExtAddr, short_addr: u16) -> SmResult<Self> {
        let transport = Rc::new(RefCell::new(MemoryTransport::new()));
        let key_table = Rc::new(RefCell::new(MemoryKeyTable::new()));
        let console = Rc::new(RefCell::new(Console {
            name,
            ..Console::default()
        }));
        let services = SmServices::software(
            Box::new(transport.clone()),
            Box::new(ManualTimer::new()),
            Box::new(key_table.clone()),
            Box::new(MemoryKeyStorage::new()),
            Box::new(console.clone()),
        );

        Ok(Self {
            ctx: CommissioningContext::new(SmConfig::new(ext_addr, short_addr), services)?,
            descriptor: DeviceDescriptor::new(0xACDC, short_addr, ext_addr),
            transport,
            key_table,
            console,
        })
    }
}

/// Carry frames both ways until the link goes quiet
fn run_link(coordinator: &mut Node, device: &mut Node, passkey: u32) -> SmResult<()> {
    let mut air = VecDeque::new();
    loop {
        air.extend(coordinator.transport.borrow_mut().take_sent().into_iter().map(|r| (true, r)));
        air.extend(device.transport.borrow_mut().take_sent().into_iter().map(|r| (false, r)));

        if let Some((from_coordinator, request)) = air.pop_front() {
            let (from, to) = if from_coordinator {
                (&mut *coordinator, &mut *device)
            } else {
                (&mut *device, &mut *coordinator)
            };
            let source = Address::Short(from.descriptor.short_addr);
            match to.ctx.on_message_received(source, &request.payload)? {
                Dispatch::StartRequested { refresh: false } => to.ctx.start_commissioning(
                    from.descriptor,
                    SecurityDescriptor::default(),
                    Role::Device,
                    true,
                    AuthMethods::all(),
                )?,
                Dispatch::StartRequested { refresh: true } => to.ctx.start_key_refresh(
                    from.descriptor,
                    SecurityDescriptor::default(),
                    Role::Device,
                    true,
                )?,
                _ => {}
            }
            from.ctx.on_send_feedback(request.msdu_handle, true)?;
            continue;
        }

        let mut typed = false;
        for node in [&mut *coordinator, &mut *device] {
            let pending = std::mem::take(&mut node.console.borrow_mut().passkey_pending);
            if pending {
                node.ctx.set_passkey(passkey)?;
                typed = true;
            }
        }
        if !typed {
            return Ok(());
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut coordinator = Node::new(
        "coordinator",
        ExtAddr::new([0x00, 0x12, 0x4B, 0x00, 0x11, 0x22, 0x33, 0x44]),
        0x0000,
    )?;
    let mut device = Node::new(
        "device",
        ExtAddr::new([0x00, 0x12, 0x4B, 0x00, 0x55, 0x66, 0x77, 0x88]),
        0x0001,
    )?;

    println!("Commissioning");
    println!("-------------");
    coordinator.ctx.start_commissioning(
        device.descriptor,
        SecurityDescriptor::default(),
        Role::Coordinator,
        true,
        AuthMethods::all(),
    )?;
    run_link(&mut coordinator, &mut device, 0x2468A)?;

    println!("\nKey refresh");
    println!("-----------");
    coordinator.ctx.start_key_refresh(
        device.descriptor,
        SecurityDescriptor::default(),
        Role::Coordinator,
        true,
    )?;
    run_link(&mut coordinator, &mut device, 0x2468A)?;

    for (name, node) in [("coordinator", &coordinator), ("device", &device)] {
        if let Some(entry) = node.key_table.borrow().get(1) {
            println!("{} key slot 1: {}", name, hex::encode(entry.key));
        }
    }
    Ok(())
}
