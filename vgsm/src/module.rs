//! The lifecycle of one GSM module.
//!
//! A module walks through [`ModuleStatus`] driven by its own timer, by the
//! answers to the commands it sends and by URCs. Every status change goes
//! through [`Module::set_status`], which keeps the timer, the log and the
//! management events in step.
//!
//! The module lock only guards plain data. It is never held while waiting
//! for the modem: the channel is cloned out first.

mod calls;
mod cause;
mod init;
mod network;
mod sim;
mod status;
mod urc_handlers;

use std::{
	fmt::{self, Display},
	io,
	sync::{Arc, Mutex, MutexGuard, Weak, atomic::{AtomicBool, Ordering}},
	thread::{self, JoinHandle},
	time::Duration,
};

use log::{debug, info, warn};

use crate::{
	comm::{Comm, Request, RequestHandle, ResponseCode, Urc},
	config::{ModuleConfig, Timing, is_pin},
	device::{Device, PowerState},
	event::{Event, EventSink},
	timer::{Timer, TimerSet},
};

pub use self::{
	calls::{Bearer, CallEvent, CallSlot, CallSlots, CallState, Direction, MAX_CALLS},
	cause::{CAUSE_NORMAL_CLEARING, ReleaseCause},
	network::{NetworkInfo, Registration},
	sim::{MIN_PIN_ATTEMPTS, PinState, SimInfo},
	status::ModuleStatus,
};

/// Consecutive failures after which the module is power cycled instead of
/// just reopened.
pub const MAX_FAILURE_ATTEMPTS: u32 = 3;

/// Ignitions before a module that does not power on is given up on.
pub const MAX_POWER_ATTEMPTS: u32 = 3;

/// Statuses the module rests in after initialization. A dead channel in one
/// of them is only noticed through a failed request.
const SETTLED: &[ModuleStatus] = &[
	ModuleStatus::Ready,
	ModuleStatus::Offline,
	ModuleStatus::WaitingPin,
	ModuleStatus::WaitingSim,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
	pub vendor: Option<String>,
	pub model: Option<String>,
	pub revision: Option<String>,
	pub imei: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleState {
	pub status: ModuleStatus,
	pub reason: String,
	pub failure_attempts: u32,
	pub power_attempts: u32,
	pub info: ModuleInfo,
	pub sim: SimInfo,
	pub network: NetworkInfo,
	pub calls: CallSlots,
	/// The slot whose call a PBX channel owns.
	pub active_call: Option<usize>,
	pub caller_id: Option<String>,
	pub rejected_calls: u32,
	pub pin: Option<String>,
	pub service_enabled: bool,
}

impl ModuleState {
	fn new(config: &ModuleConfig) -> Self {
		Self {
			status: ModuleStatus::Unconfigured,
			reason: String::new(),
			failure_attempts: 0,
			power_attempts: 0,
			info: ModuleInfo::default(),
			sim: SimInfo::default(),
			network: NetworkInfo::default(),
			calls: CallSlots::default(),
			active_call: None,
			caller_id: None,
			rejected_calls: 0,
			pin: config.pin.clone(),
			service_enabled: config.service_enabled,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
	NotAllowed(ModuleStatus),
	NoChannel,
	InvalidArgument(String),
	Rejected(ResponseCode),
}

impl Display for ModuleError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ModuleError::NotAllowed(status) => write!(f, "not possible while {status}"),
			ModuleError::NoChannel => f.write_str("module is not open"),
			ModuleError::InvalidArgument(argument) => write!(f, "invalid argument `{argument}`"),
			ModuleError::Rejected(code) => write!(f, "module answered {code}"),
		}
	}
}

impl std::error::Error for ModuleError {}

/// Handle to a module, cheap to clone.
#[derive(Clone)]
pub struct Module {
	inner: Arc<ModuleInner>,
}

struct ModuleInner {
	name: String,
	config: ModuleConfig,
	device: Arc<dyn Device>,
	events: Arc<dyn EventSink>,
	timers: TimerSet,
	timer: Timer,
	state: Mutex<ModuleState>,
	status_lock: Mutex<()>,
	comm: Mutex<Option<Arc<Comm>>>,
	running: Arc<AtomicBool>,
	monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Module {
	pub fn new(config: ModuleConfig, device: Arc<dyn Device>, events: Arc<dyn EventSink>) -> Self {
		let timers = TimerSet::new();
		
		let inner = Arc::new_cyclic(|weak: &Weak<ModuleInner>| {
			let weak = weak.clone();
			let timer = timers.timer(&config.name, move || {
				if let Some(inner) = weak.upgrade() {
					Module { inner }.timer_expired();
				}
			});
			
			ModuleInner {
				name: config.name.clone(),
				state: Mutex::new(ModuleState::new(&config)),
				config,
				device,
				events,
				timers,
				timer,
				status_lock: Mutex::new(()),
				comm: Mutex::new(None),
				running: Arc::new(AtomicBool::new(false)),
				monitor: Mutex::new(None),
			}
		});
		
		Self { inner }
	}
	
	pub fn name(&self) -> &str {
		&self.inner.name
	}
	
	pub fn config(&self) -> &ModuleConfig {
		&self.inner.config
	}
	
	pub fn device(&self) -> &dyn Device {
		self.inner.device.as_ref()
	}
	
	pub fn status(&self) -> ModuleStatus {
		self.lock().status
	}
	
	pub fn reason(&self) -> String {
		self.lock().reason.clone()
	}
	
	/// A copy of everything known about the module.
	pub fn snapshot(&self) -> ModuleState {
		self.lock().clone()
	}
	
	pub fn comm(&self) -> Option<Arc<Comm>> {
		self.inner.comm.lock()
			.expect("module lock poisoned")
			.clone()
	}
	
	/// Spawns the monitor thread and moves the module out of
	/// `UNCONFIGURED`.
	pub fn start(&self) -> io::Result<()> {
		if self.inner.running.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		
		let timers = self.inner.timers.clone();
		let running = self.inner.running.clone();
		let name = self.name().to_owned();
		
		let monitor = thread::Builder::new()
			.name(format!("<{name}>"))
			.spawn(move || {
				debug!("{name}: monitor running");
				
				while running.load(Ordering::SeqCst) {
					timers.run();
					timers.wait(None);
				}
				
				debug!("{name}: monitor finished");
			})?;
		
		*self.inner.monitor.lock().expect("module lock poisoned") = Some(monitor);
		
		self.set_status(ModuleStatus::Closed, Some(Duration::ZERO), "configured");
		Ok(())
	}
	
	/// Stops the monitor thread and closes the channel.
	pub fn stop(&self) {
		self.inner.running.store(false, Ordering::SeqCst);
		self.close_comm();
		
		let monitor = self.inner.monitor.lock()
			.expect("module lock poisoned")
			.take();
		
		if let Some(monitor) = monitor {
			self.inner.timers.wake();
			
			if monitor.thread().id() != thread::current().id() {
				let _ = monitor.join();
			}
		}
		
		self.set_status(ModuleStatus::Closed, None, "stopped");
	}
	
	/// The only way the status changes. Replaces the reason, arms the timer
	/// for `timeout` (or stops it) and emits an event if the status is new.
	pub fn set_status(&self, status: ModuleStatus, timeout: Option<Duration>, reason: impl Display) {
		self.transition(None, status, timeout, reason.to_string());
	}
	
	/// Like `set_status`, but only while the status is one of `expected`.
	/// Returns whether the status was set.
	pub fn set_status_if(
		&self,
		expected: &[ModuleStatus],
		status: ModuleStatus,
		timeout: Option<Duration>,
		reason: impl Display,
	) -> bool {
		self.transition(Some(expected), status, timeout, reason.to_string())
	}
	
	fn transition(
		&self,
		expected: Option<&[ModuleStatus]>,
		status: ModuleStatus,
		timeout: Option<Duration>,
		reason: String,
	) -> bool {
		let _serialized = self.inner.status_lock.lock()
			.expect("module lock poisoned");
		
		let previous = {
			let mut state = self.lock();
			let previous = state.status;
			
			if expected.is_some_and(|expected| !expected.contains(&previous)) {
				debug!("{}: not going {status} ({reason}), already {previous}", self.name());
				return false;
			}
			
			state.status = status;
			state.reason = reason.clone();
			
			if status == ModuleStatus::Failed && previous != ModuleStatus::Failed {
				state.failure_attempts += 1;
			}
			
			if status == ModuleStatus::Ready {
				state.failure_attempts = 0;
			}
			
			previous
		};
		
		match timeout {
			Some(timeout) => {
				self.inner.timer.start_in(timeout);
			},
			None => self.inner.timer.stop(),
		}
		
		if previous != status {
			info!("{}: {previous} -> {status}: {reason}", self.name());
			
			self.emit(Event::Status {
				module: self.name().to_owned(),
				status,
				previous,
				reason,
			});
		} else {
			debug!("{}: still {status}: {reason}", self.name());
		}
		
		self.inner.timers.wake();
		true
	}
	
	/// The channel gave up on a request with `code`. Nothing else notices a
	/// dead channel once the module has settled, so this starts the failure
	/// handling from there. Returns whether the module went FAILED.
	pub fn failed(&self, code: ResponseCode, what: impl Display) -> bool {
		self.set_status_if(SETTLED, ModuleStatus::Failed, Some(self.timing().failed_retry), format!("{what}: {code}"))
	}
	
	/// Turns the final code of an operator request into its result.
	fn checked(&self, code: ResponseCode, what: &str) -> Result<(), ModuleError> {
		if code.is_comm_error() {
			self.failed(code, what);
		}
		
		if code.is_ok() {
			Ok(())
		} else {
			Err(ModuleError::Rejected(code))
		}
	}
	
	/// Completion for requests whose result nobody waits on.
	fn watcher(&self) -> impl FnOnce(&Request) + Send + 'static {
		let module = Arc::downgrade(&self.inner);
		
		move |request: &Request| {
			if let Some(inner) = module.upgrade() {
				let code = request.status();
				
				if code.is_comm_error() {
					Module { inner }.failed(code, request.text());
				}
			}
		}
	}
	
	fn lock(&self) -> MutexGuard<'_, ModuleState> {
		self.inner.state.lock()
			.expect("module lock poisoned")
	}
	
	fn timing(&self) -> &Timing {
		&self.inner.config.timing
	}
	
	fn emit(&self, event: Event) {
		self.inner.events.emit(&event);
	}
	
	/// Runs on the monitor thread.
	fn timer_expired(&self) {
		let status = self.status();
		debug!("{}: timer expired while {status}", self.name());
		
		match status {
			ModuleStatus::Closed => self.open(),
			ModuleStatus::PoweringOn => self.power_on_timed_out(),
			ModuleStatus::WaitingInitialization => self.initialize(),
			ModuleStatus::Ready => self.refresh(),
			ModuleStatus::Failed => self.retry_after_failure(),
			ModuleStatus::Resetting => {
				self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "reset timed out");
			},
			ModuleStatus::PoweringOff => self.power_off_timed_out(),
			_ => {},
		}
	}
	
	fn open_comm(&self) -> io::Result<Arc<Comm>> {
		let link = self.inner.device.open()?;
		
		let weak = Arc::downgrade(&self.inner);
		let handler = move |urc: Urc| {
			if let Some(inner) = weak.upgrade() {
				Module { inner }.handle_urc(urc);
			}
		};
		
		let comm = Arc::new(Comm::open(self.name(), link, Arc::new(handler))?);
		
		*self.inner.comm.lock().expect("module lock poisoned") = Some(comm.clone());
		Ok(comm)
	}
	
	fn close_comm(&self) {
		let comm = self.inner.comm.lock()
			.expect("module lock poisoned")
			.take();
		
		if let Some(comm) = comm {
			comm.close();
		}
	}
	
	fn open(&self) {
		self.close_comm();
		
		if let Err(err) = self.open_comm() {
			let reason = format!("cannot open {}: {err}", self.inner.device.describe());
			return self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), reason);
		}
		
		match self.inner.device.power_state() {
			Ok(PowerState::On) => {
				self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "opened");
			},
			Ok(PowerState::Off) => {
				self.lock().power_attempts = 0;
				self.ignite("powering on");
			},
			Err(err) => self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), format!("power state unknown: {err}")),
		}
	}
	
	fn ignite(&self, reason: &str) {
		let attempt = {
			let mut state = self.lock();
			state.power_attempts += 1;
			state.power_attempts
		};
		
		if let Err(err) = self.inner.device.ignite() {
			warn!("{}: ignition failed: {err}", self.name());
		}
		
		self.set_status(ModuleStatus::PoweringOn, Some(self.timing().power_on), format!("{reason} (attempt {attempt})"));
	}
	
	fn power_on_timed_out(&self) {
		if let Ok(PowerState::On) = self.inner.device.power_state() {
			return self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "power confirmed");
		}
		
		if self.lock().power_attempts < MAX_POWER_ATTEMPTS {
			return self.ignite("no sign of life, igniting again");
		}
		
		self.close_comm();
		self.set_status(ModuleStatus::Off, None, format!("did not power on after {MAX_POWER_ATTEMPTS} attempts"));
	}
	
	fn retry_after_failure(&self) {
		let attempts = self.lock().failure_attempts;
		self.close_comm();
		
		if attempts < MAX_FAILURE_ATTEMPTS {
			return self.set_status(ModuleStatus::Closed, Some(Duration::ZERO), format!("reopening after failure {attempts}"));
		}
		
		self.power_cycle(attempts);
	}
	
	fn power_cycle(&self, attempts: u32) {
		warn!("{}: {attempts} failures in a row, power cycling", self.name());
		
		if let Err(err) = self.inner.device.emergency_off() {
			warn!("{}: emergency off failed: {err}", self.name());
		}
		
		if let Err(err) = self.open_comm() {
			let reason = format!("cannot open {}: {err}", self.inner.device.describe());
			return self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), reason);
		}
		
		self.lock().power_attempts = 0;
		self.ignite(&format!("power cycle after {attempts} failures"));
	}
	
	fn power_off_timed_out(&self) {
		if self.inner.device.has_power_control() {
			if let Err(err) = self.inner.device.emergency_off() {
				warn!("{}: emergency off failed: {err}", self.name());
			}
		}
		
		self.close_comm();
		self.set_status(ModuleStatus::Off, None, "no shutdown confirmation");
	}
	
	fn refresh(&self) {
		let Some(comm) = self.comm() else {
			return self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), "channel gone");
		};
		
		// a URC may have moved the module on while the queries ran
		match self.refresh_network(&comm) {
			Ok(()) => {
				let reason = self.reason();
				self.set_status_if(&[ModuleStatus::Ready], ModuleStatus::Ready, Some(self.timing().refresh), reason);
			},
			Err(init::InitAbort::Failed(reason)) => {
				self.set_status_if(&[ModuleStatus::Ready], ModuleStatus::Failed, Some(self.timing().failed_retry), reason);
			},
			Err(init::InitAbort::StatusSet) => {},
		}
	}
	
	fn require_comm(&self) -> Result<Arc<Comm>, ModuleError> {
		self.comm().ok_or(ModuleError::NoChannel)
	}
	
	fn require_status(&self, allowed: &[ModuleStatus]) -> Result<(), ModuleError> {
		let status = self.status();
		
		if allowed.contains(&status) {
			Ok(())
		} else {
			Err(ModuleError::NotAllowed(status))
		}
	}
	
	pub fn power_off(&self) -> Result<(), ModuleError> {
		if matches!(self.status(), ModuleStatus::Off | ModuleStatus::PoweringOff | ModuleStatus::Unconfigured) {
			return Err(ModuleError::NotAllowed(self.status()));
		}
		
		let comm = self.comm();
		self.set_status(ModuleStatus::PoweringOff, Some(self.timing().power_off), "power off requested");
		
		if let Some(comm) = comm {
			comm.make(self.timing().request, "AT^SMSO");
		}
		
		Ok(())
	}
	
	pub fn power_on(&self) -> Result<(), ModuleError> {
		self.require_status(&[ModuleStatus::Off])?;
		self.set_status(ModuleStatus::Closed, Some(Duration::ZERO), "power on requested");
		Ok(())
	}
	
	pub fn reset(&self) -> Result<(), ModuleError> {
		let comm = self.require_comm()?;
		
		self.set_status(ModuleStatus::Resetting, Some(self.timing().reset), "reset requested");
		comm.make(self.timing().request, "AT+CFUN=1,1");
		Ok(())
	}
	
	/// Turns the GSM service on or off. An initialized module follows at
	/// once, others on their next initialization.
	pub fn set_service(&self, enabled: bool) -> Result<(), ModuleError> {
		let status = {
			let mut state = self.lock();
			state.service_enabled = enabled;
			state.status
		};
		
		match (enabled, status) {
			(true, ModuleStatus::Offline) => {
				self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "service enabled");
			},
			(false, ModuleStatus::Ready) => {
				let code = self.require_comm()?.make_wait_result(self.timing().request, "AT+COPS=2");
				self.checked(code, "disabling service")?;
				
				self.set_status(ModuleStatus::Offline, None, "service disabled");
			},
			_ => {},
		}
		
		Ok(())
	}
	
	pub fn enter_pin(&self, pin: &str) -> Result<(), ModuleError> {
		if !is_pin(pin) {
			return Err(ModuleError::InvalidArgument(pin.to_owned()));
		}
		
		self.require_status(&[ModuleStatus::WaitingPin])?;
		
		let code = self.require_comm()?.make_wait_result(self.timing().request, format!("AT+CPIN=\"{pin}\""));
		self.checked(code, "entering PIN")?;
		
		self.lock().pin = Some(pin.to_owned());
		self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "PIN accepted");
		Ok(())
	}
	
	/// Unblocks the SIM with `puk` and sets `pin` as its new PIN.
	pub fn enter_puk(&self, puk: &str, pin: &str) -> Result<(), ModuleError> {
		if puk.len() != 8 || !puk.bytes().all(|byte| byte.is_ascii_digit()) {
			return Err(ModuleError::InvalidArgument(puk.to_owned()));
		}
		
		if !is_pin(pin) {
			return Err(ModuleError::InvalidArgument(pin.to_owned()));
		}
		
		self.require_status(&[ModuleStatus::WaitingPin])?;
		
		let code = self.require_comm()?.make_wait_result(self.timing().request, format!("AT+CPIN=\"{puk}\",\"{pin}\""));
		self.checked(code, "entering PUK")?;
		
		self.lock().pin = Some(pin.to_owned());
		self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), "PUK accepted");
		Ok(())
	}
	
	/// Queues a raw command.
	pub fn send_at(&self, text: &str) -> Result<RequestHandle, ModuleError> {
		Ok(self.require_comm()?.make_callback(self.timing().request, text, self.watcher()))
	}
	
	/// Submits an SMS. `pdu` starts with the SMSC address, whose length
	/// `AT+CMGS` does not count.
	pub fn send_sms_pdu(&self, pdu: &[u8]) -> Result<RequestHandle, ModuleError> {
		let tpdu_length = pdu.first()
			.map(|smsc_length| *smsc_length as usize + 1)
			.filter(|smsc| *smsc < pdu.len())
			.map(|smsc| pdu.len() - smsc)
			.ok_or_else(|| ModuleError::InvalidArgument(crate::hex::encode_hex(pdu)))?;
		
		self.require_status(&[ModuleStatus::Ready])?;
		
		let comm = self.require_comm()?;
		Ok(comm.make_sms_callback(self.timing().request, pdu, format!("AT+CMGS={tpdu_length}"), self.watcher()))
	}
	
	pub fn dial(&self, number: &str) -> Result<(), ModuleError> {
		let valid = !number.is_empty() && number.chars().all(|c| c.is_ascii_digit() || "+*#".contains(c));
		
		if !valid {
			return Err(ModuleError::InvalidArgument(number.to_owned()));
		}
		
		self.require_status(&[ModuleStatus::Ready])?;
		
		let code = self.require_comm()?.make_wait_result(self.timing().request, format!("ATD{number};"));
		self.checked(code, "dialing")?;
		
		self.refresh_calls();
		Ok(())
	}
	
	pub fn answer(&self) -> Result<(), ModuleError> {
		self.require_status(&[ModuleStatus::Ready])?;
		
		let code = self.require_comm()?.make_wait_result(self.timing().request, "ATA");
		self.checked(code, "answering")?;
		
		self.refresh_calls();
		Ok(())
	}
	
	/// Hangs up every call. Live slots are reported released right away.
	pub fn hangup(&self) -> Result<(), ModuleError> {
		let code = self.require_comm()?.make_wait_result(self.timing().request, "AT+CHUP");
		self.checked(code, "hanging up")?;
		
		let dropped: Vec<(usize, Option<String>)> = {
			let mut state = self.lock();
			state.active_call = None;
			
			state.calls.iter_mut()
				.enumerate()
				.filter(|(_, slot)| slot.state.is_live())
				.map(|(index, slot)| {
					slot.state = CallState::Dropped;
					(index, slot.number.clone())
				})
				.collect()
		};
		
		for (slot, number) in dropped {
			self.emit(Event::Call {
				module: self.name().to_owned(),
				slot,
				event: CallEvent::Released { cause: Some(CAUSE_NORMAL_CLEARING) },
				number,
			});
		}
		
		Ok(())
	}
}

impl fmt::Debug for Module {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Module({:?}, {})", self.name(), self.status())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		event::{ChannelSink, SmsKind},
		testing::{MockDevice, Responder, init_logging, responder},
	};
	use std::{
		sync::{atomic::AtomicUsize, mpsc::{self, Receiver}},
		time::Instant,
	};
	
	const WAIT: Duration = Duration::from_secs(5);
	
	fn fast() -> Timing {
		Timing {
			request: Duration::from_millis(500),
			power_on: Duration::from_millis(100),
			initialization_delay: Duration::from_millis(10),
			failed_retry: Duration::from_millis(20),
			reset: Duration::from_millis(300),
			power_off: Duration::from_millis(200),
			refresh: Duration::from_secs(3600),
		}
	}
	
	fn config() -> ModuleConfig {
		let mut config = ModuleConfig::new("gsm0");
		config.timing = fast();
		config
	}
	
	fn healthy(command: &str) -> Vec<&'static str> {
		match command {
			"AT+CPIN?" => vec!["+CPIN: READY", "OK"],
			"AT+CGMI" => vec!["Cinterion", "OK"],
			"AT+CGMM" => vec!["EGS5", "OK"],
			"AT+CGMR" => vec!["REVISION 02.004", "OK"],
			"AT+CGSN" => vec!["351234567890123", "OK"],
			"AT+CIMI" => vec!["222015602275180", "OK"],
			"AT^SCID" => vec!["^SCID: 8939010000000000000", "OK"],
			"AT+CREG?" => vec!["+CREG: 2,1,\"0A1B\",\"3C4D\"", "OK"],
			"AT+COPS?" => vec!["+COPS: 0,0,\"I TIM\"", "OK"],
			"AT+CSQ" => vec!["+CSQ: 20,99", "OK"],
			"AT+CFUN=1,1" => vec!["OK", "^SYSSTART"],
			"AT^SMSO" => vec!["^SMSO: MS OFF", "OK", "^SHUTDOWN"],
			_ => vec!["OK"],
		}
	}
	
	fn module(config: ModuleConfig, device: Arc<MockDevice>) -> (Module, Receiver<Event>) {
		init_logging();
		let (sender, receiver) = mpsc::channel();
		let module = Module::new(config, device, Arc::new(ChannelSink::new(sender)));
		(module, receiver)
	}
	
	fn started(config: ModuleConfig, respond: Responder) -> (Module, Receiver<Event>, Arc<MockDevice>) {
		let device = MockDevice::new(respond);
		let (module, events) = module(config, device.clone());
		module.start().unwrap();
		(module, events, device)
	}
	
	fn next_event<T>(events: &Receiver<Event>, mut pick: impl FnMut(Event) -> Option<T>) -> T {
		let deadline = Instant::now() + WAIT;
		
		loop {
			let left = deadline.saturating_duration_since(Instant::now());
			let event = events.recv_timeout(left).expect("timed out waiting for event");
			
			if let Some(found) = pick(event) {
				return found;
			}
		}
	}
	
	fn statuses_until(events: &Receiver<Event>, last: ModuleStatus) -> Vec<ModuleStatus> {
		let mut seen = Vec::new();
		
		next_event(events, |event| match event {
			Event::Status { status, .. } => {
				seen.push(status);
				(status == last).then_some(())
			},
			_ => None,
		});
		
		seen
	}
	
	fn call_event(events: &Receiver<Event>) -> (usize, CallEvent, Option<String>) {
		next_event(events, |event| match event {
			Event::Call { slot, event, number, .. } => Some((slot, event, number)),
			_ => None,
		})
	}
	
	fn wait_until(mut condition: impl FnMut() -> bool) {
		let deadline = Instant::now() + WAIT;
		
		while !condition() {
			assert!(Instant::now() < deadline, "condition not met in time");
			thread::sleep(Duration::from_millis(5));
		}
	}
	
	#[test]
	fn reaches_ready() {
		let (module, events, device) = started(config(), responder(healthy));
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Ready),
			vec![
				ModuleStatus::Closed,
				ModuleStatus::WaitingInitialization,
				ModuleStatus::Initializing,
				ModuleStatus::Ready,
			],
		);
		
		let state = module.snapshot();
		assert_eq!(state.info.vendor.as_deref(), Some("Cinterion"));
		assert_eq!(state.sim.imsi.as_deref(), Some("222015602275180"));
		assert_eq!(state.sim.iccid.as_deref(), Some("8939010000000000000"));
		assert_eq!(state.network.registration, Registration::Home);
		assert_eq!(state.network.operator.as_deref(), Some("I TIM"));
		assert_eq!(state.network.rssi, Some(20));
		assert_eq!(state.failure_attempts, 0);
		
		let received = device.modem().received();
		assert_eq!(&received[..4], ["AT", "ATZ", "ATE1", "AT+CMEE=1"]);
		assert!(received.contains(&"AT+COPS=0".to_owned()));
		
		module.stop();
	}
	
	#[test]
	fn service_disabled_goes_offline() {
		let mut config = config();
		config.service_enabled = false;
		let (module, events, device) = started(config, responder(healthy));
		
		statuses_until(&events, ModuleStatus::Offline);
		assert!(device.modem().received().contains(&"AT+COPS=2".to_owned()));
		
		module.set_service(true).unwrap();
		statuses_until(&events, ModuleStatus::Ready);
		
		module.stop();
	}
	
	#[test]
	fn set_status_is_idempotent() {
		let (module, events) = module(config(), MockDevice::new(responder(healthy)));
		
		module.set_status(ModuleStatus::Ready, Some(Duration::from_secs(3600)), "x");
		let first = module.inner.timer.expiry().unwrap();
		thread::sleep(Duration::from_millis(10));
		module.set_status(ModuleStatus::Ready, Some(Duration::from_secs(3600)), "x");
		
		let event = events.try_recv().unwrap();
		assert!(matches!(event, Event::Status { status: ModuleStatus::Ready, previous: ModuleStatus::Unconfigured, .. }));
		assert!(events.try_recv().is_err());
		assert_eq!(module.reason(), "x");
		
		let restarted = module.inner.timer.expiry().unwrap();
		assert!(restarted >= first + Duration::from_millis(10));
		
		module.set_status(ModuleStatus::Ready, None, "y");
		assert_eq!(module.inner.timer.expiry(), None);
		assert!(events.try_recv().is_err());
	}
	
	#[test]
	fn set_status_if_only_from_expected() {
		let (module, events) = module(config(), MockDevice::new(responder(healthy)));
		
		module.set_status(ModuleStatus::Offline, None, "offline");
		assert!(!module.set_status_if(&[ModuleStatus::Ready], ModuleStatus::Failed, None, "too late"));
		assert_eq!(module.status(), ModuleStatus::Offline);
		assert_eq!(module.reason(), "offline");
		assert_eq!(module.snapshot().failure_attempts, 0);
		
		assert!(module.set_status_if(&[ModuleStatus::Ready, ModuleStatus::Offline], ModuleStatus::Failed, None, "now"));
		assert_eq!(module.status(), ModuleStatus::Failed);
		assert_eq!(module.snapshot().failure_attempts, 1);
		
		let statuses: Vec<ModuleStatus> = events.try_iter()
			.filter_map(|event| match event {
				Event::Status { status, .. } => Some(status),
				_ => None,
			})
			.collect();
		assert_eq!(statuses, [ModuleStatus::Offline, ModuleStatus::Failed]);
	}
	
	#[test]
	fn initialization_leaves_status_set_meanwhile() {
		let (module, events) = module(config(), MockDevice::new(responder(healthy)));
		
		module.set_status(ModuleStatus::Initializing, None, "initializing");
		module.set_status(ModuleStatus::WaitingSim, None, "SIM removed");
		module.initialized();
		
		assert_eq!(module.status(), ModuleStatus::WaitingSim);
		assert_eq!(module.reason(), "SIM removed");
		assert!(events.try_iter().all(|event| !matches!(event, Event::Status { status: ModuleStatus::Ready, .. })));
	}
	
	#[test]
	fn sim_removed_during_last_configuration_step() {
		let (module, events, _device) = started(config(), responder(|command| match command {
			"AT+CSCB=0" => vec!["^SCKS: 0", "OK"],
			command => healthy(command),
		}));
		
		statuses_until(&events, ModuleStatus::WaitingSim);
		wait_until(|| module.status() == ModuleStatus::WaitingSim);
		thread::sleep(Duration::from_millis(50));
		
		assert_eq!(module.status(), ModuleStatus::WaitingSim);
		assert_eq!(module.snapshot().sim.inserted, Some(false));
		
		module.stop();
	}
	
	#[test]
	fn dead_channel_fails_settled_module() {
		let mut config = config();
		config.service_enabled = false;
		config.timing.request = Duration::from_millis(300);
		let (module, events, _device) = started(config, responder(|command| match command {
			"AT+SLOW" => vec![],
			command => healthy(command),
		}));
		
		statuses_until(&events, ModuleStatus::Offline);
		
		let request = module.send_at("AT+SLOW").unwrap();
		assert_eq!(request.wait(), ResponseCode::Timeout);
		
		let reason = next_event(&events, |event| match event {
			Event::Status { status: ModuleStatus::Failed, previous: ModuleStatus::Offline, reason, .. } => Some(reason),
			_ => None,
		});
		assert_eq!(reason, "AT+SLOW: Communication TIMEOUT");
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Offline),
			vec![
				ModuleStatus::Closed,
				ModuleStatus::WaitingInitialization,
				ModuleStatus::Initializing,
				ModuleStatus::Offline,
			],
		);
		assert_eq!(module.snapshot().failure_attempts, 1);
		
		module.stop();
	}
	
	#[test]
	fn operator_request_on_dead_channel_fails_module() {
		let mut config = config();
		config.timing.request = Duration::from_millis(300);
		let (module, events, _device) = started(config, responder(|command| match command {
			"ATA" => vec![],
			command => healthy(command),
		}));
		
		statuses_until(&events, ModuleStatus::Ready);
		
		assert_eq!(module.answer(), Err(ModuleError::Rejected(ResponseCode::Timeout)));
		
		let reason = next_event(&events, |event| match event {
			Event::Status { status: ModuleStatus::Failed, reason, .. } => Some(reason),
			_ => None,
		});
		assert_eq!(reason, "answering: Communication TIMEOUT");
		
		statuses_until(&events, ModuleStatus::Ready);
		module.stop();
	}
	
	#[test]
	fn rejected_command_keeps_module_ready() {
		let (module, events, _device) = started(config(), responder(|command| match command {
			"ATD555;" => vec!["NO CARRIER"],
			command => healthy(command),
		}));
		
		statuses_until(&events, ModuleStatus::Ready);
		
		assert_eq!(module.dial("555"), Err(ModuleError::Rejected(ResponseCode::NoCarrier)));
		assert_eq!(module.status(), ModuleStatus::Ready);
		
		module.stop();
	}
	
	#[test]
	fn failure_counter() {
		let (module, _events) = module(config(), MockDevice::new(responder(healthy)));
		let hour = Some(Duration::from_secs(3600));
		
		module.set_status(ModuleStatus::Failed, hour, "one");
		module.set_status(ModuleStatus::Failed, hour, "still one");
		module.set_status(ModuleStatus::Closed, hour, "reopening");
		module.set_status(ModuleStatus::Failed, hour, "two");
		assert_eq!(module.snapshot().failure_attempts, 2);
		
		module.set_status(ModuleStatus::Ready, hour, "fine");
		assert_eq!(module.snapshot().failure_attempts, 0);
	}
	
	fn locked_sim(attempts: &'static str, unlocked: Arc<AtomicBool>) -> Responder {
		responder(move |command| match command {
			"AT+CPIN?" if unlocked.load(Ordering::SeqCst) => vec!["+CPIN: READY", "OK"],
			"AT+CPIN?" => vec!["+CPIN: SIM PIN", "OK"],
			"AT^SPIC" => vec![attempts, "OK"],
			"AT+CPIN=\"1234\"" => {
				unlocked.store(true, Ordering::SeqCst);
				vec!["OK"]
			},
			"AT+CPIN=\"0000\"" => vec!["+CME ERROR: 16"],
			command => healthy(command),
		})
	}
	
	#[test]
	fn few_pin_attempts_left_waits_for_pin() {
		let mut config = config();
		config.pin = Some("1234".to_owned());
		let (module, events, device) = started(config, locked_sim("^SPIC: 2", Arc::default()));
		
		statuses_until(&events, ModuleStatus::WaitingPin);
		
		assert_eq!(module.snapshot().sim.pin_attempts, Some(2));
		assert!(!device.modem().received().iter().any(|command| command.starts_with("AT+CPIN=")));
		
		module.stop();
	}
	
	#[test]
	fn configured_pin_is_entered() {
		let mut config = config();
		config.pin = Some("1234".to_owned());
		let (module, events, device) = started(config, locked_sim("^SPIC: 3", Arc::default()));
		
		let statuses = statuses_until(&events, ModuleStatus::Ready);
		
		assert!(!statuses.contains(&ModuleStatus::WaitingPin));
		assert!(device.modem().received().contains(&"AT+CPIN=\"1234\"".to_owned()));
		
		module.stop();
	}
	
	#[test]
	fn operator_enters_pin() {
		let (module, events, _device) = started(config(), locked_sim("^SPIC: 3", Arc::default()));
		
		statuses_until(&events, ModuleStatus::WaitingPin);
		assert_eq!(module.reason(), "PIN required");
		
		assert_eq!(module.enter_pin("0000"), Err(ModuleError::Rejected(ResponseCode::CmeError(16))));
		assert_eq!(module.enter_pin("12"), Err(ModuleError::InvalidArgument("12".to_owned())));
		module.enter_pin("1234").unwrap();
		
		statuses_until(&events, ModuleStatus::Ready);
		assert_eq!(module.snapshot().pin.as_deref(), Some("1234"));
		
		module.stop();
	}
	
	#[test]
	fn pin_attempts_query_waits_for_busy_sim() {
		let queries = Arc::new(AtomicUsize::new(0));
		let unlocked = Arc::new(AtomicBool::new(false));
		let respond = {
			let queries = queries.clone();
			let sim = locked_sim("^SPIC: 3", unlocked);
			
			responder(move |command| match command {
				"AT^SPIC" if queries.fetch_add(1, Ordering::SeqCst) == 0 => vec!["+CME ERROR: 14".to_owned()],
				command => sim(command),
			})
		};
		
		let mut config = config();
		config.pin = Some("1234".to_owned());
		let (module, events, _device) = started(config, respond);
		
		statuses_until(&events, ModuleStatus::Ready);
		assert_eq!(queries.load(Ordering::SeqCst), 2);
		
		module.stop();
	}
	
	#[test]
	fn puk_required() {
		let respond = responder(|command| match command {
			"AT+CPIN?" => vec!["+CPIN: SIM PUK", "OK"],
			command => healthy(command),
		});
		let (module, events, _device) = started(config(), respond);
		
		statuses_until(&events, ModuleStatus::WaitingPin);
		assert_eq!(module.reason(), "PUK required");
		
		module.stop();
	}
	
	#[test]
	fn sim_insertion_resumes_initialization() {
		let inserted = Arc::new(AtomicBool::new(false));
		let respond = {
			let inserted = inserted.clone();
			
			responder(move |command| match command {
				"AT+CPIN?" if !inserted.load(Ordering::SeqCst) => vec!["+CME ERROR: 10"],
				command => healthy(command),
			})
		};
		let (module, events, device) = started(config(), respond);
		
		statuses_until(&events, ModuleStatus::WaitingSim);
		assert_eq!(module.snapshot().sim.inserted, Some(false));
		
		inserted.store(true, Ordering::SeqCst);
		device.modem().inject(&["^SCKS: 1"]);
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Ready),
			vec![ModuleStatus::WaitingInitialization, ModuleStatus::Initializing, ModuleStatus::Ready],
		);
		
		device.modem().inject(&["^SCKS: 0"]);
		statuses_until(&events, ModuleStatus::WaitingSim);
		
		module.stop();
	}
	
	#[test]
	fn three_failures_power_cycle() {
		let device = MockDevice::with_power_control(responder(|_| vec!["ERROR"]), true);
		let (module, events) = module(config(), device.clone());
		module.start().unwrap();
		
		let mut failures = 0;
		next_event(&events, |event| match event {
			Event::Status { status: ModuleStatus::Failed, .. } => {
				failures += 1;
				None
			},
			Event::Status { status: ModuleStatus::PoweringOn, .. } if failures > 0 => Some(()),
			_ => None,
		});
		
		assert_eq!(failures, MAX_FAILURE_ATTEMPTS);
		assert_eq!(device.emergency_offs.load(Ordering::SeqCst), 1);
		assert_eq!(module.snapshot().failure_attempts, MAX_FAILURE_ATTEMPTS);
		
		module.stop();
	}
	
	#[test]
	fn gives_up_when_power_does_not_come_on() {
		let device = MockDevice::with_power_control(responder(healthy), false);
		let (module, events) = module(config(), device.clone());
		module.start().unwrap();
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Off),
			vec![ModuleStatus::Closed, ModuleStatus::PoweringOn, ModuleStatus::Off],
		);
		assert_eq!(device.ignitions.load(Ordering::SeqCst), MAX_POWER_ATTEMPTS as usize);
		
		assert_eq!(module.power_off(), Err(ModuleError::NotAllowed(ModuleStatus::Off)));
		module.stop();
	}
	
	#[test]
	fn reset_waits_for_start_up() {
		let (module, events, _device) = started(config(), responder(healthy));
		statuses_until(&events, ModuleStatus::Ready);
		
		module.reset().unwrap();
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Ready),
			vec![
				ModuleStatus::Resetting,
				ModuleStatus::WaitingInitialization,
				ModuleStatus::Initializing,
				ModuleStatus::Ready,
			],
		);
		
		module.stop();
	}
	
	#[test]
	fn power_off_and_on() {
		let (module, events, device) = started(config(), responder(healthy));
		statuses_until(&events, ModuleStatus::Ready);
		
		module.power_off().unwrap();
		
		assert_eq!(
			statuses_until(&events, ModuleStatus::Off),
			vec![ModuleStatus::PoweringOff, ModuleStatus::Off],
		);
		assert!(module.comm().is_none());
		
		module.power_on().unwrap();
		statuses_until(&events, ModuleStatus::Ready);
		assert_eq!(device.opens.load(Ordering::SeqCst), 2);
		
		module.stop();
	}
	
	#[test]
	fn incoming_call() {
		let calls = Arc::new(Mutex::new(Vec::<String>::new()));
		let respond = {
			let calls = calls.clone();
			
			responder(move |command| match command {
				"AT^SLCC" => {
					let mut lines = calls.lock().unwrap().clone();
					lines.push("OK".to_owned());
					lines
				},
				"AT+CEER" => vec!["+CEER: 8,16,0".to_owned(), "OK".to_owned()],
				command => healthy(command).into_iter().map(str::to_owned).collect(),
			})
		};
		let (module, events, device) = started(config(), respond);
		statuses_until(&events, ModuleStatus::Ready);
		let modem = device.modem();
		
		modem.inject(&["+CLIP: \"555\",129", "+CRING: VOICE"]);
		let caller = next_event(&events, |event| match event {
			Event::Ring { caller, bearer: Bearer::Voice, .. } => Some(caller),
			_ => None,
		});
		assert_eq!(caller.as_deref(), Some("555"));
		
		*calls.lock().unwrap() = vec!["^SLCC: 1,1,4,0,0,0,\"555\",129".to_owned()];
		modem.inject(&["+CIEV: call,1"]);
		assert_eq!(call_event(&events), (0, CallEvent::Incoming, Some("555".to_owned())));
		
		*calls.lock().unwrap() = vec!["^SLCC: 1,1,0,0,0,1,\"555\",129".to_owned()];
		modem.inject(&["+CIEV: call,1"]);
		assert_eq!(call_event(&events), (0, CallEvent::Answered, Some("555".to_owned())));
		assert_eq!(module.snapshot().active_call, Some(0));
		
		calls.lock().unwrap().clear();
		modem.inject(&["NO CARRIER"]);
		assert_eq!(call_event(&events), (0, CallEvent::Released { cause: Some(16) }, Some("555".to_owned())));
		
		let state = module.snapshot();
		assert_eq!(state.active_call, None);
		assert_eq!(state.caller_id, None);
		
		module.stop();
	}
	
	#[test]
	fn rings_rejected_unless_ready() {
		let mut config = config();
		config.service_enabled = false;
		let (module, events, device) = started(config, responder(healthy));
		statuses_until(&events, ModuleStatus::Offline);
		
		device.modem().inject(&["+CRING: VOICE"]);
		
		let total = next_event(&events, |event| match event {
			Event::CallRejected { total, .. } => Some(total),
			_ => None,
		});
		assert_eq!(total, 1);
		wait_until(|| device.modem().received().contains(&"AT+CHUP".to_owned()));
		
		module.stop();
	}
	
	#[test]
	fn registration_urcs() {
		let (module, events, device) = started(config(), responder(healthy));
		statuses_until(&events, ModuleStatus::Ready);
		let modem = device.modem();
		
		let network = |events: &Receiver<Event>| next_event(events, |event| match event {
			Event::Network { registration, operator, .. } => Some((registration, operator)),
			_ => None,
		});
		
		modem.inject(&["+CREG: 2"]);
		assert_eq!(network(&events), (Registration::Searching, None));
		
		modem.inject(&["+CREG: 1,\"0A1B\",\"3C4D\""]);
		assert_eq!(network(&events), (Registration::Home, None));
		assert_eq!(network(&events), (Registration::Home, Some("I TIM".to_owned())));
		assert_eq!(module.snapshot().network.lac, Some(0x0A1B));
		
		module.stop();
	}
	
	#[test]
	fn incoming_sms() {
		let (module, events, device) = started(config(), responder(healthy));
		statuses_until(&events, ModuleStatus::Ready);
		
		device.modem().inject(&["+CMT: ,24", "0791448720003023240DD0E474D81C0EBB010000111011315214000BE474D81C0EBB5DE3771B"]);
		let (kind, pdu) = next_event(&events, |event| match event {
			Event::Sms { kind, pdu, .. } => Some((kind, pdu)),
			_ => None,
		});
		assert_eq!(kind, SmsKind::Deliver);
		assert_eq!(&pdu[..2], [0x07, 0x91]);
		
		device.modem().inject(&["+CMTI: \"SM\",4"]);
		let stored = next_event(&events, |event| match event {
			Event::SmsStored { storage, index, .. } => Some((storage, index)),
			_ => None,
		});
		assert_eq!(stored, ("SM".to_owned(), 4));
		
		module.stop();
	}
	
	#[test]
	fn sms_submit() {
		let respond = responder(|command| match command {
			"AT+CMGS=2" => vec![">"],
			"000102\u{1a}" => vec!["+CMGS: 7", "OK"],
			command => healthy(command),
		});
		let (module, events, _device) = started(config(), respond);
		statuses_until(&events, ModuleStatus::Ready);
		
		let request = module.send_sms_pdu(&[0x00, 0x01, 0x02]).unwrap();
		
		assert_eq!(request.wait(), ResponseCode::Ok);
		assert_eq!(request.first_line().as_deref(), Some("+CMGS: 7"));
		assert!(matches!(module.send_sms_pdu(&[0x05, 0x01]), Err(ModuleError::InvalidArgument(_))));
		
		module.stop();
	}
}
