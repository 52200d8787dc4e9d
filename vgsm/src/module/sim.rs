use std::time::Duration;

use log::{debug, info};

use crate::{
	comm::{Comm, RequestHandle, ResponseCode, fields::{fields, number}, response::{CME_INCORRECT_PASSWORD, CME_INIT_IN_PROGRESS, CME_SIM_BUSY, CME_SIM_NOT_INSERTED}},
	retry::{Backoff, retry},
};

use super::{Module, ModuleStatus, init::InitAbort};

/// Below this many attempts left a configured PIN is not tried, so a wrong
/// one can never lock the SIM.
pub const MIN_PIN_ATTEMPTS: u8 = 3;

const SIM_BUSY_BACKOFF: Backoff = Backoff::new(5, Duration::from_millis(500), Duration::from_secs(4));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimInfo {
	/// `None` until the module has told us.
	pub inserted: Option<bool>,
	pub imsi: Option<String>,
	pub iccid: Option<String>,
	pub pin_attempts: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinState {
	Ready,
	SimPin,
	SimPuk,
	SimPin2,
	SimPuk2,
	Other(String),
}

impl PinState {
	/// `+CPIN: <code>`
	pub fn parse(line: &str) -> Option<Self> {
		let code = line.strip_prefix("+CPIN:")?.trim();
		
		let state = match code {
			"READY" => PinState::Ready,
			"SIM PIN" => PinState::SimPin,
			"SIM PUK" => PinState::SimPuk,
			"SIM PIN2" => PinState::SimPin2,
			"SIM PUK2" => PinState::SimPuk2,
			other => PinState::Other(other.to_owned()),
		};
		
		Some(state)
	}
}

/// The SIM or module is still starting up and will answer later.
pub fn is_sim_busy(code: ResponseCode) -> bool {
	code == ResponseCode::CmeError(CME_SIM_BUSY) || code == ResponseCode::CmeError(CME_INIT_IN_PROGRESS)
}

/// Remaining attempts from `^SPIC: <n>`.
pub fn parse_spic(line: &str) -> Option<u8> {
	number(&fields(line, "^SPIC:")?, 0)
}

/// Sends `text`, repeating it while the SIM is busy.
pub(super) fn make_wait_sim(comm: &Comm, timeout: Duration, text: &str) -> RequestHandle {
	retry(
		SIM_BUSY_BACKOFF,
		|| comm.make_wait(timeout, text),
		|request| is_sim_busy(request.status()),
	)
}

impl Module {
	/// Makes sure the SIM is usable, entering the configured PIN if it is
	/// safe to do so.
	pub(super) fn unlock_sim(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		let request = make_wait_sim(comm, timeout, "AT+CPIN?");
		
		let state = match request.status() {
			ResponseCode::Ok => request.lines()
				.iter()
				.find_map(|line| PinState::parse(line))
				.ok_or_else(|| InitAbort::Failed("no +CPIN in answer".to_owned()))?,
			ResponseCode::CmeError(CME_SIM_NOT_INSERTED) => {
				self.lock().sim.inserted = Some(false);
				return self.abort_with(ModuleStatus::WaitingSim, "SIM not inserted");
			},
			code => return Err(InitAbort::rejected("AT+CPIN?", code)),
		};
		
		self.lock().sim.inserted = Some(true);
		
		match state {
			PinState::Ready => Ok(()),
			PinState::SimPin => self.enter_configured_pin(comm),
			PinState::SimPuk => self.abort_with(ModuleStatus::WaitingPin, "PUK required"),
			PinState::SimPin2 | PinState::SimPuk2 => {
				debug!("{}: {state:?} only guards the fixed dialing numbers", self.name());
				Ok(())
			},
			PinState::Other(other) => Err(InitAbort::Failed(format!("unexpected SIM state `{other}`"))),
		}
	}
	
	fn enter_configured_pin(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		let attempts = self.pin_attempts(comm)?;
		
		let pin = {
			let mut state = self.lock();
			state.sim.pin_attempts = Some(attempts);
			state.pin.clone()
		};
		
		if attempts < MIN_PIN_ATTEMPTS {
			return self.abort_with(
				ModuleStatus::WaitingPin,
				format!("{attempts} PIN attempts left, not trying automatically"),
			);
		}
		
		let Some(pin) = pin else {
			return self.abort_with(ModuleStatus::WaitingPin, "PIN required");
		};
		
		match comm.make_wait_result(timeout, format!("AT+CPIN=\"{pin}\"")) {
			ResponseCode::Ok => {
				info!("{}: PIN accepted", self.name());
				self.lock().sim.pin_attempts = None;
				Ok(())
			},
			ResponseCode::CmeError(CME_INCORRECT_PASSWORD) => {
				self.lock().pin = None;
				self.abort_with(ModuleStatus::WaitingPin, "configured PIN rejected")
			},
			code => Err(InitAbort::rejected("AT+CPIN", code)),
		}
	}
	
	fn pin_attempts(&self, comm: &Comm) -> Result<u8, InitAbort> {
		let request = make_wait_sim(comm, self.timing().request, "AT^SPIC");
		
		if !request.status().is_ok() {
			return Err(InitAbort::rejected("AT^SPIC", request.status()));
		}
		
		request.lines()
			.iter()
			.find_map(|line| parse_spic(line))
			.ok_or_else(|| InitAbort::Failed("no ^SPIC in answer".to_owned()))
	}
}
