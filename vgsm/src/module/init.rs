//! Bringing a freshly started module into service.
//!
//! The steps run in order on the monitor thread and stop at the first
//! failure. A step that finds the module in a state it cannot fix (no SIM,
//! PIN needed) sets that status itself and aborts with
//! [`InitAbort::StatusSet`].

use std::{fmt::Display, time::Duration};

use log::{debug, info, warn};

use crate::{
	comm::{Comm, CommState, RequestHandle, ResponseCode},
	event::Event,
	module::network::{parse_cops, parse_creg, parse_csq},
};

use super::{Module, ModuleStatus, sim::make_wait_sim};

/// Manual operator selection waits for the network.
const OPERATOR_SELECTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum InitAbort {
	Failed(String),
	StatusSet,
}

impl InitAbort {
	pub fn rejected(command: &str, code: ResponseCode) -> Self {
		InitAbort::Failed(format!("{command}: {code}"))
	}
}

/// Sends `text` and insists on `OK`.
pub(super) fn expect_ok(comm: &Comm, timeout: Duration, text: impl Display) -> Result<RequestHandle, InitAbort> {
	let request = comm.make_wait(timeout, text);
	
	match request.status() {
		ResponseCode::Ok => Ok(request),
		code => Err(InitAbort::rejected(request.text(), code)),
	}
}

impl Module {
	pub(super) fn initialize(&self) {
		self.set_status(ModuleStatus::Initializing, None, "initializing");
		
		let Some(comm) = self.comm() else {
			return self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), "no channel to initialize");
		};
		
		if comm.state() == CommState::Failed {
			comm.recover();
		}
		
		match self.run_initialization(&comm) {
			Ok(()) => self.initialized(),
			Err(InitAbort::StatusSet) => debug!("{}: initialization stopped in {}", self.name(), self.status()),
			Err(InitAbort::Failed(reason)) => {
				warn!("{}: initialization failed: {reason}", self.name());
				self.set_status_if(&[ModuleStatus::Initializing], ModuleStatus::Failed, Some(self.timing().failed_retry), reason);
			},
		}
	}
	
	fn run_initialization(&self, comm: &Comm) -> Result<(), InitAbort> {
		self.reset_interface(comm)?;
		self.still_initializing()?;
		self.unlock_sim(comm)?;
		self.still_initializing()?;
		self.configure(comm)?;
		self.still_initializing()?;
		self.read_static_info(comm)?;
		self.still_initializing()?;
		self.refresh_network(comm)?;
		self.postponed_configuration(comm)?;
		self.still_initializing()
	}
	
	/// Finishes initialization unless a URC handler got in first.
	pub(super) fn initialized(&self) {
		let service_enabled = self.lock().service_enabled;
		let expected = &[ModuleStatus::Initializing];
		
		let finished = if service_enabled {
			self.set_status_if(expected, ModuleStatus::Ready, Some(self.timing().refresh), "initialized")
		} else {
			self.set_status_if(expected, ModuleStatus::Offline, None, "initialized, service disabled")
		};
		
		if !finished {
			debug!("{}: initialization finished in {}", self.name(), self.status());
		}
	}
	
	/// A URC handler may have moved the module on meanwhile.
	fn still_initializing(&self) -> Result<(), InitAbort> {
		match self.status() {
			ModuleStatus::Initializing => Ok(()),
			_ => Err(InitAbort::StatusSet),
		}
	}
	
	pub(super) fn abort_with(&self, status: ModuleStatus, reason: impl Display) -> Result<(), InitAbort> {
		self.set_status(status, None, reason);
		Err(InitAbort::StatusSet)
	}
	
	fn reset_interface(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		
		for command in ["AT", "ATZ", "ATE1", "AT+CMEE=1"] {
			expect_ok(comm, timeout, command)?;
		}
		
		Ok(())
	}
	
	fn configure(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		
		let commands = [
			"AT+CMGF=0",
			"AT+CNMI=2,2,2,1,0",
			"AT+CLIP=1",
			"AT+CREG=2",
			"AT+CRC=1",
			"AT^SCKS=1",
			"AT+CMER=2,0,0,2",
			"AT^SIND=\"call\",1",
			"AT+CSSN=1,1",
			"AT^SCTM=1",
		];
		
		for command in commands {
			expect_ok(comm, timeout, command)?;
		}
		
		let selection = if self.lock().service_enabled {
			format!("AT+COPS={}", self.config().operator)
		} else {
			"AT+COPS=2".to_owned()
		};
		
		expect_ok(comm, OPERATOR_SELECTION_TIMEOUT.max(timeout), selection)?;
		
		Ok(())
	}
	
	fn read_static_info(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		let line = |command: &str| -> Result<Option<String>, InitAbort> {
			Ok(expect_ok(comm, timeout, command)?.first_line())
		};
		
		let vendor = line("AT+CGMI")?;
		let model = line("AT+CGMM")?;
		let revision = line("AT+CGMR")?;
		let imei = line("AT+CGSN")?;
		
		let imsi = make_wait_sim(comm, timeout, "AT+CIMI");
		if !imsi.status().is_ok() {
			return Err(InitAbort::rejected("AT+CIMI", imsi.status()));
		}
		
		let iccid = line("AT^SCID")?
			.map(|line| line.trim_start_matches("^SCID:").trim().to_owned());
		
		info!(
			"{}: {} {} ({}), IMEI {}",
			self.name(),
			vendor.as_deref().unwrap_or("?"),
			model.as_deref().unwrap_or("?"),
			revision.as_deref().unwrap_or("?"),
			imei.as_deref().unwrap_or("?"),
		);
		
		let mut state = self.lock();
		state.info.vendor = vendor;
		state.info.model = model;
		state.info.revision = revision;
		state.info.imei = imei;
		state.sim.imsi = imsi.first_line();
		state.sim.iccid = iccid;
		
		Ok(())
	}
	
	/// Re-reads registration, operator and signal quality.
	pub(super) fn refresh_network(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		
		let registration = expect_ok(comm, timeout, "AT+CREG?")?
			.lines()
			.iter()
			.find_map(|line| parse_creg(line, true));
		let operator = expect_ok(comm, timeout, "AT+COPS?")?
			.lines()
			.iter()
			.find_map(|line| parse_cops(line));
		let signal = expect_ok(comm, timeout, "AT+CSQ")?
			.lines()
			.iter()
			.find_map(|line| parse_csq(line));
		
		let event = {
			let mut state = self.lock();
			let network = &mut state.network;
			let mut changed = false;
			
			if let Some(update) = registration {
				changed |= network.update_registration(update);
			}
			
			if let Some(operator) = operator.filter(|_| network.registration.is_registered()) {
				changed |= network.operator != operator;
				network.operator = operator;
			}
			
			if let Some((rssi, ber)) = signal {
				network.rssi = rssi;
				network.ber = ber;
			}
			
			changed.then(|| Event::Network {
				module: self.name().to_owned(),
				registration: network.registration,
				operator: network.operator.clone(),
			})
		};
		
		if let Some(event) = event {
			self.emit(event);
		}
		
		Ok(())
	}
	
	fn postponed_configuration(&self, comm: &Comm) -> Result<(), InitAbort> {
		let timeout = self.timing().request;
		
		expect_ok(comm, timeout, "AT+CSCB=0")?;
		
		if let Some(smsc) = &self.config().smsc {
			expect_ok(comm, timeout, format!("AT+CSCA=\"{smsc}\""))?;
		}
		
		Ok(())
	}
}
