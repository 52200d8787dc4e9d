use log::{debug, info, warn};

use crate::{
	comm::{Urc, UrcKind, fields::{fields, number}},
	event::{Event, SmsKind},
	hex::decode_hex,
};

use super::{
	Module,
	ModuleStatus,
	calls::{Bearer, CallEvent, diff, parse_call_list},
	cause::ReleaseCause,
	network::{parse_cops, parse_creg},
};

impl Module {
	/// Runs on the channel's URC dispatch thread.
	pub(super) fn handle_urc(&self, urc: Urc) {
		match urc.kind {
			UrcKind::Ring => debug!("{}: RING", self.name()),
			UrcKind::Cring => self.incoming_ring(&urc),
			UrcKind::Clip => self.caller_id(&urc),
			UrcKind::Ccwa | UrcKind::NoCarrier => self.refresh_calls(),
			UrcKind::Ciev => self.indicator(&urc),
			UrcKind::Creg => self.registration_changed(&urc),
			UrcKind::Slcc => self.apply_call_list(&urc.lines),
			UrcKind::SysStart => self.booted(false),
			UrcKind::SysStartAirplane => self.booted(true),
			UrcKind::Shutdown => self.shut_down(),
			UrcKind::Scks => self.sim_presence(&urc),
			UrcKind::Cmt => self.sms(&urc, SmsKind::Deliver),
			UrcKind::Cds => self.sms(&urc, SmsKind::StatusReport),
			UrcKind::Cbm => self.sms(&urc, SmsKind::CellBroadcast),
			UrcKind::Cmti => self.sms_stored(&urc),
			UrcKind::Cssi | UrcKind::Cssu => info!("{}: supplementary service: {}", self.name(), urc.first_line()),
			UrcKind::Sbc => warn!("{}: power supply: {}", self.name(), urc.payload()),
			UrcKind::Sctm => self.temperature(&urc),
		}
	}
	
	fn incoming_ring(&self, urc: &Urc) {
		let bearer = Bearer::from_ring_type(urc.payload());
		let (status, caller) = {
			let state = self.lock();
			(state.status, state.caller_id.clone())
		};
		
		if status == ModuleStatus::Ready && bearer == Bearer::Voice {
			return self.emit(Event::Ring {
				module: self.name().to_owned(),
				bearer,
				caller,
			});
		}
		
		let total = {
			let mut state = self.lock();
			state.rejected_calls += 1;
			state.rejected_calls
		};
		
		info!("{}: rejecting {} call while {status}", self.name(), bearer.as_str());
		
		if let Some(comm) = self.comm() {
			comm.make_callback(self.timing().request, "AT+CHUP", self.watcher());
		}
		
		self.emit(Event::CallRejected {
			module: self.name().to_owned(),
			bearer,
			total,
		});
	}
	
	fn caller_id(&self, urc: &Urc) {
		let number = fields(urc.first_line(), "+CLIP:")
			.and_then(|fields| fields.into_iter().next())
			.filter(|number| !number.is_empty());
		
		debug!("{}: caller id {number:?}", self.name());
		self.lock().caller_id = number;
	}
	
	fn indicator(&self, urc: &Urc) {
		if urc.payload().starts_with("call") {
			self.refresh_calls();
		} else {
			debug!("{}: indicator {}", self.name(), urc.payload());
		}
	}
	
	fn registration_changed(&self, urc: &Urc) {
		let Some(update) = parse_creg(urc.first_line(), false) else {
			warn!("{}: unparsable {:?}", self.name(), urc.first_line());
			return;
		};
		
		let (changed, operator) = {
			let mut state = self.lock();
			let changed = state.network.update_registration(update);
			(changed, state.network.operator.clone())
		};
		
		if !changed {
			return;
		}
		
		info!("{}: registration {}", self.name(), update.registration);
		
		self.emit(Event::Network {
			module: self.name().to_owned(),
			registration: update.registration,
			operator,
		});
		
		if update.registration.is_registered() {
			self.query_operator();
		}
	}
	
	fn query_operator(&self) {
		let Some(comm) = self.comm() else {
			return;
		};
		
		let module = self.clone();
		
		comm.make_callback(self.timing().request, "AT+COPS?", move |request| {
			if request.status().is_comm_error() {
				module.failed(request.status(), "operator query");
				return;
			}
			
			let operator = request.lines()
				.iter()
				.find_map(|line| parse_cops(line))
				.flatten();
			
			let event = {
				let mut state = module.lock();
				
				if !state.network.registration.is_registered() || state.network.operator == operator {
					return;
				}
				
				state.network.operator = operator.clone();
				
				Event::Network {
					module: module.name().to_owned(),
					registration: state.network.registration,
					operator,
				}
			};
			
			module.emit(event);
		});
	}
	
	pub(super) fn refresh_calls(&self) {
		let Some(comm) = self.comm() else {
			return;
		};
		
		let module = self.clone();
		
		comm.make_callback(self.timing().request, "AT^SLCC", move |request| {
			if request.status().is_ok() {
				module.apply_call_list(&request.lines());
			} else {
				warn!("{}: call list refresh failed: {}", module.name(), request.status());
				
				if request.status().is_comm_error() {
					module.failed(request.status(), "call list refresh");
				}
			}
		});
	}
	
	/// Replaces the call slots wholesale and reports what changed.
	pub(super) fn apply_call_list(&self, lines: &[String]) {
		let slots = parse_call_list(lines);
		
		let (changes, released) = {
			let mut state = self.lock();
			let changes = diff(&state.calls, &slots);
			
			let released: Vec<(usize, Option<String>)> = changes.iter()
				.filter(|(_, event)| matches!(event, CallEvent::Released { .. }))
				.map(|(slot, _)| (*slot, state.calls[*slot].number.clone()))
				.collect();
			
			state.calls = slots.clone();
			
			if let Some(active) = state.active_call.filter(|active| !slots[*active].state.is_live()) {
				debug!("{}: active call in slot {active} is gone", self.name());
				state.active_call = None;
			}
			
			if state.active_call.is_none() {
				state.active_call = slots.iter().position(|slot| slot.channel_assigned && slot.state.is_live());
			}
			
			if slots.iter().all(|slot| !slot.state.is_live()) {
				state.caller_id = None;
			}
			
			(changes, released)
		};
		
		for (slot, event) in changes {
			if matches!(event, CallEvent::Released { .. }) {
				continue;
			}
			
			self.emit(Event::Call {
				module: self.name().to_owned(),
				slot,
				event,
				number: slots[slot].number.clone(),
			});
		}
		
		if !released.is_empty() {
			self.report_release(released);
		}
	}
	
	/// Asks the module why the calls ended before reporting them.
	fn report_release(&self, released: Vec<(usize, Option<String>)>) {
		let module = self.clone();
		let release = move |cause: Option<u16>| {
			for (slot, number) in &released {
				module.emit(Event::Call {
					module: module.name().to_owned(),
					slot: *slot,
					event: CallEvent::Released { cause },
					number: number.clone(),
				});
			}
		};
		
		let Some(comm) = self.comm() else {
			return release(None);
		};
		
		let module = self.clone();
		
		comm.make_callback(self.timing().request, "AT+CEER", move |request| {
			if request.status().is_comm_error() {
				module.failed(request.status(), "release cause query");
			}
			
			let cause = request.lines()
				.iter()
				.find_map(|line| ReleaseCause::parse(line))
				.map(|cause| cause.pbx_cause());
			
			release(cause);
		});
	}
	
	fn booted(&self, airplane_mode: bool) {
		let status = self.status();
		
		if matches!(status, ModuleStatus::Unconfigured | ModuleStatus::Closed | ModuleStatus::Off | ModuleStatus::PoweringOff) {
			debug!("{}: ignoring start up message while {status}", self.name());
			return;
		}
		
		if airplane_mode {
			warn!("{}: module started in airplane mode, disabling service", self.name());
			self.lock().service_enabled = false;
		}
		
		let reason = if status.awaits_boot() {
			"module started"
		} else {
			warn!("{}: module restarted while {status}", self.name());
			"module restarted unexpectedly"
		};
		
		self.set_status(ModuleStatus::WaitingInitialization, Some(self.timing().initialization_delay), reason);
	}
	
	fn shut_down(&self) {
		match self.status() {
			ModuleStatus::PoweringOff => {
				self.close_comm();
				self.set_status(ModuleStatus::Off, None, "module shut down");
			},
			ModuleStatus::Off => {},
			status => {
				warn!("{}: module shut down while {status}", self.name());
				self.set_status(ModuleStatus::Failed, Some(self.timing().failed_retry), "unexpected shutdown");
			},
		}
	}
	
	fn sim_presence(&self, urc: &Urc) {
		let inserted = match urc.payload() {
			"0" => false,
			"1" => true,
			other => {
				warn!("{}: unknown SIM presence {other:?}", self.name());
				return;
			},
		};
		
		{
			let mut state = self.lock();
			state.sim.inserted = Some(inserted);
			
			if !inserted {
				state.sim.imsi = None;
				state.sim.iccid = None;
			}
		}
		
		if inserted {
			self.set_status_if(
				&[ModuleStatus::WaitingSim],
				ModuleStatus::WaitingInitialization,
				Some(self.timing().initialization_delay),
				"SIM inserted",
			);
		} else {
			self.set_status_if(
				&[ModuleStatus::Initializing, ModuleStatus::Ready, ModuleStatus::Offline, ModuleStatus::WaitingPin],
				ModuleStatus::WaitingSim,
				None,
				"SIM removed",
			);
		}
	}
	
	fn sms(&self, urc: &Urc, kind: SmsKind) {
		let Some(pdu) = urc.lines.get(1) else {
			warn!("{}: {kind:?} without PDU", self.name());
			return;
		};
		
		match decode_hex(pdu) {
			Ok(pdu) => self.emit(Event::Sms {
				module: self.name().to_owned(),
				kind,
				pdu,
			}),
			Err(err) => warn!("{}: dropping {kind:?} with bad PDU: {err}", self.name()),
		}
	}
	
	fn sms_stored(&self, urc: &Urc) {
		let Some(fields) = fields(urc.first_line(), "+CMTI:") else {
			return;
		};
		
		let (Some(storage), Some(index)) = (fields.first(), number(&fields, 1)) else {
			warn!("{}: unparsable {:?}", self.name(), urc.first_line());
			return;
		};
		
		self.emit(Event::SmsStored {
			module: self.name().to_owned(),
			storage: storage.clone(),
			index,
		});
	}
	
	fn temperature(&self, urc: &Urc) {
		match urc.payload() {
			"0" => info!("{}: temperature back to normal", self.name()),
			level => warn!("{}: temperature warning, level {level}", self.name()),
		}
	}
}
