//! Call slots as reported by `AT^SLCC`.

use log::warn;

use crate::comm::fields::{fields, number};

pub const MAX_CALLS: usize = 4;

pub type CallSlots = [CallSlot; MAX_CALLS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
	#[default]
	Unused,
	Active,
	Held,
	Dialing,
	Alerting,
	Incoming,
	Waiting,
	Terminating,
	/// Hung up locally, not yet confirmed by a refresh.
	Dropped,
}

impl CallState {
	fn from_code(code: u8) -> Option<Self> {
		let state = match code {
			0 => CallState::Active,
			1 => CallState::Held,
			2 => CallState::Dialing,
			3 => CallState::Alerting,
			4 => CallState::Incoming,
			5 => CallState::Waiting,
			6 => CallState::Terminating,
			_ => return None,
		};
		
		Some(state)
	}
	
	pub fn is_live(&self) -> bool {
		!matches!(self, CallState::Unused | CallState::Terminating | CallState::Dropped)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
	#[default]
	Outgoing,
	Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bearer {
	Voice,
	Data,
	Fax,
	#[default]
	Unknown,
}

impl Bearer {
	fn from_code(code: u8) -> Self {
		match code {
			0 => Bearer::Voice,
			1 => Bearer::Data,
			2 => Bearer::Fax,
			_ => Bearer::Unknown,
		}
	}
	
	/// The service names of `+CRING`.
	pub fn from_ring_type(text: &str) -> Self {
		match text.trim() {
			"VOICE" => Bearer::Voice,
			"FAX" => Bearer::Fax,
			text if text.starts_with("REL") || text.starts_with("SYNC") || text.starts_with("ASYNC") => Bearer::Data,
			_ => Bearer::Unknown,
		}
	}
	
	pub fn as_str(&self) -> &'static str {
		match self {
			Bearer::Voice => "VOICE",
			Bearer::Data => "DATA",
			Bearer::Fax => "FAX",
			Bearer::Unknown => "UNKNOWN",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSlot {
	pub direction: Direction,
	pub state: CallState,
	pub bearer: Bearer,
	pub multiparty: bool,
	/// A traffic channel carries the call's audio.
	pub channel_assigned: bool,
	pub number: Option<String>,
}

/// Builds the slots from an `AT^SLCC` list. Slots the list does not mention
/// are unused.
pub fn parse_call_list(lines: &[String]) -> CallSlots {
	let mut slots = CallSlots::default();
	
	for line in lines {
		let Some(fields) = fields(line, "^SLCC:") else {
			continue;
		};
		
		if fields.is_empty() {
			continue;
		}
		
		let Some(index) = number::<usize>(&fields, 0).filter(|index| (1..=MAX_CALLS).contains(index)) else {
			warn!("call slot out of range: {line:?}");
			continue;
		};
		
		let Some(state) = number(&fields, 2).and_then(CallState::from_code) else {
			warn!("unknown call state: {line:?}");
			continue;
		};
		
		slots[index - 1] = CallSlot {
			direction: match number::<u8>(&fields, 1) {
				Some(1) => Direction::Incoming,
				_ => Direction::Outgoing,
			},
			state,
			bearer: number(&fields, 3).map_or(Bearer::Unknown, Bearer::from_code),
			multiparty: number::<u8>(&fields, 4) == Some(1),
			channel_assigned: number::<u8>(&fields, 5) == Some(1),
			number: fields.get(6).filter(|digits| !digits.is_empty()).cloned(),
		};
	}
	
	slots
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
	Incoming,
	Waiting,
	Dialing,
	Alerting,
	Answered,
	Held,
	Resumed,
	/// `cause` is the PBX cause, once known.
	Released {
		cause: Option<u16>,
	},
}

impl CallEvent {
	pub fn as_str(&self) -> &'static str {
		match self {
			CallEvent::Incoming => "INCOMING",
			CallEvent::Waiting => "WAITING",
			CallEvent::Dialing => "DIALING",
			CallEvent::Alerting => "ALERTING",
			CallEvent::Answered => "ANSWERED",
			CallEvent::Held => "HELD",
			CallEvent::Resumed => "RESUMED",
			CallEvent::Released { .. } => "RELEASED",
		}
	}
}

/// What happened to each slot between two refreshes.
pub fn diff(old: &CallSlots, new: &CallSlots) -> Vec<(usize, CallEvent)> {
	let mut events = Vec::new();
	
	for (slot, (old, new)) in old.iter().zip(new).enumerate() {
		let event = match (old.state, new.state) {
			(before, after) if before == after => None,
			// already reported when it was hung up
			(CallState::Dropped, _) => None,
			(before, _) if !before.is_live() && new.state.is_live() && new.state != CallState::Active => {
				match new.state {
					CallState::Incoming => Some(CallEvent::Incoming),
					CallState::Waiting => Some(CallEvent::Waiting),
					CallState::Dialing => Some(CallEvent::Dialing),
					CallState::Alerting => Some(CallEvent::Alerting),
					_ => None,
				}
			},
			(CallState::Dialing, CallState::Alerting) => Some(CallEvent::Alerting),
			(CallState::Held, CallState::Active) => Some(CallEvent::Resumed),
			(_, CallState::Active) => Some(CallEvent::Answered),
			(CallState::Active, CallState::Held) => Some(CallEvent::Held),
			(before, after) if before.is_live() && !after.is_live() => Some(CallEvent::Released { cause: None }),
			_ => None,
		};
		
		if let Some(event) = event {
			events.push((slot, event));
		}
	}
	
	events
}
