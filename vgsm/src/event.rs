//! Management events.
//!
//! Every event renders as a block of `Key: value` lines, the first naming
//! the event:
//!
//! ```text
//! Event: VGSMMeStatus
//! X-Module: gsm0
//! X-Status: READY
//! X-Previous-Status: INITIALIZING
//! X-Reason: initialized
//! ```

use std::{
	fmt::{self, Display},
	sync::{Mutex, mpsc::Sender},
};

use log::{info, warn};

use crate::module::{Bearer, CallEvent, ModuleStatus, Registration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsKind {
	Deliver,
	StatusReport,
	CellBroadcast,
}

impl SmsKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			SmsKind::Deliver => "DELIVER",
			SmsKind::StatusReport => "STATUS_REPORT",
			SmsKind::CellBroadcast => "CELL_BROADCAST",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	Status {
		module: String,
		status: ModuleStatus,
		previous: ModuleStatus,
		reason: String,
	},
	Network {
		module: String,
		registration: Registration,
		operator: Option<String>,
	},
	Call {
		module: String,
		slot: usize,
		event: CallEvent,
		number: Option<String>,
	},
	Ring {
		module: String,
		bearer: Bearer,
		caller: Option<String>,
	},
	CallRejected {
		module: String,
		bearer: Bearer,
		total: u32,
	},
	Sms {
		module: String,
		kind: SmsKind,
		pdu: Vec<u8>,
	},
	SmsStored {
		module: String,
		storage: String,
		index: u32,
	},
}

impl Event {
	pub fn name(&self) -> &'static str {
		match self {
			Event::Status { .. } => "VGSMMeStatus",
			Event::Network { .. } => "VGSMNetStatus",
			Event::Call { .. } => "VGSMCall",
			Event::Ring { .. } => "VGSMRing",
			Event::CallRejected { .. } => "VGSMCallRejected",
			Event::Sms { .. } => "VGSMSms",
			Event::SmsStored { .. } => "VGSMSmsStored",
		}
	}
	
	pub fn module(&self) -> &str {
		match self {
			Event::Status { module, .. }
			| Event::Network { module, .. }
			| Event::Call { module, .. }
			| Event::Ring { module, .. }
			| Event::CallRejected { module, .. }
			| Event::Sms { module, .. }
			| Event::SmsStored { module, .. } => module,
		}
	}
	
	/// The `X-` fields after `X-Module`.
	pub fn fields(&self) -> Vec<(&'static str, String)> {
		match self {
			Event::Status { status, previous, reason, .. } => vec![
				("X-Status", status.to_string()),
				("X-Previous-Status", previous.to_string()),
				("X-Reason", reason.clone()),
			],
			Event::Network { registration, operator, .. } => vec![
				("X-Registration", registration.to_string()),
				("X-Operator", operator.clone().unwrap_or_default()),
			],
			Event::Call { slot, event, number, .. } => {
				let mut fields = vec![
					("X-Slot", slot.to_string()),
					("X-Call-Event", event.as_str().to_owned()),
					("X-Number", number.clone().unwrap_or_default()),
				];
				
				if let CallEvent::Released { cause: Some(cause) } = event {
					fields.push(("X-Cause", cause.to_string()));
				}
				
				fields
			},
			Event::Ring { bearer, caller, .. } => vec![
				("X-Bearer", bearer.as_str().to_owned()),
				("X-Caller", caller.clone().unwrap_or_default()),
			],
			Event::CallRejected { bearer, total, .. } => vec![
				("X-Bearer", bearer.as_str().to_owned()),
				("X-Rejected-Total", total.to_string()),
			],
			Event::Sms { kind, pdu, .. } => vec![
				("X-Sms-Kind", kind.as_str().to_owned()),
				("X-Pdu", crate::hex::encode_hex(pdu)),
			],
			Event::SmsStored { storage, index, .. } => vec![
				("X-Storage", storage.clone()),
				("X-Index", index.to_string()),
			],
		}
	}
}

impl Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Event: {}\r\nX-Module: {}\r\n", self.name(), self.module())?;
		
		for (key, value) in self.fields() {
			write!(f, "{key}: {value}\r\n")?;
		}
		
		Ok(())
	}
}

/// Receives management events. Called with the module's status lock held,
/// so an implementation must not change the module's status.
pub trait EventSink: Send + Sync {
	fn emit(&self, event: &Event);
}

/// Writes events to the log on one line each.
pub struct LogSink;

impl EventSink for LogSink {
	fn emit(&self, event: &Event) {
		let fields: Vec<String> = event.fields()
			.into_iter()
			.map(|(key, value)| format!("{key}={value:?}"))
			.collect();
		
		info!("event {} [{}] {}", event.name(), event.module(), fields.join(" "));
	}
}

/// Forwards events to a receiver, dropping them once it is gone.
pub struct ChannelSink {
	sender: Mutex<Sender<Event>>,
}

impl ChannelSink {
	pub fn new(sender: Sender<Event>) -> Self {
		Self {
			sender: Mutex::new(sender),
		}
	}
}

impl EventSink for ChannelSink {
	fn emit(&self, event: &Event) {
		let sent = self.sender.lock()
			.expect("event sink lock poisoned")
			.send(event.clone());
		
		if sent.is_err() {
			warn!("event receiver gone, dropping {}", event.name());
		}
	}
}
