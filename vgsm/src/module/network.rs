use std::fmt::{self, Display};

use crate::{comm::fields::{fields, number}, hex::parse_ascii_hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Registration {
	#[default]
	NotSearching,
	Home,
	Searching,
	Denied,
	Unknown,
	Roaming,
}

impl Registration {
	pub fn from_code(code: u8) -> Option<Self> {
		let registration = match code {
			0 => Registration::NotSearching,
			1 => Registration::Home,
			2 => Registration::Searching,
			3 => Registration::Denied,
			4 => Registration::Unknown,
			5 => Registration::Roaming,
			_ => return None,
		};
		
		Some(registration)
	}
	
	pub fn is_registered(&self) -> bool {
		matches!(self, Registration::Home | Registration::Roaming)
	}
	
	pub fn as_str(&self) -> &'static str {
		match self {
			Registration::NotSearching => "NOT_SEARCHING",
			Registration::Home => "HOME",
			Registration::Searching => "SEARCHING",
			Registration::Denied => "DENIED",
			Registration::Unknown => "UNKNOWN",
			Registration::Roaming => "ROAMING",
		}
	}
}

impl Display for Registration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What the module last told us about the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
	pub registration: Registration,
	pub lac: Option<u16>,
	pub cell_id: Option<u32>,
	pub operator: Option<String>,
	/// 0..=31, `None` while unknown.
	pub rssi: Option<u8>,
	pub ber: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationUpdate {
	pub registration: Registration,
	pub lac: Option<u16>,
	pub cell_id: Option<u32>,
}

impl NetworkInfo {
	/// Applies a `+CREG` update. Returns true if the registration state
	/// changed.
	pub fn update_registration(&mut self, update: RegistrationUpdate) -> bool {
		let changed = self.registration != update.registration;
		
		self.registration = update.registration;
		self.lac = update.lac;
		self.cell_id = update.cell_id;
		
		if !update.registration.is_registered() {
			self.operator = None;
		}
		
		changed
	}
}

/// Parses `+CREG`. The answer to `AT+CREG?` carries the URC mode in front
/// (`+CREG: 2,1,...`), the URC itself does not (`+CREG: 1,...`).
pub fn parse_creg(line: &str, solicited: bool) -> Option<RegistrationUpdate> {
	let fields = fields(line, "+CREG:")?;
	let offset = usize::from(solicited);
	
	let registration = Registration::from_code(number(&fields, offset)?)?;
	let lac = fields.get(offset + 1)
		.and_then(|lac| parse_ascii_hex::<u16>(lac.as_bytes()).ok());
	let cell_id = fields.get(offset + 2)
		.and_then(|cell_id| parse_ascii_hex::<u32>(cell_id.as_bytes()).ok());
	
	Some(RegistrationUpdate {
		registration,
		lac,
		cell_id,
	})
}

/// The operator name from `+COPS: 0,0,"name"`. `Some(None)` if the module
/// reports no operator.
pub fn parse_cops(line: &str) -> Option<Option<String>> {
	let fields = fields(line, "+COPS:")?;
	
	Some(fields.get(2).filter(|name| !name.is_empty()).cloned())
}

/// `+CSQ: <rssi>,<ber>`, 99 meaning unknown.
pub fn parse_csq(line: &str) -> Option<(Option<u8>, Option<u8>)> {
	let fields = fields(line, "+CSQ:")?;
	
	let known = |value: u8| (value != 99).then_some(value);
	let rssi = number(&fields, 0).map(known)?;
	let ber = number(&fields, 1).map(known)?;
	
	Some((rssi, ber))
}
