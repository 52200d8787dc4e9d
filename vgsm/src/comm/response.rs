use std::fmt::{self, Display};

/// Final result of an AT transaction, as surfaced to callers.
///
/// `code()` maps into the numeric space shared with the management layer:
/// 0-6 for the plain result codes, 100-102 for local conditions, 1000+n for
/// `+CME ERROR: n` and 2000+n for `+CMS ERROR: n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
	Ok,
	Connect,
	NoCarrier,
	Error,
	NoDialtone,
	Busy,
	NoAnswer,
	Unknown,
	Timeout,
	Failed,
	CmeError(u16),
	CmsError(u16),
}

pub const CME_SIM_NOT_INSERTED: u16 = 10;
pub const CME_SIM_PIN_REQUIRED: u16 = 11;
pub const CME_SIM_PUK_REQUIRED: u16 = 12;
pub const CME_SIM_FAILURE: u16 = 13;
pub const CME_SIM_BUSY: u16 = 14;
pub const CME_INCORRECT_PASSWORD: u16 = 16;
pub const CME_INIT_IN_PROGRESS: u16 = 515;

const PLAIN: [(&str, ResponseCode); 7] = [
	("OK", ResponseCode::Ok),
	("CONNECT", ResponseCode::Connect),
	("NO CARRIER", ResponseCode::NoCarrier),
	("ERROR", ResponseCode::Error),
	("NO DIALTONE", ResponseCode::NoDialtone),
	("BUSY", ResponseCode::Busy),
	("NO ANSWER", ResponseCode::NoAnswer),
];

impl ResponseCode {
	/// Recognises a final result line. `CONNECT` may carry a trailing rate
	/// (`CONNECT 9600`).
	pub fn parse_final(line: &str) -> Option<Self> {
		let line = line.trim_end();
		
		if let Some(code) = line.strip_prefix("+CME ERROR:") {
			return Some(Self::CmeError(parse_error_number(code)));
		}
		
		if let Some(code) = line.strip_prefix("+CMS ERROR:") {
			return Some(Self::CmsError(parse_error_number(code)));
		}
		
		if line.starts_with("CONNECT ") {
			return Some(Self::Connect);
		}
		
		PLAIN.iter()
			.find(|(text, _)| *text == line)
			.map(|(_, code)| *code)
	}
	
	pub fn code(&self) -> u32 {
		match *self {
			Self::Ok => 0,
			Self::Connect => 1,
			Self::NoCarrier => 2,
			Self::Error => 3,
			Self::NoDialtone => 4,
			Self::Busy => 5,
			Self::NoAnswer => 6,
			Self::Unknown => 100,
			Self::Timeout => 101,
			Self::Failed => 102,
			Self::CmeError(n) => 1000 + u32::from(n.min(999)),
			Self::CmsError(n) => 2000 + u32::from(n.min(999)),
		}
	}
	
	pub fn is_ok(&self) -> bool {
		*self == Self::Ok
	}
	
	/// Local communication problems, as opposed to something the module said.
	pub fn is_comm_error(&self) -> bool {
		matches!(self, Self::Timeout | Self::Failed)
	}
}

fn parse_error_number(text: &str) -> u16 {
	// verbose error mode (+CMEE=2) gives text instead of a number
	text.trim().parse().unwrap_or(999)
}

impl Display for ResponseCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unknown => f.write_str("UNKNOWN"),
			Self::Timeout => f.write_str("Communication TIMEOUT"),
			Self::Failed => f.write_str("Communication FAILED"),
			Self::CmeError(n) => write!(f, "+CME ERROR: {n}"),
			Self::CmsError(n) => write!(f, "+CMS ERROR: {n}"),
			plain => {
				let text = PLAIN.iter()
					.find(|(_, code)| code == plain)
					.map_or("UNKNOWN", |(text, _)| *text);
				f.write_str(text)
			},
		}
	}
}
