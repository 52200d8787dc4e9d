//! Unsolicited result codes.
//!
//! Every URC the module can send is listed once in [`URC_CLASSES`]. Lookup
//! picks the longest matching prefix, so `^SYSSTART AIRPLANE MODE` wins over
//! `^SYSSTART` regardless of where either sits in the table.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrcKind {
	Ring,
	Cring,
	Clip,
	Ccwa,
	Creg,
	Ciev,
	NoCarrier,
	SysStart,
	SysStartAirplane,
	Shutdown,
	Scks,
	Slcc,
	Cmt,
	Cmti,
	Cds,
	Cbm,
	Cssi,
	Cssu,
	Sbc,
	Sctm,
}

pub struct UrcClass {
	pub prefix: &'static str,
	pub kind: UrcKind,
	/// `None` for single line URCs. Otherwise called after every line
	/// (including the first) until it returns true.
	pub detect_end: Option<fn(&Urc) -> bool>,
}

pub static URC_CLASSES: &[UrcClass] = &[
	UrcClass { prefix: "RING", kind: UrcKind::Ring, detect_end: None },
	UrcClass { prefix: "+CRING:", kind: UrcKind::Cring, detect_end: None },
	UrcClass { prefix: "+CLIP:", kind: UrcKind::Clip, detect_end: None },
	UrcClass { prefix: "+CCWA:", kind: UrcKind::Ccwa, detect_end: None },
	UrcClass { prefix: "+CREG:", kind: UrcKind::Creg, detect_end: None },
	UrcClass { prefix: "+CIEV:", kind: UrcKind::Ciev, detect_end: None },
	UrcClass { prefix: "NO CARRIER", kind: UrcKind::NoCarrier, detect_end: None },
	UrcClass { prefix: "^SYSSTART", kind: UrcKind::SysStart, detect_end: None },
	UrcClass { prefix: "^SYSSTART AIRPLANE MODE", kind: UrcKind::SysStartAirplane, detect_end: None },
	UrcClass { prefix: "^SHUTDOWN", kind: UrcKind::Shutdown, detect_end: None },
	UrcClass { prefix: "^SCKS:", kind: UrcKind::Scks, detect_end: None },
	UrcClass { prefix: "^SLCC:", kind: UrcKind::Slcc, detect_end: Some(slcc_list_end) },
	UrcClass { prefix: "+CMT:", kind: UrcKind::Cmt, detect_end: Some(pdu_follows) },
	UrcClass { prefix: "+CMTI:", kind: UrcKind::Cmti, detect_end: None },
	UrcClass { prefix: "+CDS:", kind: UrcKind::Cds, detect_end: Some(pdu_follows) },
	UrcClass { prefix: "+CBM:", kind: UrcKind::Cbm, detect_end: Some(pdu_follows) },
	UrcClass { prefix: "+CSSI:", kind: UrcKind::Cssi, detect_end: None },
	UrcClass { prefix: "+CSSU:", kind: UrcKind::Cssu, detect_end: None },
	UrcClass { prefix: "^SBC:", kind: UrcKind::Sbc, detect_end: None },
	UrcClass { prefix: "^SCTM_B:", kind: UrcKind::Sctm, detect_end: None },
];

/// A fully collected URC.
#[derive(Clone, PartialEq, Eq)]
pub struct Urc {
	pub kind: UrcKind,
	pub lines: Vec<String>,
	prefix: &'static str,
}

fn pdu_follows(urc: &Urc) -> bool {
	urc.lines.len() >= 2
}

fn slcc_list_end(urc: &Urc) -> bool {
	urc.lines.last()
		.map_or(false, |line| line.trim_end() == "^SLCC:")
}

pub fn classify(line: &str) -> Option<&'static UrcClass> {
	URC_CLASSES.iter()
		.filter(|class| line.starts_with(class.prefix))
		.max_by_key(|class| class.prefix.len())
}

/// True if `line` carries the response prefix of `command`, e.g. `+CREG: 0,1`
/// for `AT+CREG?`. Such a line belongs to the command even if it also looks
/// like a URC. Set commands like `AT+CREG=2` only claim lines that are not
/// URCs, so a registration change reported meanwhile still gets through.
pub fn answers(command: &str, line: &str) -> bool {
	let Some(rest) = command.get(2..).filter(|_| command[..2].eq_ignore_ascii_case("AT")) else {
		return false;
	};
	
	let Some(sigil) = rest.chars().next().filter(|c| *c == '+' || *c == '^') else {
		return false;
	};
	
	let name: String = rest[1..].chars()
		.take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
		.collect();
	
	if name.is_empty() {
		return false;
	}
	
	let arguments = &rest[1 + name.len()..];
	let sets = arguments.starts_with('=') && !arguments.starts_with("=?");
	
	if sets && classify(line).is_some() {
		return false;
	}
	
	line.len() > name.len() + 1
		&& line.starts_with(sigil)
		&& line[1..].starts_with(name.to_ascii_uppercase().as_str())
		&& line[name.len() + 1..].starts_with(':')
}

impl Urc {
	pub fn new(class: &UrcClass, line: String) -> Self {
		Self {
			kind: class.kind,
			lines: vec![line],
			prefix: class.prefix,
		}
	}
	
	pub fn first_line(&self) -> &str {
		self.lines.first()
			.map_or("", String::as_str)
	}
	
	/// Text of the first line after the prefix.
	pub fn payload(&self) -> &str {
		self.first_line()
			.get(self.prefix.len()..)
			.unwrap_or("")
			.trim()
	}
}

impl fmt::Debug for Urc {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Urc({:?}, {} lines: {:?})", self.kind, self.lines.len(), self.first_line())
	}
}

/// A URC being collected line by line on the I/O thread.
pub(super) struct UrcCollector {
	urc: Urc,
	detect_end: Option<fn(&Urc) -> bool>,
}

impl UrcCollector {
	pub fn start(class: &'static UrcClass, line: String) -> Self {
		Self {
			urc: Urc::new(class, line),
			detect_end: class.detect_end,
		}
	}
	
	pub fn push(&mut self, line: String) {
		self.urc.lines.push(line);
	}
	
	pub fn is_complete(&self) -> bool {
		self.detect_end
			.map_or(true, |detect_end| detect_end(&self.urc))
	}
	
	pub fn finish(self) -> Urc {
		self.urc
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	
	#[test]
	fn longest_prefix_wins() {
		assert_eq!(classify("^SYSSTART").unwrap().kind, UrcKind::SysStart);
		assert_eq!(classify("^SYSSTART AIRPLANE MODE").unwrap().kind, UrcKind::SysStartAirplane);
		assert_eq!(classify("+CMTI: \"SM\",3").unwrap().kind, UrcKind::Cmti);
		assert_eq!(classify("+CMT: ,23").unwrap().kind, UrcKind::Cmt);
	}
	
	#[test]
	fn unknown_lines() {
		assert!(classify("Cinterion").is_none());
		assert!(classify("OK").is_none());
		assert!(classify("+CPIN: READY").is_none());
	}
	
	#[test]
	fn single_line_urc_is_complete() {
		let class = classify("+CREG: 1").unwrap();
		let collector = UrcCollector::start(class, "+CREG: 1".to_owned());
		
		assert!(collector.is_complete());
		assert_eq!(collector.finish().payload(), "1");
	}
	
	#[test]
	fn sms_urc_takes_two_lines() {
		let class = classify("+CMT: ,24").unwrap();
		let mut collector = UrcCollector::start(class, "+CMT: ,24".to_owned());
		assert!(!collector.is_complete());
		
		collector.push("07911326040000F0040B911346610089F60000208062917314080CC8F71D14969741F977FD07".to_owned());
		assert!(collector.is_complete());
		
		let urc = collector.finish();
		assert_eq!(urc.kind, UrcKind::Cmt);
		assert_eq!(urc.lines.len(), 2);
	}
	
	#[test]
	fn call_list_ends_with_empty_entry() {
		let class = classify("^SLCC: 1,0,0,0,0,1,\"123\",129").unwrap();
		let mut collector = UrcCollector::start(class, "^SLCC: 1,0,0,0,0,1,\"123\",129".to_owned());
		assert!(!collector.is_complete());
		
		collector.push("^SLCC: ".to_owned());
		assert!(collector.is_complete());
		
		let empty = UrcCollector::start(class, "^SLCC: ".to_owned());
		assert!(empty.is_complete());
	}
	
	#[test]
	fn command_response_prefixes() {
		assert!(answers("AT+CREG?", "+CREG: 0,1"));
		assert!(answers("at+creg?", "+CREG: 2,1,\"0A1B\",\"3C4D\""));
		assert!(answers("AT^SLCC", "^SLCC: 1,0,0,0,0,1"));
		assert!(!answers("AT+CREG?", "+CREGX: 1"));
		assert!(!answers("AT+CGMI", "+CREG: 1"));
		assert!(!answers("ATD123;", "+CREG: 1"));
		assert!(!answers("AT", "+CREG: 1"));
	}
	
	#[test]
	fn set_commands_leave_urcs_alone() {
		assert!(!answers("AT+CREG=2", "+CREG: 1"));
		assert!(!answers("AT^SCKS=1", "^SCKS: 0"));
		assert!(answers("AT+CREG=?", "+CREG: (0-2)"));
		assert!(answers("AT+CMGS=24", "+CMGS: 42"));
		assert!(answers("AT+CSQ", "+CSQ: 17,99"));
	}
}
