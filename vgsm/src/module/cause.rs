use crate::comm::fields::{fields, number};

/// Location code of causes raised by the network's call control.
pub const LOCATION_CALL_CONTROL: u16 = 8;

pub const CAUSE_NORMAL_CLEARING: u16 = 16;

pub const CAUSE_NETWORK_OUT_OF_ORDER: u16 = 38;

/// Why the last call ended, as reported by `AT+CEER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseCause {
	pub location: u16,
	pub reason: u16,
}

impl ReleaseCause {
	/// `+CEER: <location>,<reason>,<ss release>`
	pub fn parse(line: &str) -> Option<Self> {
		let fields = fields(line, "+CEER:")?;
		
		Some(Self {
			location: number(&fields, 0)?,
			reason: number(&fields, 1)?,
		})
	}
	
	/// Q.850 cause to hand to the PBX.
	pub fn pbx_cause(&self) -> u16 {
		// TODO: translate the other location codes instead of lumping them
		// together
		match self.location {
			LOCATION_CALL_CONTROL => self.reason,
			_ => CAUSE_NETWORK_OUT_OF_ORDER,
		}
	}
}
