//! Where a module's byte stream and power switch come from.

use std::{io, time::Duration};

use crate::comm::Link;

// low timeout is necessary on windows because read only returns when the timeout runs out
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
	On,
	Off,
}

pub trait Device: Send + Sync {
	/// For log lines and `status`.
	fn describe(&self) -> String;
	
	fn open(&self) -> io::Result<Link>;
	
	/// Without power control `ignite` and `emergency_off` do nothing and the
	/// module always counts as powered.
	fn has_power_control(&self) -> bool {
		false
	}
	
	fn power_state(&self) -> io::Result<PowerState> {
		Ok(PowerState::On)
	}
	
	fn ignite(&self) -> io::Result<()> {
		Ok(())
	}
	
	fn emergency_off(&self) -> io::Result<()> {
		Ok(())
	}
}

/// A module behind a plain serial port.
pub struct SerialDevice {
	path: String,
	baud_rate: u32,
}

impl SerialDevice {
	pub fn new(path: &str, baud_rate: u32) -> Self {
		Self {
			path: path.to_owned(),
			baud_rate,
		}
	}
}

impl Device for SerialDevice {
	fn describe(&self) -> String {
		format!("{} @ {}", self.path, self.baud_rate)
	}
	
	fn open(&self) -> io::Result<Link> {
		let port = serialport::new(&self.path, self.baud_rate)
			.timeout(READ_TIMEOUT)
			.open()?;
		
		Link::serial(port)
	}
}

/// Names of the serial ports on this machine, with their kind.
pub fn available_ports() -> io::Result<Vec<(String, String)>> {
	let ports = serialport::available_ports()?
		.into_iter()
		.map(|port| (port.port_name, format!("{:?}", port.port_type)))
		.collect();
	
	Ok(ports)
}
