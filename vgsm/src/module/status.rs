use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
	/// Created but never started.
	Unconfigured,
	Closed,
	PoweringOn,
	WaitingInitialization,
	Initializing,
	Ready,
	Offline,
	WaitingSim,
	WaitingPin,
	Failed,
	Resetting,
	PoweringOff,
	Off,
}

impl ModuleStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ModuleStatus::Unconfigured => "UNCONFIGURED",
			ModuleStatus::Closed => "CLOSED",
			ModuleStatus::PoweringOn => "POWERING_ON",
			ModuleStatus::WaitingInitialization => "WAITING_INITIALIZATION",
			ModuleStatus::Initializing => "INITIALIZING",
			ModuleStatus::Ready => "READY",
			ModuleStatus::Offline => "OFFLINE",
			ModuleStatus::WaitingSim => "WAITING_SIM",
			ModuleStatus::WaitingPin => "WAITING_PIN",
			ModuleStatus::Failed => "FAILED",
			ModuleStatus::Resetting => "RESETTING",
			ModuleStatus::PoweringOff => "POWERING_OFF",
			ModuleStatus::Off => "OFF",
		}
	}
	
	/// A boot message from the module ends the wait in these.
	pub fn awaits_boot(&self) -> bool {
		matches!(self, ModuleStatus::PoweringOn | ModuleStatus::Resetting)
	}
}

impl Display for ModuleStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
