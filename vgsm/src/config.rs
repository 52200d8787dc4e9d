use std::{fmt::{self, Display}, time::Duration};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorSelection {
	Automatic,
	Manual(String),
	/// Manual, falling back to automatic if the operator is not available.
	ManualAutomatic(String),
}

impl Display for OperatorSelection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// format 2 is the numeric operator id
		match self {
			OperatorSelection::Automatic => f.write_str("0"),
			OperatorSelection::Manual(id) => write!(f, "1,2,\"{id}\""),
			OperatorSelection::ManualAutomatic(id) => write!(f, "4,2,\"{id}\""),
		}
	}
}

/// How long the lifecycle waits for things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
	pub request: Duration,
	pub power_on: Duration,
	pub initialization_delay: Duration,
	pub failed_retry: Duration,
	pub reset: Duration,
	pub power_off: Duration,
	pub refresh: Duration,
}

impl Default for Timing {
	fn default() -> Self {
		Self {
			request: Duration::from_secs(20),
			power_on: Duration::from_secs(10),
			initialization_delay: Duration::from_secs(3),
			failed_retry: Duration::from_secs(10),
			reset: Duration::from_secs(20),
			power_off: Duration::from_secs(15),
			refresh: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
	pub name: String,
	pub baud_rate: u32,
	pub pin: Option<String>,
	pub operator: OperatorSelection,
	pub smsc: Option<String>,
	/// Whether to register with the network once initialized. A module with
	/// service disabled goes `OFFLINE` instead of `READY`.
	pub service_enabled: bool,
	pub timing: Timing,
}

impl ModuleConfig {
	pub fn new(name: &str) -> Self {
		Self {
			name: name.to_owned(),
			baud_rate: DEFAULT_BAUD_RATE,
			pin: None,
			operator: OperatorSelection::Automatic,
			smsc: None,
			service_enabled: true,
			timing: Timing::default(),
		}
	}
	
	/// Builds a config from `key=value` arguments.
	pub fn from_args<'a>(name: &str, args: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
		let mut config = Self::new(name);
		
		for arg in args {
			let (key, value) = arg.split_once('=')
				.ok_or_else(|| ConfigError::MissingValue(arg.to_owned()))?;
			
			config.set(key.trim(), value.trim())?;
		}
		
		Ok(config)
	}
	
	pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
		let invalid = || ConfigError::InvalidValue {
			key: key.to_owned(),
			value: value.to_owned(),
		};
		
		match key {
			"name" if !value.is_empty() => self.name = value.to_owned(),
			"name" => return Err(invalid()),
			"baud" => self.baud_rate = value.parse().map_err(|_| invalid())?,
			"pin" if value.is_empty() => self.pin = None,
			"pin" if is_pin(value) => self.pin = Some(value.to_owned()),
			"pin" => return Err(invalid()),
			"operator" => self.operator = parse_operator(value).ok_or_else(invalid)?,
			"smsc" if value.is_empty() => self.smsc = None,
			"smsc" => self.smsc = Some(value.to_owned()),
			"service" => self.service_enabled = parse_bool(value).ok_or_else(invalid)?,
			"timeout" => self.timing.request = parse_seconds(value).ok_or_else(invalid)?,
			"refresh" => self.timing.refresh = parse_seconds(value).ok_or_else(invalid)?,
			_ => return Err(ConfigError::UnknownKey(key.to_owned())),
		}
		
		Ok(())
	}
}

pub fn is_pin(value: &str) -> bool {
	(4..=8).contains(&value.len()) && value.bytes().all(|byte| byte.is_ascii_digit())
}

fn parse_operator(value: &str) -> Option<OperatorSelection> {
	let is_id = |id: &str| (5..=6).contains(&id.len()) && id.bytes().all(|byte| byte.is_ascii_digit());
	
	match value.split_once(',') {
		_ if value == "auto" => Some(OperatorSelection::Automatic),
		None if is_id(value) => Some(OperatorSelection::Manual(value.to_owned())),
		Some((id, "auto")) if is_id(id) => Some(OperatorSelection::ManualAutomatic(id.to_owned())),
		_ => None,
	}
}

fn parse_bool(value: &str) -> Option<bool> {
	match value {
		"on" | "yes" | "true" | "1" => Some(true),
		"off" | "no" | "false" | "0" => Some(false),
		_ => None,
	}
}

fn parse_seconds(value: &str) -> Option<Duration> {
	value.parse()
		.ok()
		.filter(|seconds| *seconds > 0)
		.map(Duration::from_secs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	MissingValue(String),
	UnknownKey(String),
	InvalidValue {
		key: String,
		value: String,
	},
	DuplicateName(String),
}

impl Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::MissingValue(arg) => write!(f, "expected key=value, got `{arg}`"),
			ConfigError::UnknownKey(key) => write!(f, "unknown setting `{key}`"),
			ConfigError::InvalidValue { key, value } => write!(f, "invalid value `{value}` for `{key}`"),
			ConfigError::DuplicateName(name) => write!(f, "there already is a module called `{name}`"),
		}
	}
}

impl std::error::Error for ConfigError {}
