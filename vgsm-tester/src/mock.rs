//! A GSM module on the bench.
//!
//! Answers the commands the daemon sends during initialization and call
//! handling. Lines typed on stdin go out as URCs. Lines starting with `!` are
//! scenarios instead: `!ring <number>`, `!drop`, `!sim in`, `!sim out`.

use std::{io, thread};
use std::io::Write;
use std::sync::Mutex;
use log::{debug, info, warn};
use serialport::SerialPort;
use crate::command_parser::{Command, Commands, CommandsError};
use io::ErrorKind::TimedOut;

const OPERATOR: &str = "vGSM bench";
const MAX_PIN_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
	Line(String),
	Prompt,
}

fn lines(lines: &[&str]) -> Vec<Output> {
	lines.iter()
		.map(|line| Output::Line((*line).to_owned()))
		.collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallStatus {
	Active = 0,
	Incoming = 4,
}

#[derive(Debug, Clone)]
struct Call {
	incoming: bool,
	status: CallStatus,
	number: String,
}

#[derive(Debug)]
pub struct Modem {
	pin: Option<String>,
	unlocked: bool,
	pin_attempts: u8,
	sim_inserted: bool,
	registered: bool,
	calls: Vec<Call>,
	pending_submit: bool,
	message_reference: u8,
}

impl Modem {
	/// With `pin` set the SIM starts locked.
	pub fn new(pin: Option<String>) -> Self {
		Self {
			unlocked: pin.is_none(),
			pin,
			pin_attempts: MAX_PIN_ATTEMPTS,
			sim_inserted: true,
			registered: true,
			calls: Vec::new(),
			pending_submit: false,
			message_reference: 0,
		}
	}
	
	pub fn respond(&mut self, command: &Command) -> Vec<Output> {
		match command {
			Command::Line(text) => self.respond_line(text),
			Command::Pdu(pdu) => self.submit(pdu),
		}
	}
	
	fn respond_line(&mut self, text: &str) -> Vec<Output> {
		let upper = text.to_ascii_uppercase();
		
		match upper.as_str() {
			"AT" | "ATZ" | "ATE0" | "ATE1" => lines(&["OK"]),
			"AT+CGMI" => lines(&["Cinterion", "OK"]),
			"AT+CGMM" => lines(&["MC55i", "OK"]),
			"AT+CGMR" => lines(&["REVISION 03.100", "OK"]),
			"AT+CGSN" => lines(&["351234567890123", "OK"]),
			"AT+CPIN?" => self.pin_state(),
			"AT^SPIC" => lines(&[format!("^SPIC: {}", self.pin_attempts).as_str(), "OK"]),
			"AT+CIMI" | "AT^SCID" if !self.sim_ready() => self.sim_error(),
			"AT+CIMI" => lines(&["222015602275180", "OK"]),
			"AT^SCID" => lines(&["^SCID: 89390100000000000000", "OK"]),
			"AT+CREG?" if self.registered => lines(&["+CREG: 2,1,\"0A1B\",\"3C4D\"", "OK"]),
			"AT+CREG?" => lines(&["+CREG: 2,0", "OK"]),
			"AT+COPS?" if self.registered => lines(&[format!("+COPS: 0,0,\"{OPERATOR}\"").as_str(), "OK"]),
			"AT+COPS?" => lines(&["+COPS: 2", "OK"]),
			"AT+CSQ" => lines(&["+CSQ: 18,99", "OK"]),
			"AT^SLCC" => self.call_list(),
			"AT+CEER" => lines(&["+CEER: 8,16,0", "OK"]),
			"ATA" => self.answer(),
			"AT+CHUP" => {
				self.calls.clear();
				lines(&["OK"])
			},
			"AT^SMSO" => lines(&["^SMSO: MS OFF", "OK", "^SHUTDOWN"]),
			"AT+CFUN=1,1" => lines(&["OK", "^SYSSTART"]),
			_ => self.respond_setting(text, &upper),
		}
	}
	
	fn respond_setting(&mut self, text: &str, upper: &str) -> Vec<Output> {
		if let Some(pin) = upper.strip_prefix("AT+CPIN=") {
			return self.enter_pin(pin);
		}
		
		if let Some(selection) = upper.strip_prefix("AT+COPS=") {
			self.registered = selection != "2";
			return lines(&["OK"]);
		}
		
		if let Some(number) = upper.strip_prefix("ATD") {
			return self.dial(&text[3..3 + number.len()]);
		}
		
		if upper.starts_with("AT+CMGS=") {
			if !self.registered {
				return lines(&["+CMS ERROR: 331"]);
			}
			
			self.pending_submit = true;
			return vec![Output::Prompt];
		}
		
		// every other setting is taken at face value
		if upper.starts_with("AT") && upper.contains('=') {
			return lines(&["OK"]);
		}
		
		warn!("unknown command `{text}`");
		lines(&["ERROR"])
	}
	
	fn sim_ready(&self) -> bool {
		self.sim_inserted && self.unlocked
	}
	
	fn sim_error(&self) -> Vec<Output> {
		match self.sim_inserted {
			true => lines(&["+CME ERROR: 11"]),
			false => lines(&["+CME ERROR: 10"]),
		}
	}
	
	fn pin_state(&self) -> Vec<Output> {
		if !self.sim_inserted {
			return self.sim_error();
		}
		
		match (self.unlocked, self.pin_attempts) {
			(true, _) => lines(&["+CPIN: READY", "OK"]),
			(false, 0) => lines(&["+CPIN: SIM PUK", "OK"]),
			(false, _) => lines(&["+CPIN: SIM PIN", "OK"]),
		}
	}
	
	fn enter_pin(&mut self, args: &str) -> Vec<Output> {
		let mut parts = args.split(',').map(|part| part.trim_matches('"'));
		let first = parts.next().unwrap_or_default();
		
		let accepted = match parts.next() {
			// PUK and new PIN
			Some(new_pin) if self.pin_attempts == 0 => {
				self.pin = Some(new_pin.to_owned());
				!first.is_empty()
			},
			Some(_) => false,
			None => self.pin_attempts > 0 && self.pin.as_deref() == Some(first),
		};
		
		if accepted {
			info!("SIM unlocked");
			self.unlocked = true;
			self.pin_attempts = MAX_PIN_ATTEMPTS;
			return lines(&["OK"]);
		}
		
		self.pin_attempts = self.pin_attempts.saturating_sub(1);
		info!("wrong PIN, {} attempts left", self.pin_attempts);
		lines(&["+CME ERROR: 16"])
	}
	
	fn call_list(&self) -> Vec<Output> {
		let mut output: Vec<Output> = self.calls.iter()
			.enumerate()
			.map(|(index, call)| Output::Line(format!(
				"^SLCC: {},{},{},0,0,{},\"{}\",129",
				index + 1,
				call.incoming as u8,
				call.status as u8,
				(call.status == CallStatus::Active) as u8,
				call.number,
			)))
			.collect();
		
		output.push(Output::Line("OK".to_owned()));
		output
	}
	
	fn answer(&mut self) -> Vec<Output> {
		let Some(call) = self.calls.iter_mut().find(|call| call.status == CallStatus::Incoming) else {
			return lines(&["NO CARRIER"]);
		};
		
		call.status = CallStatus::Active;
		lines(&["OK"])
	}
	
	fn dial(&mut self, number: &str) -> Vec<Output> {
		let number = number.trim_end_matches(';');
		
		if !self.registered || number.is_empty() {
			return lines(&["NO CARRIER"]);
		}
		
		info!("dialing {number}");
		
		self.calls.push(Call {
			incoming: false,
			status: CallStatus::Active,
			number: number.to_owned(),
		});
		
		lines(&["OK"])
	}
	
	fn submit(&mut self, pdu: &str) -> Vec<Output> {
		if !std::mem::take(&mut self.pending_submit) {
			warn!("PDU without AT+CMGS");
			return lines(&["ERROR"]);
		}
		
		info!("sending SMS PDU {pdu}");
		self.message_reference = self.message_reference.wrapping_add(1);
		lines(&[format!("+CMGS: {}", self.message_reference).as_str(), "OK"])
	}
	
	/// Runs a `!` scenario from stdin, returning the URCs to send.
	pub fn scenario(&mut self, scenario: &str) -> Option<Vec<String>> {
		let words: Vec<&str> = scenario.split_whitespace().collect();
		
		let urcs = match words.as_slice() {
			["ring", number] => {
				self.calls.push(Call {
					incoming: true,
					status: CallStatus::Incoming,
					number: (*number).to_owned(),
				});
				
				vec![format!("+CLIP: \"{number}\",129"), "+CRING: VOICE".to_owned(), "+CIEV: call,1".to_owned()]
			},
			["drop"] => {
				self.calls.clear();
				vec!["NO CARRIER".to_owned()]
			},
			["sim", "in"] => {
				self.sim_inserted = true;
				vec!["^SCKS: 1".to_owned()]
			},
			["sim", "out"] => {
				self.sim_inserted = false;
				self.unlocked = self.pin.is_none();
				vec!["^SCKS: 0".to_owned()]
			},
			_ => return None,
		};
		
		Some(urcs)
	}
}

fn render(outputs: &[Output]) -> Vec<u8> {
	let mut bytes = Vec::new();
	
	for output in outputs {
		match output {
			Output::Line(line) => bytes.extend_from_slice(format!("\r\n{line}\r\n").as_bytes()),
			Output::Prompt => bytes.extend_from_slice(b"\r\n> "),
		}
	}
	
	bytes
}

pub fn mock(port: Box<dyn SerialPort>, pin: Option<String>) -> io::Result<()> {
	let modem = Mutex::new(Modem::new(pin));
	let writer = port.try_clone()?;
	
	thread::scope(|s| {
		s.spawn(|| answer_commands(port, &modem));
		
		if let Err(err) = inject_urcs(writer, &modem) {
			warn!("couldn't read from stdin: {err}");
		}
		
		// easier than getting the thread to quit
		std::process::exit(0);
	});
	
	Ok(())
}

fn inject_urcs(mut writer: impl Write, modem: &Mutex<Modem>) -> io::Result<()> {
	for line in io::stdin().lines() {
		let line = line?;
		
		if line == "\\exit" {
			break;
		}
		
		let urcs = match line.strip_prefix('!') {
			Some(scenario) => match modem.lock().expect("modem lock poisoned").scenario(scenario) {
				Some(urcs) => urcs,
				None => {
					warn!("unknown scenario `{scenario}`");
					continue;
				},
			},
			None => vec![line],
		};
		
		for urc in &urcs {
			info!("<- {urc}");
		}
		
		let outputs: Vec<Output> = urcs.into_iter().map(Output::Line).collect();
		writer.write_all(&render(&outputs))?;
	}
	
	Ok(())
}

fn answer_commands(mut port: Box<dyn SerialPort>, modem: &Mutex<Modem>) {
	let reader = match port.try_clone() {
		Ok(reader) => reader,
		Err(err) => {
			warn!("couldn't clone serial port: {err}");
			return;
		},
	};
	
	for command_result in Commands::in_stream(reader) {
		let command = match command_result {
			Ok(command) => command,
			Err(CommandsError::IoError(TimedOut)) => continue,
			Err(CommandsError::LineTooLong) => {
				warn!("line too long, dropped");
				continue;
			},
			Err(CommandsError::IoError(kind)) => {
				warn!("io error occurred trying to read a command: {kind}");
				return;
			},
		};
		
		let (echo, outputs) = {
			let mut modem = modem.lock().expect("modem lock poisoned");
			
			let echo = match &command {
				Command::Line(text) | Command::Pdu(text) => text.clone(),
			};
			
			(echo, modem.respond(&command))
		};
		
		debug!("-> {echo}");
		info!("{echo}: {outputs:?}");
		
		let mut bytes = format!("{echo}\r\n").into_bytes();
		bytes.extend_from_slice(&render(&outputs));
		
		if let Err(err) = port.write_all(&bytes) {
			warn!("io error occurred trying to answer: {err}");
			return;
		}
	}
}
