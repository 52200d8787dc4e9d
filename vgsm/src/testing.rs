//! An in-process modem for tests.
//!
//! [`MockModem`] answers every command through a closure, echoing it first
//! like a module with `ATE1`. A reply of `">"` is sent as the bare SMS
//! prompt. The PDU that follows is terminated by Ctrl-Z instead of CR and is
//! handed to the closure including the Ctrl-Z.

use std::{
	io::{self, ErrorKind, Read, Write},
	sync::{Arc, Mutex, atomic::{AtomicBool, AtomicUsize, Ordering}, mpsc::{self, Receiver, Sender}},
	thread,
};

use crate::{comm::Link, device::{Device, PowerState}};

pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

pub fn init_logging() {
	let _ = env_logger::builder()
		.is_test(true)
		.try_init();
}

/// Wraps a closure returning string slices into a [`Responder`].
pub fn responder<F, S>(respond: F) -> Responder
	where
		F: Fn(&str) -> Vec<S> + Send + Sync + 'static,
		S: Into<String>,
{
	Arc::new(move |command: &str| respond(command).into_iter().map(Into::into).collect())
}

pub struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.send(buf.to_vec())
			.map_err(|_| io::Error::from(ErrorKind::BrokenPipe))?;
		
		Ok(buf.len())
	}
	
	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

pub struct PipeReader {
	receiver: Receiver<Vec<u8>>,
	chunk: Vec<u8>,
	position: usize,
}

impl Read for PipeReader {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if self.position == self.chunk.len() {
			match self.receiver.recv() {
				Ok(chunk) => {
					self.chunk = chunk;
					self.position = 0;
				},
				// writer gone
				Err(_) => return Ok(0),
			}
		}
		
		let len = buf.len().min(self.chunk.len() - self.position);
		buf[..len].copy_from_slice(&self.chunk[self.position..self.position + len]);
		self.position += len;
		Ok(len)
	}
}

pub fn pipe() -> (PipeWriter, PipeReader) {
	let (sender, receiver) = mpsc::channel();
	
	let reader = PipeReader {
		receiver,
		chunk: Vec::new(),
		position: 0,
	};
	
	(PipeWriter(sender), reader)
}

pub struct MockModem {
	link: Mutex<Option<Link>>,
	to_host: Arc<Mutex<Option<PipeWriter>>>,
	received: Arc<Mutex<Vec<String>>>,
}

impl MockModem {
	pub fn start<F, S>(respond: F) -> Self
		where
			F: Fn(&str) -> Vec<S> + Send + Sync + 'static,
			S: Into<String>,
	{
		Self::with_responder(responder(respond))
	}
	
	/// A modem with `ATE0`: replies come without the command echoed first.
	pub fn without_echo<F, S>(respond: F) -> Self
		where
			F: Fn(&str) -> Vec<S> + Send + Sync + 'static,
			S: Into<String>,
	{
		Self::build(responder(respond), false)
	}
	
	pub fn with_responder(respond: Responder) -> Self {
		Self::build(respond, true)
	}
	
	fn build(respond: Responder, echo: bool) -> Self {
		let (host_writer, commands) = pipe();
		let (modem_writer, host_reader) = pipe();
		
		let to_host = Arc::new(Mutex::new(Some(modem_writer)));
		let received = Arc::new(Mutex::new(Vec::new()));
		
		{
			let to_host = to_host.clone();
			let received = received.clone();
			thread::spawn(move || simulate(commands, to_host, received, respond, echo));
		}
		
		Self {
			link: Mutex::new(Some(Link::new(host_reader, host_writer))),
			to_host,
			received,
		}
	}
	
	/// The host's end. Can only be taken once.
	pub fn link(&self) -> Link {
		self.link.lock()
			.unwrap()
			.take()
			.expect("link already taken")
	}
	
	/// Commands seen so far, in order.
	pub fn received(&self) -> Vec<String> {
		self.received.lock().unwrap().clone()
	}
	
	/// Sends unsolicited lines.
	pub fn inject(&self, lines: &[&str]) {
		let mut bytes = String::new();
		
		for line in lines {
			bytes.push_str(&format!("\r\n{line}\r\n"));
		}
		
		send(&self.to_host, bytes.as_bytes());
	}
	
	/// Drops the modem's end, so the host reads end of stream.
	pub fn hang_up(&self) {
		self.to_host.lock().unwrap().take();
	}
}

fn send(to_host: &Mutex<Option<PipeWriter>>, bytes: &[u8]) {
	if let Some(writer) = to_host.lock().unwrap().as_mut() {
		let _ = writer.write_all(bytes);
	}
}

fn simulate(
	mut commands: PipeReader,
	to_host: Arc<Mutex<Option<PipeWriter>>>,
	received: Arc<Mutex<Vec<String>>>,
	respond: Responder,
	echo: bool,
) {
	let mut command = Vec::new();
	let mut byte = [0; 1];
	
	while let Ok(1) = commands.read(&mut byte) {
		match byte[0] {
			b'\r' => {},
			0x1a => command.push(0x1a),
			b'\n' => continue,
			other => {
				command.push(other);
				continue;
			},
		}
		
		let text = String::from_utf8_lossy(&command)
			.trim_start_matches('\u{1b}')
			.to_owned();
		command.clear();
		
		if text.is_empty() {
			continue;
		}
		
		received.lock().unwrap().push(text.clone());
		
		let mut reply = if echo {
			format!("{text}\r\n")
		} else {
			String::new()
		};
		
		for line in respond(&text) {
			if line == ">" {
				reply.push_str("\r\n> ");
			} else {
				reply.push_str(&format!("\r\n{line}\r\n"));
			}
		}
		
		send(&to_host, reply.as_bytes());
	}
	
	to_host.lock().unwrap().take();
}

/// A device whose every `open` starts a fresh [`MockModem`] with the same
/// responder.
pub struct MockDevice {
	respond: Responder,
	modem: Mutex<Option<Arc<MockModem>>>,
	power_control: bool,
	powered: AtomicBool,
	boots_on_ignition: bool,
	pub opens: AtomicUsize,
	pub ignitions: AtomicUsize,
	pub emergency_offs: AtomicUsize,
}

impl MockDevice {
	/// Always powered, no power control.
	pub fn new(respond: Responder) -> Arc<Self> {
		Arc::new(Self::build(respond, false, true, true))
	}
	
	/// Starts switched off. `boots_on_ignition` decides whether igniting it
	/// helps.
	pub fn with_power_control(respond: Responder, boots_on_ignition: bool) -> Arc<Self> {
		Arc::new(Self::build(respond, true, false, boots_on_ignition))
	}
	
	fn build(respond: Responder, power_control: bool, powered: bool, boots_on_ignition: bool) -> Self {
		Self {
			respond,
			modem: Mutex::new(None),
			power_control,
			powered: AtomicBool::new(powered),
			boots_on_ignition,
			opens: AtomicUsize::new(0),
			ignitions: AtomicUsize::new(0),
			emergency_offs: AtomicUsize::new(0),
		}
	}
	
	/// The modem behind the latest `open`.
	pub fn modem(&self) -> Arc<MockModem> {
		self.modem.lock()
			.unwrap()
			.clone()
			.expect("device never opened")
	}
}

impl Device for MockDevice {
	fn describe(&self) -> String {
		"mock".to_owned()
	}
	
	fn open(&self) -> io::Result<Link> {
		self.opens.fetch_add(1, Ordering::SeqCst);
		
		let modem = Arc::new(MockModem::with_responder(self.respond.clone()));
		let link = modem.link();
		*self.modem.lock().unwrap() = Some(modem);
		
		Ok(link)
	}
	
	fn has_power_control(&self) -> bool {
		self.power_control
	}
	
	fn power_state(&self) -> io::Result<PowerState> {
		match self.powered.load(Ordering::SeqCst) {
			true => Ok(PowerState::On),
			false => Ok(PowerState::Off),
		}
	}
	
	fn ignite(&self) -> io::Result<()> {
		self.ignitions.fetch_add(1, Ordering::SeqCst);
		
		if self.boots_on_ignition {
			self.powered.store(true, Ordering::SeqCst);
		}
		
		Ok(())
	}
	
	fn emergency_off(&self) -> io::Result<()> {
		self.emergency_offs.fetch_add(1, Ordering::SeqCst);
		self.powered.store(false, Ordering::SeqCst);
		Ok(())
	}
}
