//! The I/O thread of a comm channel.
//!
//! The engine owns the write half of the link, the in-flight request and the
//! URC being collected. Everything reaches it as an [`Event`]: lines framed
//! by the reader thread, kicks after a submission, timer expiries and the
//! close request.

use std::{
	io::{self, Write},
	sync::{Arc, atomic::{AtomicU64, Ordering}, mpsc::{Receiver, RecvTimeoutError, Sender}},
	time::Duration,
};

use log::{debug, info, warn};

use crate::{hex::encode_hex, timer::{Timer, TimerSet}};

use super::{
	CommState,
	Shared,
	line_reader::Line,
	request::RequestHandle,
	response::ResponseCode,
	urc::{self, Urc, UrcCollector},
};

const CTRL_Z: u8 = 0x1a;
const ESC: u8 = 0x1b;
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const IDLE_WAIT: Duration = Duration::from_secs(3600);

// request ids start at 1, so 0 marks the recovery probe
const RECOVERY_PROBE: u64 = 0;

#[derive(Debug)]
pub(super) enum Event {
	Kick,
	Line(Line),
	ReadFailed(io::Error),
	Timeout(u64),
	Recover,
	Close,
}

pub(super) struct Engine {
	name: String,
	shared: Arc<Shared>,
	events: Receiver<Event>,
	writer: Box<dyn Write + Send>,
	urcs: Sender<Urc>,
	timers: TimerSet,
	timeout: Timer,
	armed: Arc<AtomicU64>,
	current: Option<RequestHandle>,
	urc: Option<UrcCollector>,
	resume: CommState,
}

impl Engine {
	pub fn new(
		name: String,
		shared: Arc<Shared>,
		events: Receiver<Event>,
		loopback: Sender<Event>,
		writer: Box<dyn Write + Send>,
		urcs: Sender<Urc>,
	) -> Self {
		let timers = TimerSet::new();
		let armed = Arc::new(AtomicU64::new(RECOVERY_PROBE));
		
		let timeout = {
			let armed = armed.clone();
			timers.timer(&format!("{name} request"), move || {
				// the engine is gone if this fails, nothing left to time out
				let _ = loopback.send(Event::Timeout(armed.load(Ordering::SeqCst)));
			})
		};
		
		Self {
			name,
			shared,
			events,
			writer,
			urcs,
			timers,
			timeout,
			armed,
			current: None,
			urc: None,
			resume: CommState::Idle,
		}
	}
	
	pub fn run(mut self) {
		debug!("{}: I/O thread running", self.name);
		
		loop {
			let wait = self.timers.next_deadline().unwrap_or(IDLE_WAIT);
			
			match self.events.recv_timeout(wait) {
				Ok(Event::Close) => break,
				Ok(event) => self.handle_event(event),
				Err(RecvTimeoutError::Timeout) => {},
				Err(RecvTimeoutError::Disconnected) => break,
			}
			
			self.timers.run();
			self.send_next();
		}
		
		self.shutdown();
		debug!("{}: I/O thread finished", self.name);
	}
	
	fn handle_event(&mut self, event: Event) {
		match event {
			Event::Kick => {},
			Event::Line(Line::Text(text)) => self.handle_text(text),
			Event::Line(Line::Prompt) => self.handle_prompt(),
			Event::ReadFailed(err) => self.fail(ResponseCode::Failed, &format!("read failed: {err}")),
			Event::Timeout(id) => self.handle_timeout(id),
			Event::Recover => self.recover(),
			Event::Close => {},
		}
	}
	
	fn state(&self) -> CommState {
		self.shared.state()
	}
	
	fn set_state(&self, state: CommState) {
		self.shared.set_state(state);
	}
	
	fn send_next(&mut self) {
		if self.current.is_some() {
			return;
		}
		
		let request = {
			let mut inner = self.shared.lock();
			
			if inner.state != CommState::Idle {
				return;
			}
			
			let Some(request) = inner.queue.pop_front() else {
				return;
			};
			
			inner.state = CommState::AwaitingEcho;
			request
		};
		
		debug!("{} -> {}", self.name, request.text());
		request.set_in_flight();
		
		self.armed.store(request.id(), Ordering::SeqCst);
		self.timeout.start_in(request.timeout());
		self.current = Some(request.clone());
		
		let mut line = request.text().as_bytes().to_vec();
		line.push(b'\r');
		
		if let Err(err) = self.write(&line) {
			self.fail(ResponseCode::Failed, &format!("write failed: {err}"));
		}
	}
	
	fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
		self.writer.write_all(bytes)?;
		self.writer.flush()
	}
	
	fn handle_text(&mut self, text: String) {
		debug!("{} <- {}", self.name, text);
		
		if let Some(collector) = self.urc.as_mut() {
			collector.push(text);
			
			if collector.is_complete() {
				self.finish_urc();
			}
			
			return;
		}
		
		match self.state() {
			CommState::Idle => self.unsolicited(text),
			CommState::AwaitingEcho => self.awaiting_echo(text),
			CommState::AwaitingSmsEcho => self.awaiting_sms_prompt(text),
			CommState::AwaitingSmsEcho1A => self.awaiting_pdu_echo(text),
			CommState::ReadingResponse => self.reading_response(text),
			CommState::Recovering => self.recovering(text),
			state => debug!("{}: dropping line in state {state:?}", self.name),
		}
	}
	
	fn unsolicited(&mut self, text: String) {
		if let Err(text) = self.try_start_urc(text) {
			warn!("{}: unexpected line: {text:?}", self.name);
		}
	}
	
	fn awaiting_echo(&mut self, text: String) {
		let Some(request) = self.current.clone() else {
			return self.unsolicited(text);
		};
		
		let next = if request.sms_pdu().is_some() {
			CommState::AwaitingSmsEcho
		} else {
			CommState::ReadingResponse
		};
		
		if text.trim().eq_ignore_ascii_case(request.text()) {
			self.set_state(next);
			return;
		}
		
		let Err(text) = self.try_start_urc(text) else {
			return;
		};
		
		// echo is off, this is already part of the response
		debug!("{}: no echo for {:?}", self.name, request.text());
		self.set_state(next);
		
		match next {
			CommState::AwaitingSmsEcho => self.awaiting_sms_prompt(text),
			_ => self.reading_response(text),
		}
	}
	
	fn awaiting_sms_prompt(&mut self, text: String) {
		if let Some(code) = ResponseCode::parse_final(&text) {
			return self.finish_request(code, Some(text));
		}
		
		if let Err(text) = self.try_start_urc(text) {
			debug!("{}: dropping {text:?} while waiting for prompt", self.name);
		}
	}
	
	fn handle_prompt(&mut self) {
		debug!("{} <- >", self.name);
		
		let state = match self.state() {
			CommState::AwaitingEchoReadingUrc => self.resume,
			state => state,
		};
		
		let pdu = match (state, &self.current) {
			(CommState::AwaitingSmsEcho | CommState::AwaitingEcho, Some(request)) => request.sms_pdu().map(encode_hex),
			_ => None,
		};
		
		let Some(pdu) = pdu else {
			warn!("{}: unexpected prompt", self.name);
			return;
		};
		
		debug!("{} -> {} bytes of PDU", self.name, pdu.len() / 2);
		
		let mut bytes = pdu.into_bytes();
		bytes.push(CTRL_Z);
		
		if let Err(err) = self.write(&bytes) {
			return self.fail(ResponseCode::Failed, &format!("write failed: {err}"));
		}
		
		// a URC being collected picks up where the request is once it ends
		if self.urc.is_some() {
			self.resume = CommState::AwaitingSmsEcho1A;
		} else {
			self.set_state(CommState::AwaitingSmsEcho1A);
		}
	}
	
	fn awaiting_pdu_echo(&mut self, text: String) {
		if let Some(code) = ResponseCode::parse_final(&text) {
			return self.finish_request(code, Some(text));
		}
		
		let Some(request) = self.current.clone() else {
			return;
		};
		
		if urc::answers(request.text(), &text) {
			self.set_state(CommState::ReadingResponse);
			request.push_line(text);
			return;
		}
		
		if self.try_start_urc(text).is_err() {
			// the PDU echo
			self.set_state(CommState::ReadingResponse);
		}
	}
	
	fn reading_response(&mut self, text: String) {
		let Some(request) = self.current.clone() else {
			return self.unsolicited(text);
		};
		
		if let Some(code) = ResponseCode::parse_final(&text) {
			return self.finish_request(code, Some(text));
		}
		
		if urc::answers(request.text(), &text) {
			request.push_line(text);
			return;
		}
		
		if let Err(text) = self.try_start_urc(text) {
			request.push_line(text);
		}
	}
	
	/// Diverts `text` to the URC path if it starts one. Hands the line back
	/// otherwise.
	fn try_start_urc(&mut self, text: String) -> Result<(), String> {
		let Some(class) = urc::classify(&text) else {
			return Err(text);
		};
		
		let collector = UrcCollector::start(class, text);
		
		if collector.is_complete() {
			self.dispatch(collector.finish());
			return Ok(());
		}
		
		self.resume = self.state();
		self.urc = Some(collector);
		
		match self.resume {
			CommState::Idle => self.set_state(CommState::ReadingUrc),
			CommState::AwaitingEcho => self.set_state(CommState::AwaitingEchoReadingUrc),
			_ => {},
		}
		
		Ok(())
	}
	
	fn finish_urc(&mut self) {
		let Some(collector) = self.urc.take() else {
			return;
		};
		
		self.set_state(self.resume);
		self.dispatch(collector.finish());
	}
	
	fn dispatch(&self, urc: Urc) {
		if self.urcs.send(urc).is_err() {
			warn!("{}: URC dispatcher gone", self.name);
		}
	}
	
	fn finish_request(&mut self, code: ResponseCode, final_line: Option<String>) {
		self.timeout.stop();
		
		let Some(request) = self.current.take() else {
			return;
		};
		
		self.set_state(CommState::Idle);
		self.shared.complete(&request, code, final_line);
	}
	
	fn handle_timeout(&mut self, id: u64) {
		if id == RECOVERY_PROBE && self.state() == CommState::Recovering {
			return self.fail(ResponseCode::Failed, "no answer to recovery probe");
		}
		
		let stale = self.current.as_ref()
			.map_or(true, |request| request.id() != id);
		
		if stale {
			return;
		}
		
		self.fail(ResponseCode::Timeout, "request timed out");
	}
	
	/// The line state is no longer trustworthy. The current request gets
	/// `code`, everything queued behind it gets `Failed`.
	fn fail(&mut self, code: ResponseCode, reason: &str) {
		warn!("{}: channel failed: {reason}", self.name);
		
		self.timeout.stop();
		self.urc = None;
		
		let drained: Vec<RequestHandle> = {
			let mut inner = self.shared.lock();
			inner.state = CommState::Failed;
			inner.queue.drain(..).collect()
		};
		
		if let Some(request) = self.current.take() {
			self.shared.complete(&request, code, None);
		}
		
		for request in drained {
			self.shared.complete(&request, ResponseCode::Failed, None);
		}
	}
	
	fn recover(&mut self) {
		if self.state() != CommState::Recovering {
			return;
		}
		
		info!("{}: trying to resynchronise", self.name);
		
		// ESC abandons a half written SMS
		if let Err(err) = self.write(&[ESC, b'\r', b'A', b'T', b'\r']) {
			return self.fail(ResponseCode::Failed, &format!("write failed: {err}"));
		}
		
		self.armed.store(RECOVERY_PROBE, Ordering::SeqCst);
		self.timeout.start_in(RECOVERY_TIMEOUT);
	}
	
	fn recovering(&mut self, text: String) {
		if ResponseCode::parse_final(&text) == Some(ResponseCode::Ok) {
			info!("{}: resynchronised", self.name);
			self.timeout.stop();
			self.set_state(CommState::Idle);
			return;
		}
		
		if let Err(text) = self.try_start_urc(text) {
			debug!("{}: dropping {text:?} while recovering", self.name);
		}
	}
	
	fn shutdown(&mut self) {
		self.set_state(CommState::Closing);
		self.timeout.stop();
		self.urc = None;
		
		let drained: Vec<RequestHandle> = self.shared.lock().queue.drain(..).collect();
		
		for request in self.current.take().into_iter().chain(drained) {
			self.shared.complete(&request, ResponseCode::Failed, None);
		}
		
		self.set_state(CommState::Closed);
	}
}
