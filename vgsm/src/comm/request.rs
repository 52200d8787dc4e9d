use std::{
	fmt,
	sync::{Arc, Condvar, Mutex, MutexGuard},
	time::Duration,
};

use log::warn;

use super::response::ResponseCode;

/// Longest command line the module accepts, including the `AT` prefix.
pub const MAX_REQUEST_LENGTH: usize = 82;

pub type RequestHandle = Arc<Request>;

pub(super) type Continuation = Box<dyn FnOnce(&Request) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Queued,
	InFlight,
	Completed,
}

/// One AT transaction.
///
/// A request completes exactly once. Completion can be observed by blocking
/// in [`wait`](Self::wait), or through the continuation given to
/// `Comm::make_callback`, which the completion thread runs.
pub struct Request {
	id: u64,
	text: String,
	sms_pdu: Option<Vec<u8>>,
	timeout: Duration,
	outcome: Mutex<Outcome>,
	ready: Condvar,
	continuation: Mutex<Option<Continuation>>,
}

struct Outcome {
	phase: Phase,
	lines: Vec<String>,
	final_line: Option<String>,
	status: ResponseCode,
}

impl Request {
	pub(super) fn new(id: u64, text: String, timeout: Duration) -> Self {
		Self {
			id,
			text: clamp(text),
			sms_pdu: None,
			timeout,
			outcome: Mutex::new(Outcome {
				phase: Phase::Queued,
				lines: Vec::new(),
				final_line: None,
				status: ResponseCode::Unknown,
			}),
			ready: Condvar::new(),
			continuation: Mutex::new(None),
		}
	}
	
	pub(super) fn with_sms_pdu(mut self, pdu: Vec<u8>) -> Self {
		self.sms_pdu = Some(pdu);
		self
	}
	
	pub(super) fn with_continuation(self, continuation: Continuation) -> Self {
		*self.continuation.lock().expect("request lock poisoned") = Some(continuation);
		self
	}
	
	pub fn id(&self) -> u64 {
		self.id
	}
	
	pub fn text(&self) -> &str {
		&self.text
	}
	
	pub fn sms_pdu(&self) -> Option<&[u8]> {
		self.sms_pdu.as_deref()
	}
	
	pub fn timeout(&self) -> Duration {
		self.timeout
	}
	
	pub fn phase(&self) -> Phase {
		self.lock().phase
	}
	
	pub fn is_complete(&self) -> bool {
		self.phase() == Phase::Completed
	}
	
	/// The final status, `Unknown` until the request has completed.
	pub fn status(&self) -> ResponseCode {
		self.lock().status
	}
	
	/// Blocks until the request completes.
	pub fn wait(&self) -> ResponseCode {
		let mut outcome = self.lock();
		
		while outcome.phase != Phase::Completed {
			outcome = self.ready.wait(outcome)
				.expect("request lock poisoned");
		}
		
		outcome.status
	}
	
	/// Response lines, without echo and final result line.
	pub fn lines(&self) -> Vec<String> {
		self.lock().lines.clone()
	}
	
	pub fn first_line(&self) -> Option<String> {
		self.lock().lines.first().cloned()
	}
	
	pub fn last_line(&self) -> Option<String> {
		self.lock().lines.last().cloned()
	}
	
	/// The line that completed the request (`OK`, `+CME ERROR: 10`, ...).
	pub fn final_line(&self) -> Option<String> {
		self.lock().final_line.clone()
	}
	
	pub(super) fn set_in_flight(&self) {
		self.lock().phase = Phase::InFlight;
	}
	
	pub(super) fn push_line(&self, line: String) {
		self.lock().lines.push(line);
	}
	
	/// Records the result and wakes waiters. Returns the continuation, if
	/// any, for the caller to hand to the completion thread. Completing a
	/// completed request does nothing.
	pub(super) fn complete(&self, status: ResponseCode, final_line: Option<String>) -> Option<Continuation> {
		{
			let mut outcome = self.lock();
			
			if outcome.phase == Phase::Completed {
				return None;
			}
			
			outcome.phase = Phase::Completed;
			outcome.status = status;
			outcome.final_line = final_line;
		}
		
		self.ready.notify_all();
		
		self.continuation.lock()
			.expect("request lock poisoned")
			.take()
	}
	
	fn lock(&self) -> MutexGuard<'_, Outcome> {
		self.outcome.lock()
			.expect("request lock poisoned")
	}
}

fn clamp(mut text: String) -> String {
	if text.len() > MAX_REQUEST_LENGTH {
		warn!("request too long, truncating: {text}");
		
		let mut end = MAX_REQUEST_LENGTH;
		while !text.is_char_boundary(end) {
			end -= 1;
		}
		text.truncate(end);
	}
	
	text
}

impl fmt::Debug for Request {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Request({}, {:?}", self.id, self.text)?;
		
		if let Some(pdu) = &self.sms_pdu {
			write!(f, ", pdu.len: {}", pdu.len())?;
		}
		
		f.write_str(")")
	}
}
