pub mod fields;
pub mod line_reader;
pub mod request;
pub mod response;
pub mod urc;

mod dispatch;
mod engine;

use std::{
	collections::VecDeque,
	fmt::Display,
	io::{self, ErrorKind, Read, Write},
	sync::{Arc, Mutex, MutexGuard, atomic::{AtomicBool, AtomicU64, Ordering}, mpsc::{self, Sender}},
	thread::{self, JoinHandle},
	time::Duration,
};

use log::{debug, warn};
use serialport::SerialPort;

use crate::no_timeout_reader::NoTimeoutReader;

use self::{
	dispatch::Completed,
	engine::{Engine, Event},
	line_reader::LineReader,
	request::Continuation,
};

pub use self::{
	request::{MAX_REQUEST_LENGTH, Phase, Request, RequestHandle},
	response::ResponseCode,
	urc::{Urc, UrcKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
	Closed,
	Closing,
	Failed,
	Recovering,
	Idle,
	ReadingUrc,
	AwaitingEcho,
	AwaitingEchoReadingUrc,
	AwaitingSmsEcho,
	AwaitingSmsEcho1A,
	ReadingResponse,
}

impl CommState {
	/// False once the channel is of no further use without being reopened
	/// or recovered.
	pub fn accepts_requests(&self) -> bool {
		!matches!(self, Self::Closed | Self::Closing | Self::Failed)
	}
}

/// Receives complete URCs on the channel's dispatch thread.
pub trait UrcHandler: Send + Sync {
	fn handle_urc(&self, urc: Urc);
}

impl<F> UrcHandler for F
	where F: Fn(Urc) + Send + Sync
{
	fn handle_urc(&self, urc: Urc) {
		self(urc)
	}
}

/// Both halves of a byte stream to a module.
pub struct Link {
	reader: Box<dyn Read + Send>,
	writer: Box<dyn Write + Send>,
	stop: Arc<AtomicBool>,
}

impl Link {
	pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
		Self {
			reader: Box::new(reader),
			writer: Box::new(writer),
			stop: Arc::default(),
		}
	}
	
	/// Splits a serial port. The port should be opened with a read timeout,
	/// which is how the reader notices the link being closed.
	pub fn serial(port: Box<dyn SerialPort>) -> io::Result<Self> {
		let stop = Arc::new(AtomicBool::new(false));
		let reader = NoTimeoutReader::new(port.try_clone()?, stop.clone());
		
		Ok(Self {
			reader: Box::new(reader),
			writer: Box::new(port),
			stop,
		})
	}
}

/// An AT command channel to one module.
///
/// Requests are written one at a time in submission order. Dropping the
/// channel closes it; requests still pending complete with `Failed`.
pub struct Comm {
	name: String,
	shared: Arc<Shared>,
	events: Sender<Event>,
	next_id: AtomicU64,
	stop: Arc<AtomicBool>,
	io_thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Shared {
	inner: Mutex<Inner>,
	completions: Sender<Completed>,
}

struct Inner {
	state: CommState,
	queue: VecDeque<RequestHandle>,
}

impl Comm {
	pub fn open(name: &str, link: Link, urc_handler: Arc<dyn UrcHandler>) -> io::Result<Self> {
		let Link { reader, writer, stop } = link;
		
		let (event_sender, event_receiver) = mpsc::channel();
		let (urc_sender, urc_receiver) = mpsc::channel();
		let (completion_sender, completion_receiver) = mpsc::channel();
		
		dispatch::spawn_urc_dispatch(name, urc_receiver, urc_handler)?;
		dispatch::spawn_completion_dispatch(name, completion_receiver)?;
		
		let shared = Arc::new(Shared {
			inner: Mutex::new(Inner {
				state: CommState::Idle,
				queue: VecDeque::new(),
			}),
			completions: completion_sender,
		});
		
		spawn_reader(name, reader, event_sender.clone())?;
		
		let engine = Engine::new(
			name.to_owned(),
			shared.clone(),
			event_receiver,
			event_sender.clone(),
			writer,
			urc_sender,
		);
		
		let io_thread = thread::Builder::new()
			.name(format!("<{name}:io>"))
			.spawn(move || engine.run())?;
		
		debug!("{name}: channel open");
		
		Ok(Self {
			name: name.to_owned(),
			shared,
			events: event_sender,
			next_id: AtomicU64::new(1),
			stop,
			io_thread: Mutex::new(Some(io_thread)),
		})
	}
	
	pub fn name(&self) -> &str {
		&self.name
	}
	
	pub fn state(&self) -> CommState {
		self.shared.state()
	}
	
	/// Number of requests waiting behind the one in flight.
	pub fn queued(&self) -> usize {
		self.shared.lock().queue.len()
	}
	
	/// Queues `text` and returns at once.
	pub fn make(&self, timeout: Duration, text: impl Display) -> RequestHandle {
		self.submit(Request::new(self.next_id(), text.to_string(), timeout))
	}
	
	/// Queues `text` and blocks until it completes.
	pub fn make_wait(&self, timeout: Duration, text: impl Display) -> RequestHandle {
		let request = self.make(timeout, text);
		request.wait();
		request
	}
	
	pub fn make_wait_result(&self, timeout: Duration, text: impl Display) -> ResponseCode {
		self.make(timeout, text).wait()
	}
	
	/// Queues `text`; `completion` runs on the completion thread once the
	/// request is done.
	pub fn make_callback<F>(&self, timeout: Duration, text: impl Display, completion: F) -> RequestHandle
		where F: FnOnce(&Request) + Send + 'static
	{
		let continuation: Continuation = Box::new(completion);
		let request = Request::new(self.next_id(), text.to_string(), timeout)
			.with_continuation(continuation);
		
		self.submit(request)
	}
	
	/// Two stage submit: `text` (normally `AT+CMGS=<len>`) is sent first, the
	/// PDU goes out as ASCII hex once the module prompts for it.
	pub fn make_sms(&self, timeout: Duration, pdu: &[u8], text: impl Display) -> RequestHandle {
		let request = Request::new(self.next_id(), text.to_string(), timeout)
			.with_sms_pdu(pdu.to_vec());
		
		self.submit(request)
	}
	
	/// `make_sms` with a continuation, as in `make_callback`.
	pub fn make_sms_callback<F>(&self, timeout: Duration, pdu: &[u8], text: impl Display, completion: F) -> RequestHandle
		where F: FnOnce(&Request) + Send + 'static
	{
		let continuation: Continuation = Box::new(completion);
		let request = Request::new(self.next_id(), text.to_string(), timeout)
			.with_sms_pdu(pdu.to_vec())
			.with_continuation(continuation);
		
		self.submit(request)
	}
	
	/// Asks a failed channel to resynchronise with the module instead of
	/// being reopened. Requests queued meanwhile go out once it succeeds.
	pub fn recover(&self) {
		{
			let mut inner = self.shared.lock();
			
			if inner.state != CommState::Failed {
				return;
			}
			
			inner.state = CommState::Recovering;
		}
		
		if self.events.send(Event::Recover).is_err() {
			self.shared.set_state(CommState::Failed);
		}
	}
	
	/// Closes the channel. Pending requests complete with `Failed`.
	pub fn close(&self) {
		self.stop.store(true, Ordering::SeqCst);
		
		let io_thread = self.io_thread.lock()
			.expect("comm lock poisoned")
			.take();
		
		let Some(io_thread) = io_thread else {
			return;
		};
		
		debug!("{}: closing channel", self.name);
		let _ = self.events.send(Event::Close);
		
		if io_thread.thread().id() != thread::current().id() {
			let _ = io_thread.join();
		}
	}
	
	fn next_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}
	
	fn submit(&self, request: Request) -> RequestHandle {
		let request = Arc::new(request);
		
		{
			let mut inner = self.shared.lock();
			
			if !inner.state.accepts_requests() {
				drop(inner);
				debug!("{}: {:?} refused, channel {:?}", self.name, request.text(), self.state());
				self.shared.complete(&request, ResponseCode::Failed, None);
				return request;
			}
			
			inner.queue.push_back(request.clone());
		}
		
		if self.events.send(Event::Kick).is_err() {
			warn!("{}: I/O thread gone", self.name);
			self.shared.complete(&request, ResponseCode::Failed, None);
		}
		
		request
	}
}

impl Drop for Comm {
	fn drop(&mut self) {
		self.close();
	}
}

impl Shared {
	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock()
			.expect("comm lock poisoned")
	}
	
	fn state(&self) -> CommState {
		self.lock().state
	}
	
	fn set_state(&self, state: CommState) {
		self.lock().state = state;
	}
	
	/// Completes `request` and queues its continuation, if any.
	fn complete(&self, request: &RequestHandle, status: ResponseCode, final_line: Option<String>) {
		let Some(continuation) = request.complete(status, final_line) else {
			return;
		};
		
		let completed = Completed {
			request: request.clone(),
			continuation,
		};
		
		if self.completions.send(completed).is_err() {
			warn!("completion dispatcher gone, dropping continuation of {request:?}");
		}
	}
}

fn spawn_reader(name: &str, reader: Box<dyn Read + Send>, events: Sender<Event>) -> io::Result<JoinHandle<()>> {
	let name = name.to_owned();
	
	thread::Builder::new()
		.name(format!("<{name}:rx>"))
		.spawn(move || {
			for line in LineReader::new(reader) {
				let event = match line {
					Ok(line) => Event::Line(line),
					Err(err) => {
						let _ = events.send(Event::ReadFailed(err));
						return;
					},
				};
				
				if events.send(event).is_err() {
					return;
				}
			}
			
			debug!("{name}: end of stream");
			let _ = events.send(Event::ReadFailed(ErrorKind::UnexpectedEof.into()));
		})
}
