//! Ordered deadline lists.
//!
//! A [`TimerSet`] belongs to one owner (a module's monitor thread, or a comm
//! channel's I/O thread). The owner loops on [`TimerSet::wait`] and
//! [`TimerSet::run`]; everybody else only starts and stops [`Timer`]s.

use std::{
	fmt,
	sync::{Arc, Condvar, Mutex, atomic::{AtomicU64, Ordering}},
	time::{Duration, Instant},
};

use log::trace;

type Callback = Arc<dyn Fn() + Send + Sync>;
type Observer = Box<dyn Fn(&str, TimerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
	Started,
	Stopped,
}

#[derive(Clone)]
pub struct TimerSet {
	inner: Arc<Inner>,
}

struct Inner {
	state: Mutex<State>,
	wakeup: Condvar,
	next_id: AtomicU64,
	// called with the set locked, must not touch the set
	observer: Option<Observer>,
}

#[derive(Default)]
struct State {
	entries: Vec<Entry>,
	kicked: bool,
}

struct Entry {
	id: u64,
	expiry: Instant,
	name: Arc<str>,
	callback: Callback,
}

/// A timer bound to the set that created it.
#[derive(Clone)]
pub struct Timer {
	id: u64,
	name: Arc<str>,
	callback: Callback,
	set: TimerSet,
}

impl TimerSet {
	pub fn new() -> Self {
		Self::build(None)
	}
	
	/// Like `new`, but `observer` is told about every start and stop, before
	/// the list is modified.
	pub fn with_observer<F>(observer: F) -> Self
		where F: Fn(&str, TimerEvent) + Send + Sync + 'static
	{
		Self::build(Some(Box::new(observer)))
	}
	
	fn build(observer: Option<Observer>) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::default(),
				wakeup: Condvar::new(),
				next_id: AtomicU64::new(1),
				observer,
			}),
		}
	}
	
	pub fn timer<F>(&self, name: &str, callback: F) -> Timer
		where F: Fn() + Send + Sync + 'static
	{
		Timer {
			id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
			name: name.into(),
			callback: Arc::new(callback),
			set: self.clone(),
		}
	}
	
	/// (Re)starts `timer`. Returns `false` if it was already pending with
	/// exactly this expiry, in which case nothing changes.
	pub fn start(&self, timer: &Timer, expiry: Instant) -> bool {
		let mut state = self.lock();
		
		if let Some(index) = state.position(timer.id) {
			if state.entries[index].expiry == expiry {
				return false;
			}
			
			self.notify(&timer.name, TimerEvent::Stopped);
			state.entries.remove(index);
		}
		
		self.notify(&timer.name, TimerEvent::Started);
		
		let entry = Entry {
			id: timer.id,
			expiry,
			name: timer.name.clone(),
			callback: timer.callback.clone(),
		};
		
		let at_tail = state.entries.last()
			.map_or(true, |last| expiry >= last.expiry);
		
		if at_tail {
			state.entries.push(entry);
		} else {
			let index = state.entries.iter()
				.position(|other| other.expiry > expiry)
				.unwrap_or(state.entries.len());
			state.entries.insert(index, entry);
		}
		
		drop(state);
		self.inner.wakeup.notify_all();
		
		true
	}
	
	pub fn stop(&self, timer: &Timer) {
		let mut state = self.lock();
		
		if let Some(index) = state.position(timer.id) {
			self.notify(&timer.name, TimerEvent::Stopped);
			state.entries.remove(index);
			drop(state);
			self.inner.wakeup.notify_all();
		}
	}
	
	pub fn is_pending(&self, timer: &Timer) -> bool {
		self.lock().position(timer.id).is_some()
	}
	
	pub fn expiry(&self, timer: &Timer) -> Option<Instant> {
		let state = self.lock();
		state.position(timer.id)
			.map(|index| state.entries[index].expiry)
	}
	
	/// Fires every timer that is due, earliest first. Callbacks run without
	/// the set locked and may start or stop timers, so the scan restarts from
	/// the head after each one.
	pub fn run(&self) {
		loop {
			let mut state = self.lock();
			
			let due = state.entries.first()
				.map_or(false, |head| head.expiry <= Instant::now());
			
			if !due {
				return;
			}
			
			let entry = state.entries.remove(0);
			drop(state);
			
			trace!("timer {} fired", entry.name);
			(entry.callback)();
		}
	}
	
	/// Time left until the earliest pending timer, `None` if nothing is
	/// pending.
	pub fn next_deadline(&self) -> Option<Duration> {
		self.lock().next_deadline()
	}
	
	/// Sleeps until the next deadline, `limit`, or a [`wake`](Self::wake) or
	/// change of the list, whichever comes first.
	pub fn wait(&self, limit: Option<Duration>) {
		let mut state = self.lock();
		
		if state.kicked {
			state.kicked = false;
			return;
		}
		
		let timeout = match (state.next_deadline(), limit) {
			(Some(deadline), Some(limit)) => Some(deadline.min(limit)),
			(deadline, limit) => deadline.or(limit),
		};
		
		let mut state = match timeout {
			Some(timeout) if timeout.is_zero() => return,
			Some(timeout) => {
				self.inner.wakeup.wait_timeout(state, timeout)
					.expect("timer set lock poisoned")
					.0
			},
			None => {
				self.inner.wakeup.wait(state)
					.expect("timer set lock poisoned")
			},
		};
		
		state.kicked = false;
	}
	
	pub fn wake(&self) {
		self.lock().kicked = true;
		self.inner.wakeup.notify_all();
	}
	
	pub fn len(&self) -> usize {
		self.lock().entries.len()
	}
	
	fn notify(&self, name: &str, event: TimerEvent) {
		trace!("timer {name}: {event:?}");
		
		if let Some(observer) = &self.inner.observer {
			observer(name, event);
		}
	}
	
	fn lock(&self) -> std::sync::MutexGuard<'_, State> {
		self.inner.state.lock()
			.expect("timer set lock poisoned")
	}
}

impl Default for TimerSet {
	fn default() -> Self {
		Self::new()
	}
}

impl State {
	fn position(&self, id: u64) -> Option<usize> {
		self.entries.iter()
			.position(|entry| entry.id == id)
	}
	
	fn next_deadline(&self) -> Option<Duration> {
		self.entries.first()
			.map(|head| head.expiry.saturating_duration_since(Instant::now()))
	}
}

impl Timer {
	pub fn start(&self, expiry: Instant) -> bool {
		self.set.start(self, expiry)
	}
	
	pub fn start_in(&self, delay: Duration) -> bool {
		self.set.start(self, Instant::now() + delay)
	}
	
	pub fn stop(&self) {
		self.set.stop(self)
	}
	
	pub fn is_pending(&self) -> bool {
		self.set.is_pending(self)
	}
	
	pub fn expiry(&self) -> Option<Instant> {
		self.set.expiry(self)
	}
	
	pub fn name(&self) -> &str {
		&self.name
	}
}

impl fmt::Debug for Timer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Timer({}, {})", self.id, self.name)
	}
}
