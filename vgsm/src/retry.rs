use std::{thread, time::Duration};

use log::debug;

/// How often and how patiently to repeat something the module may refuse
/// while it is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
	pub attempts: u32,
	pub initial: Duration,
	pub max: Duration,
}

impl Backoff {
	pub const fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
		Self {
			attempts,
			initial,
			max,
		}
	}
	
	/// Delays between attempts, doubling up to `max`.
	pub fn delays(&self) -> impl Iterator<Item = Duration> {
		let max = self.max;
		
		std::iter::successors(Some(self.initial.min(max)), move |delay| Some((*delay * 2).min(max)))
			.take(self.attempts.saturating_sub(1) as usize)
	}
}

/// Runs `attempt` until `should_retry` is false for its result or the
/// attempts run out. The last result is returned either way.
pub fn retry<T, F, P>(backoff: Backoff, mut attempt: F, should_retry: P) -> T
	where
		F: FnMut() -> T,
		P: Fn(&T) -> bool,
{
	let mut result = attempt();
	
	for delay in backoff.delays() {
		if !should_retry(&result) {
			break;
		}
		
		debug!("retrying in {delay:?}");
		thread::sleep(delay);
		result = attempt();
	}
	
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	
	const FAST: Backoff = Backoff::new(4, Duration::from_millis(1), Duration::from_millis(2));
	
	#[test]
	fn delays_double_up_to_max() {
		let backoff = Backoff::new(5, Duration::from_millis(100), Duration::from_millis(300));
		let delays: Vec<_> = backoff.delays().map(|delay| delay.as_millis()).collect();
		
		assert_eq!(delays, vec![100, 200, 300, 300]);
	}
	
	#[test]
	fn stops_on_success() {
		let mut calls = 0;
		let result = retry(FAST, || { calls += 1; calls }, |n| *n < 2);
		
		assert_eq!(result, 2);
		assert_eq!(calls, 2);
	}
	
	#[test]
	fn gives_up_after_all_attempts() {
		let mut calls = 0;
		let result = retry(FAST, || { calls += 1; "busy" }, |_| true);
		
		assert_eq!(result, "busy");
		assert_eq!(calls, 4);
	}
}
