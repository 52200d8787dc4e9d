use std::{
	io::{self, ErrorKind, Read},
	sync::{Arc, atomic::{AtomicBool, Ordering}},
};

/// Hides the periodic read timeouts of a serial port until `stop` is set,
/// then reports end of stream on the next one.
pub struct NoTimeoutReader<R: Read> {
	reader: R,
	stop: Arc<AtomicBool>,
}

impl<R: Read> NoTimeoutReader<R> {
	pub fn new(reader: R, stop: Arc<AtomicBool>) -> Self {
		Self {
			reader,
			stop,
		}
	}
}

impl<R: Read> Read for NoTimeoutReader<R> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			match self.reader.read(buf) {
				Err(err) if err.kind() == ErrorKind::TimedOut => {
					if self.stop.load(Ordering::SeqCst) {
						return Ok(0);
					}
				},
				result => return result,
			}
		}
	}
}
