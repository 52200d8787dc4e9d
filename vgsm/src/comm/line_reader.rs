use std::io::{self, ErrorKind, Read};

use log::warn;
use read_buffer::ReadBuffer;

const MAX_LINE_LENGTH: usize = 2048;

/// What the module sent, framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
	Text(String),
	/// The bare `> ` the module sends, without a line ending, once it is
	/// ready to take an SMS PDU.
	Prompt,
}

/// Splits a byte stream into CR/LF-terminated lines, keeping partial lines
/// across reads. Empty lines are skipped.
pub struct LineReader<R: Read> {
	reader: R,
	buffer: ReadBuffer<256>,
	pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
	pub fn new(reader: R) -> Self {
		Self {
			reader,
			buffer: ReadBuffer::new(),
			pending: Vec::new(),
		}
	}
	
	fn is_terminator(byte: &u8) -> bool {
		*byte == b'\r' || *byte == b'\n'
	}
	
	fn take_line(&mut self) -> Option<Line> {
		let start = self.pending.iter()
			.position(|byte| !Self::is_terminator(byte))
			.unwrap_or(self.pending.len());
		self.pending.drain(..start);
		
		let Some(end) = self.pending.iter().position(Self::is_terminator) else {
			if self.pending == b"> " || self.pending == b">" {
				self.pending.clear();
				return Some(Line::Prompt);
			}
			
			return None;
		};
		
		let line = String::from_utf8_lossy(&self.pending[..end]).into_owned();
		self.pending.drain(..=end);
		
		Some(Line::Text(line))
	}
	
	fn next_line(&mut self) -> Option<Result<Line, io::Error>> {
		loop {
			if let Some(line) = self.take_line() {
				return Some(Ok(line));
			}
			
			if self.pending.len() > MAX_LINE_LENGTH {
				warn!("dropping {} bytes without line ending", self.pending.len());
				self.pending.clear();
			}
			
			let data = match self.buffer.read_from(&mut self.reader) {
				Ok(data) if data.is_empty() => {
					if !self.pending.is_empty() {
						warn!("stream ended inside a line: {:?}", String::from_utf8_lossy(&self.pending));
					}
					return None;
				},
				Err(err) if err.kind() == ErrorKind::Interrupted => continue,
				Err(err) => return Some(Err(err)),
				Ok(data) => data,
			};
			
			self.pending.extend_from_slice(data);
		}
	}
}

impl<R: Read> Iterator for LineReader<R> {
	type Item = Result<Line, io::Error>;
	
	fn next(&mut self) -> Option<Self::Item> {
		self.next_line()
	}
}
