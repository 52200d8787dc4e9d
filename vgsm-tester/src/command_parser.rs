//! Splits the host's byte stream into commands.
//!
//! Commands end with CR. A PDU typed after the `> ` prompt ends with Ctrl-Z
//! instead. ESC throws away whatever was typed before it.

use std::io;
use std::io::Read;
use read_buffer::ReadBuffer;

const CR: u8 = b'\r';
const CTRL_Z: u8 = 0x1a;
const ESC: u8 = 0x1b;
const LINE_LIMIT: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
	Line(String),
	Pdu(String),
}

pub struct Commands<R: Read> {
	reader: R,
	buffer: ReadBuffer<LINE_LIMIT>,
	pending: Vec<u8>,
}

fn is_terminator(byte: &u8) -> bool {
	matches!(*byte, CR | CTRL_Z)
}

impl<R: Read> Commands<R> {
	pub fn in_stream(reader: R) -> Self {
		Self {
			reader,
			buffer: Default::default(),
			pending: Default::default(),
		}
	}
	
	/// Reads until a terminator is pending. `Ok(false)` at end of stream.
	fn fill(&mut self) -> Result<bool, CommandsError> {
		while !self.pending.iter().any(is_terminator) {
			if self.pending.len() >= LINE_LIMIT {
				self.pending.clear();
				return Err(CommandsError::LineTooLong);
			}
			
			let data = self.buffer.read_while(
				&mut self.reader,
				|chunk| !chunk.iter().any(is_terminator)
			)?;
			
			if data.is_empty() {
				return Ok(false);
			}
			
			self.pending.extend_from_slice(data);
		}
		
		Ok(true)
	}
	
	fn next_command(&mut self) -> Option<Result<Command, CommandsError>> {
		loop {
			match self.fill() {
				Ok(true) => {},
				Ok(false) => return None,
				Err(err) => return Some(Err(err)),
			}
			
			let end = self.pending.iter().position(is_terminator)?;
			let mut command: Vec<u8> = self.pending.drain(..=end).collect();
			let terminator = command.pop();
			
			if let Some(escape) = command.iter().rposition(|byte| *byte == ESC) {
				command.drain(..=escape);
			}
			
			let text = String::from_utf8_lossy(&command).trim().to_owned();
			
			if text.is_empty() {
				continue;
			}
			
			return Some(Ok(match terminator {
				Some(CTRL_Z) => Command::Pdu(text),
				_ => Command::Line(text),
			}));
		}
	}
}

impl<R: Read> Iterator for Commands<R> {
	type Item = Result<Command, CommandsError>;
	
	fn next(&mut self) -> Option<Self::Item> {
		self.next_command()
	}
}

#[derive(Debug, PartialEq)]
pub enum CommandsError {
	IoError(io::ErrorKind),
	LineTooLong,
}

impl From<io::Error> for CommandsError {
	fn from(err: io::Error) -> Self {
		Self::IoError(err.kind())
	}
}
