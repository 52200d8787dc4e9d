use std::{io::{self, ErrorKind}, ops::{AddAssign, ShlAssign}};

/// Parses a big endian hex number such as the `lac` and `ci` fields of
/// `+CREG`. Both cases are accepted.
pub fn parse_ascii_hex<I: Integer<I>>(ascii_data: &[u8]) -> Result<I, io::Error> {
	if ascii_data.is_empty() || ascii_data.len() > I::HEX_DIGITS {
		// number larger than I::MAX is invalid data
		return Err(ErrorKind::InvalidData.into());
	}
	
	let mut acc = I::default(); // 0
	
	for &ascii_digit in ascii_data {
		acc <<= 4;
		
		let digit = parse_ascii_hex_digit(ascii_digit)?;
		
		acc += digit.into();
	}
	
	Ok(acc)
}

fn parse_ascii_hex_digit(ascii_digit: u8) -> Result<u8, io::Error> {
	let digit = match ascii_digit {
		b'0'..=b'9' => ascii_digit - b'0',
		b'A'..=b'F' => ascii_digit - b'A' + 0xA,
		b'a'..=b'f' => ascii_digit - b'a' + 0xA,
		_ => return Err(ErrorKind::InvalidData.into()),
	};
	
	Ok(digit)
}

/// Encodes a PDU the way `AT+CMGS` wants it, two uppercase digits per byte.
pub fn encode_hex(data: &[u8]) -> String {
	let mut ascii_data = String::with_capacity(data.len() * 2);
	
	for &byte in data {
		ascii_data.push(encode_ascii_hex_digit(byte >> 4));
		ascii_data.push(encode_ascii_hex_digit(byte & 0xF));
	}
	
	ascii_data
}

/// Decodes the PDU line of `+CMT`, `+CDS` and `+CBM`.
pub fn decode_hex(ascii_data: &str) -> Result<Vec<u8>, io::Error> {
	let ascii_data = ascii_data.trim().as_bytes();
	
	if ascii_data.len() % 2 != 0 {
		return Err(ErrorKind::InvalidData.into());
	}
	
	ascii_data.chunks(2)
		.map(parse_ascii_hex::<u8>)
		.collect()
}

fn encode_ascii_hex_digit(digit: u8) -> char {
	match digit {
		0..=9 => (digit + b'0') as char,
		_ => (digit - 0xA + b'A') as char,
	}
}

pub trait Integer<I: Integer<I>>: ShlAssign<i32> + AddAssign<I> + From<u8> + Default {
	const HEX_DIGITS: usize;
}

impl Integer<u8> for u8 {
	const HEX_DIGITS: usize = 2;
}

impl Integer<u16> for u16 {
	const HEX_DIGITS: usize = 4;
}

impl Integer<u32> for u32 {
	const HEX_DIGITS: usize = 8;
}
