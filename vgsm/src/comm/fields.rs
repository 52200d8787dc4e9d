//! Parameter lists of information responses, `+CREG: 2,1,"0A1B","3C4D"`.

/// The comma separated fields after `prefix`, trimmed and unquoted. Commas
/// inside quotes do not split. `None` if `line` does not start with
/// `prefix`.
pub fn fields(line: &str, prefix: &str) -> Option<Vec<String>> {
	let rest = line.strip_prefix(prefix)?.trim();
	
	if rest.is_empty() {
		return Some(Vec::new());
	}
	
	let mut fields = Vec::new();
	let mut field = String::new();
	let mut quoted = false;
	
	for c in rest.chars() {
		match c {
			'"' => quoted = !quoted,
			',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_owned()),
			c => field.push(c),
		}
	}
	
	fields.push(field.trim().to_owned());
	Some(fields)
}

pub fn number<T: std::str::FromStr>(fields: &[String], index: usize) -> Option<T> {
	fields.get(index)?.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	
	#[test]
	fn quoted_commas() {
		assert_eq!(
			fields("+COPS: 0,0,\"Tele, Mobile\"", "+COPS:").unwrap(),
			vec!["0", "0", "Tele, Mobile"],
		);
	}
	
	#[test]
	fn numbers() {
		let fields = fields("+CSQ: 17,99", "+CSQ:").unwrap();
		
		assert_eq!(number::<u8>(&fields, 0), Some(17));
		assert_eq!(number::<u8>(&fields, 1), Some(99));
		assert_eq!(number::<u8>(&fields, 2), None);
	}
	
	#[test]
	fn wrong_prefix_or_empty() {
		assert_eq!(fields("+CREG: 1", "+CSQ:"), None);
		assert_eq!(fields("^SLCC: ", "^SLCC:"), Some(Vec::new()));
	}
}
