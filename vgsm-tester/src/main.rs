use std::time::Duration;
use std::process::ExitCode;
use log::error;

mod command_parser;
mod mock;

const DEFAULT_BAUD_RATE: u32 = 115200;

fn main() -> ExitCode {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
		.init();
	
	let mut args = std::env::args();
	args.next(); // ignore first arg, which should be the executable's name
	
	let Some(path) = args.next() else {
		eprintln!("Usage: vgsm-tester <path-to-serial-port> [pin]");
		return ExitCode::FAILURE;
	};
	
	let pin = args.next();
	
	// low timeout is necessary on windows because read only returns when the timeout runs out
	let port = serialport::new(path.clone(), DEFAULT_BAUD_RATE)
		.timeout(Duration::from_secs(1))
		.open();
	
	let port = match port {
		Ok(port) => port,
		Err(err) => {
			eprintln!("Couldn't open `{path}`: {err}");
			return ExitCode::FAILURE;
		}
	};
	
	match mock::mock(port, pin) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("couldn't clone serial port: {err}");
			ExitCode::FAILURE
		},
	}
}
