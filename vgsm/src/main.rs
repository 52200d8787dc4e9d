//! The vgsm daemon.
//!
//! `vgsm list` prints the serial ports of this machine.
//!
//! `vgsm run <path> [key=value]... [-- <path> [key=value]...]...` drives one
//! module per path and takes operator commands on stdin until it closes.

use std::{
	io::{self, BufRead, Write},
	process::ExitCode,
	sync::Arc,
	thread,
};

use env_logger::Env;
use log::{error, info};
use vgsm::{Driver, LogSink, Module, ModuleConfig, SerialDevice, device::available_ports, module::CallState};

fn main() -> ExitCode {
	init_logging();
	
	let mut args = std::env::args();
	args.next(); // ignore first arg, which should be the executable's name
	
	let result = match args.next().as_deref() {
		Some("list") => list(),
		Some("run") => run(args.collect()),
		Some(other) => Err(format!("unknown mode `{other}`")),
		None => Err("no mode provided".to_owned()),
	};
	
	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("{err}");
			ExitCode::FAILURE
		},
	}
}

fn init_logging() {
	env_logger::Builder::from_env(Env::default().default_filter_or("info"))
		.format(|buf, record| {
			let thread = thread::current();
			
			writeln!(
				buf,
				"{} {:<5} {} {}",
				buf.timestamp_millis(),
				record.level(),
				thread.name().unwrap_or("<unnamed>"),
				record.args(),
			)
		})
		.init();
}

fn list() -> Result<(), String> {
	let ports = available_ports()
		.map_err(|err| format!("couldn't list available ports: {err}"))?;
	
	for (name, port_type) in ports {
		println!("{name}: {port_type}");
	}
	
	Ok(())
}

/// Splits `run` arguments into one `(path, config)` per module.
fn parse_modules(args: &[String]) -> Result<Vec<(String, ModuleConfig)>, String> {
	let mut modules = Vec::new();
	
	for (index, group) in args.split(|arg| arg == "--").enumerate() {
		let Some((path, settings)) = group.split_first() else {
			return Err(format!("module {index} has no device path"));
		};
		
		let config = ModuleConfig::from_args(&format!("gsm{index}"), settings.iter().map(String::as_str))
			.map_err(|err| format!("{path}: {err}"))?;
		
		modules.push((path.clone(), config));
	}
	
	Ok(modules)
}

fn run(args: Vec<String>) -> Result<(), String> {
	let modules = parse_modules(&args)?;
	let driver = Driver::new(Arc::new(LogSink));
	
	for (path, config) in modules {
		let device = Arc::new(SerialDevice::new(&path, config.baud_rate));
		driver.add(config, device).map_err(|err| err.to_string())?;
	}
	
	driver.start().map_err(|err| format!("couldn't start modules: {err}"))?;
	
	let result = console(&driver).map_err(|err| format!("couldn't read from stdin: {err}"));
	
	info!("shutting down");
	driver.shutdown();
	result
}

fn console(driver: &Driver) -> io::Result<()> {
	for line in io::stdin().lock().lines() {
		let line = line?;
		let words: Vec<&str> = line.split_whitespace().collect();
		
		let Some((command, args)) = words.split_first() else {
			continue;
		};
		
		if let Err(err) = execute(driver, command, args) {
			println!("error: {err}");
		}
	}
	
	Ok(())
}

fn execute(driver: &Driver, command: &str, args: &[&str]) -> Result<(), String> {
	if command == "status" {
		for module in driver.modules() {
			print_status(&module);
		}
		
		return Ok(());
	}
	
	let (name, args) = args.split_first().ok_or("missing module name")?;
	let module = driver.module(name).ok_or_else(|| format!("no module named `{name}`"))?;
	
	let result = match (command, args) {
		("pin", [pin]) => module.enter_pin(pin),
		("puk", [puk, pin]) => module.enter_puk(puk, pin),
		("reset", []) => module.reset(),
		("poweroff", []) => module.power_off(),
		("poweron", []) => module.power_on(),
		("offline", []) => module.set_service(false),
		("online", []) => module.set_service(true),
		("hangup", []) => module.hangup(),
		("dial", [number]) => module.dial(number),
		("at", [_, ..]) => return send_at(&module, &args.join(" ")),
		_ => return Err(format!("cannot make sense of `{command}` with {} arguments", args.len())),
	};
	
	result.map_err(|err| err.to_string())
}

fn send_at(module: &Module, text: &str) -> Result<(), String> {
	let request = module.send_at(text).map_err(|err| err.to_string())?;
	let code = request.wait();
	
	for line in request.lines() {
		println!("{line}");
	}
	
	println!("{}", request.final_line().unwrap_or_else(|| code.to_string()));
	Ok(())
}

fn print_status(module: &Module) {
	let state = module.snapshot();
	
	println!("{}: {} ({})", module.name(), state.status, state.reason);
	println!("  device: {}", module.device().describe());
	
	if let Some(model) = &state.info.model {
		println!("  model: {} {}", state.info.vendor.as_deref().unwrap_or("?"), model);
	}
	
	if let Some(imsi) = &state.sim.imsi {
		println!("  imsi: {imsi}");
	}
	
	println!(
		"  network: {} {} rssi {}",
		state.network.registration,
		state.network.operator.as_deref().unwrap_or("-"),
		state.network.rssi.map_or("?".to_owned(), |rssi| rssi.to_string()),
	);
	
	for (slot, call) in state.calls.iter().enumerate() {
		if call.state != CallState::Unused {
			println!("  call {slot}: {:?} {}", call.state, call.number.as_deref().unwrap_or("unknown"));
		}
	}
	
	println!("  rejected calls: {}", state.rejected_calls);
}
