use std::{io, sync::{Arc, Mutex, MutexGuard}};

use log::info;

use crate::{config::{ConfigError, ModuleConfig}, device::Device, event::EventSink, module::Module};

/// Owns every module the process drives.
pub struct Driver {
	modules: Mutex<Vec<Module>>,
	events: Arc<dyn EventSink>,
}

impl Driver {
	pub fn new(events: Arc<dyn EventSink>) -> Self {
		Self {
			modules: Mutex::new(Vec::new()),
			events,
		}
	}
	
	/// Adds a module. It stays `UNCONFIGURED` until started.
	pub fn add(&self, config: ModuleConfig, device: Arc<dyn Device>) -> Result<Module, ConfigError> {
		let mut modules = self.lock();
		
		if modules.iter().any(|module| module.name() == config.name) {
			return Err(ConfigError::DuplicateName(config.name));
		}
		
		info!("{}: added on {}", config.name, device.describe());
		
		let module = Module::new(config, device, self.events.clone());
		modules.push(module.clone());
		Ok(module)
	}
	
	pub fn start(&self) -> io::Result<()> {
		for module in self.modules() {
			module.start()?;
		}
		
		Ok(())
	}
	
	pub fn module(&self, name: &str) -> Option<Module> {
		self.lock()
			.iter()
			.find(|module| module.name() == name)
			.cloned()
	}
	
	pub fn modules(&self) -> Vec<Module> {
		self.lock().clone()
	}
	
	/// Stops and forgets every module.
	pub fn shutdown(&self) {
		let modules = std::mem::take(&mut *self.lock());
		
		for module in modules {
			module.stop();
		}
	}
	
	fn lock(&self) -> MutexGuard<'_, Vec<Module>> {
		self.modules.lock()
			.expect("driver lock poisoned")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{event::LogSink, module::ModuleStatus, testing::{MockDevice, init_logging, responder}};
	
	fn device() -> Arc<MockDevice> {
		MockDevice::new(responder(|_| vec!["OK"]))
	}
	
	#[test]
	fn names_are_unique() {
		init_logging();
		let driver = Driver::new(Arc::new(LogSink));
		
		driver.add(ModuleConfig::new("gsm0"), device()).unwrap();
		driver.add(ModuleConfig::new("gsm1"), device()).unwrap();
		
		assert_eq!(
			driver.add(ModuleConfig::new("gsm0"), device()).unwrap_err(),
			ConfigError::DuplicateName("gsm0".to_owned()),
		);
		assert_eq!(driver.modules().len(), 2);
	}
	
	#[test]
	fn lookup_and_shutdown() {
		init_logging();
		let driver = Driver::new(Arc::new(LogSink));
		driver.add(ModuleConfig::new("gsm0"), device()).unwrap();
		
		let module = driver.module("gsm0").unwrap();
		assert_eq!(module.status(), ModuleStatus::Unconfigured);
		assert!(driver.module("gsm9").is_none());
		
		driver.shutdown();
		
		assert!(driver.modules().is_empty());
		assert_eq!(module.status(), ModuleStatus::Closed);
	}
}
