pub mod comm;
pub mod config;
pub mod device;
pub mod driver;
pub mod event;
pub mod hex;
pub mod module;
pub mod retry;
pub mod timer;

mod no_timeout_reader;

#[cfg(test)]
mod testing;

pub use self::{
	comm::{Comm, CommState, Link, Request, RequestHandle, ResponseCode},
	config::{ConfigError, ModuleConfig, OperatorSelection, Timing},
	device::{Device, PowerState, SerialDevice},
	driver::Driver,
	event::{ChannelSink, Event, EventSink, LogSink},
	module::{Module, ModuleError, ModuleStatus},
};
