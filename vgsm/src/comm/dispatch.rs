//! The two threads that run user code on behalf of a channel, so a slow
//! handler never stalls line processing.

use std::{
	io,
	sync::{Arc, mpsc::Receiver},
	thread::{self, JoinHandle},
};

use log::{debug, trace};

use super::{UrcHandler, request::{Continuation, RequestHandle}, urc::Urc};

pub(super) struct Completed {
	pub request: RequestHandle,
	pub continuation: Continuation,
}

/// Delivers URCs in arrival order. Ends once the engine drops its sender.
pub(super) fn spawn_urc_dispatch(
	name: &str,
	receiver: Receiver<Urc>,
	handler: Arc<dyn UrcHandler>,
) -> io::Result<JoinHandle<()>> {
	let name = name.to_owned();
	
	thread::Builder::new()
		.name(format!("<{name}:urc>"))
		.spawn(move || {
			for urc in receiver {
				trace!("{name}: dispatching {urc:?}");
				handler.handle_urc(urc);
			}
			
			debug!("{name}: URC dispatch finished");
		})
}

/// Runs request continuations. Ends once the channel is gone.
pub(super) fn spawn_completion_dispatch(
	name: &str,
	receiver: Receiver<Completed>,
) -> io::Result<JoinHandle<()>> {
	let name = name.to_owned();
	
	thread::Builder::new()
		.name(format!("<{name}:done>"))
		.spawn(move || {
			for Completed { request, continuation } in receiver {
				trace!("{name}: completing {request:?}");
				continuation(&request);
			}
			
			debug!("{name}: completion dispatch finished");
		})
}
