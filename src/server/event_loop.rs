//! Readiness pump for the lifecycle state machine.
//!
//! Single-threaded: accept, read, write, and poll dispatch are delivered
//! serially into the lifecycle, so terminal conditions cannot race and no
//! locking is needed. The poll step is the only blocking point; its timeout
//! doubles as the idle-poll heartbeat.

use crate::server::lifecycle::{Lifecycle, CLIENT, LISTENER};
use mio::{Events, Poll, Registry};
use std::io;
use std::time::Duration;

/// One listener plus one client never produce more events than this.
const EVENT_CAPACITY: usize = 8;

pub struct EventLoop {
    poll: Poll,
    events: Events,
    poll_interval: Duration,
}

impl EventLoop {
    pub fn new(poll_interval: Duration) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            poll_interval,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Pump one poll cycle, dispatching readiness into the lifecycle.
    ///
    /// A timeout with no readiness becomes an idle-poll tick.
    pub fn pump(&mut self, lifecycle: &mut Lifecycle) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.events.is_empty() {
            lifecycle.on_poll();
            return Ok(());
        }

        for event in self.events.iter() {
            let registry = self.poll.registry();
            match event.token() {
                LISTENER => lifecycle.handle_acceptable(registry),
                CLIENT => {
                    // Finish flushing the greeting before draining reads
                    if event.is_writable() {
                        lifecycle.handle_writable(registry);
                    }
                    if !lifecycle.is_done() && (event.is_readable() || event.is_read_closed()) {
                        lifecycle.handle_readable(registry);
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Pump until the lifecycle's terminal transition has run.
    pub fn drive(&mut self, lifecycle: &mut Lifecycle) -> io::Result<()> {
        while !lifecycle.is_done() {
            self.pump(lifecycle)?;
        }
        Ok(())
    }
}
