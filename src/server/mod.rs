//! Single-connection TCP greeting server.
//!
//! One lifecycle serves exactly one client: listen, accept, greet, log
//! whatever arrives, release everything. The driver in [`run`] repeats
//! lifecycles according to the configured restart policy; by default it
//! serves forever, restarting immediately after every termination. Restart is
//! the only failure response; a failed connection is never retried in place
//! and never crashes the process.

mod buffer;
mod event_loop;
mod lifecycle;

pub use event_loop::EventLoop;
pub use lifecycle::{Lifecycle, LifecycleError};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Serve lifecycles until the attempt limit (if any) is reached.
pub fn run(config: &Config) -> io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let poll_interval = Duration::from_secs(config.poll_interval);
    let restart_delay = Duration::from_millis(config.restart_delay_ms);

    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        debug!(attempt = attempts, "starting lifecycle");

        match serve_once(addr, poll_interval) {
            Ok(()) => {}
            // Failures inside a lifecycle are reported by its terminal path;
            // a Create failure never reached it, so report it here.
            Err(e @ LifecycleError::Create(_)) => error!(error = %e, "failed to start lifecycle"),
            Err(_) => {}
        }

        if config.max_attempts != 0 && attempts >= config.max_attempts {
            info!(attempts, "attempt limit reached, shutting down");
            return Ok(());
        }

        if !restart_delay.is_zero() {
            thread::sleep(restart_delay);
        }
    }
}

/// Run one full lifecycle to its terminal transition and return its outcome.
///
/// Each attempt gets fresh state and a fresh buffer; nothing is carried over
/// from the previous lifecycle.
fn serve_once(addr: SocketAddr, poll_interval: Duration) -> Result<(), LifecycleError> {
    let mut event_loop = EventLoop::new(poll_interval).map_err(LifecycleError::Create)?;
    let mut lifecycle = Lifecycle::new();

    if let Err(e) = lifecycle.open(event_loop.registry(), addr) {
        lifecycle.finish(event_loop.registry(), Err(e));
    } else if let Err(e) = event_loop.drive(&mut lifecycle) {
        // The pump itself failed; cleanup must still run exactly once
        lifecycle.finish(event_loop.registry(), Err(LifecycleError::Transport(e)));
    }

    lifecycle.take_outcome().unwrap_or(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_serve_once_reports_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let outcome = serve_once(addr, Duration::from_millis(20));
        assert!(matches!(outcome, Err(LifecycleError::Bind(_))));
    }

    #[test]
    fn test_serve_once_completes_a_connection() {
        // Grab a free port, release it, then serve one lifecycle on it
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let client = std::thread::spawn(move || {
            // The listener comes up concurrently; retry until it is there
            loop {
                match std::net::TcpStream::connect(addr) {
                    Ok(mut stream) => {
                        let mut greeting = [0u8; 6];
                        stream.read_exact(&mut greeting).unwrap();
                        return greeting;
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        });

        let outcome = serve_once(addr, Duration::from_millis(20));
        assert!(outcome.is_ok());
        assert_eq!(&client.join().unwrap(), b"hello\n");
    }
}
