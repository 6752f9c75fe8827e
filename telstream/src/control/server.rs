//! TCP control server.
//!
//! One message per connection: the client writes a command, closes its write
//! half and reads back `ok` or `fail: <reason>`. The accept loop wakes every
//! [`ACCEPT_INTERVAL`] to check the shutdown flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{CommandTarget, ControlCommand, ControlError, ControlMessage};
use crate::net::Endpoint;
use crate::net::tcp::{ControlConnection, ControlListener};
use crate::trace::{debug, error, info, warn};

/// Port the capture tools listen on unless told otherwise.
pub const DEFAULT_CONTROL_PORT: u16 = 32132;

const ACCEPT_INTERVAL: Duration = Duration::from_secs(1);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts control connections and delivers their messages.
pub struct ControlServer {
    listener: ControlListener,
}

impl ControlServer {
    /// Binds the control port.
    ///
    /// # Errors
    ///
    /// The port cannot be bound.
    pub fn bind(endpoint: Endpoint) -> Result<Self, ControlError> {
        let listener = ControlListener::bind(endpoint).map_err(|e| {
            error!(%endpoint, error = %e, "failed to bind control port");
            ControlError::Io(e)
        })?;
        Ok(Self { listener })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// The local address cannot be read.
    pub fn local_addr(&self) -> Result<Endpoint, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` is set or a Quit has been delivered.
    ///
    /// Per-connection failures are logged and answered; only listener
    /// failures end the loop with an error.
    ///
    /// # Errors
    ///
    /// Accept failure.
    pub fn serve<T: CommandTarget + ?Sized>(
        &mut self,
        target: &T,
        shutdown: &AtomicBool,
    ) -> Result<(), ControlError> {
        while !shutdown.load(Ordering::Relaxed) {
            let Some(conn) = self.listener.accept_timeout(ACCEPT_INTERVAL)? else {
                continue;
            };
            if self.handle(conn, target) == Some(ControlCommand::Quit) {
                debug!("quit delivered, control server exiting");
                break;
            }
        }
        Ok(())
    }

    fn handle<T: CommandTarget + ?Sized>(
        &mut self,
        mut conn: ControlConnection,
        target: &T,
    ) -> Option<ControlCommand> {
        let peer = conn.peer();
        let outcome = self
            .listener
            .read_message(&mut conn, MESSAGE_TIMEOUT)
            .map_err(ControlError::from)
            .and_then(|text| ControlMessage::parse(&text))
            .and_then(|message| {
                let command = message.command();
                info!(%peer, ?command, "control message");
                target.deliver(message).map(|()| command)
            });

        let (reply, delivered) = match outcome {
            Ok(command) => ("ok\n".to_string(), Some(command)),
            Err(e) => {
                warn!(%peer, error = %e, "control message rejected");
                (format!("fail: {e}\n"), None)
            }
        };
        if let Err(e) = self.listener.reply(conn, &reply) {
            debug!(%peer, error = %e, "control reply not delivered");
        }
        delivered
    }

    /// Runs the server on its own thread.
    ///
    /// # Errors
    ///
    /// The thread cannot be spawned.
    pub fn spawn<T: CommandTarget + 'static>(
        mut self,
        target: Arc<T>,
    ) -> Result<ServerHandle, ControlError> {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let local_addr = self.local_addr()?;

        debug!(%local_addr, "spawning control thread");
        let handle = thread::Builder::new()
            .name("telstream-control".into())
            .spawn(move || {
                info!("control thread started");
                if let Err(e) = self.serve(target.as_ref(), &flag) {
                    error!(error = %e, "control server failed");
                }
                info!("control thread exiting");
            })?;

        Ok(ServerHandle {
            local_addr,
            shutdown_flag,
            handle: Some(handle),
        })
    }
}

/// Handle to a spawned [`ControlServer`].
///
/// Dropping the handle signals shutdown without waiting; the thread notices
/// within one accept interval.
pub struct ServerHandle {
    local_addr: Endpoint,
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    /// Whether the server thread has exited (e.g. after Quit).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the server and waits for its thread.
    pub fn shutdown(mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            debug!("waiting for control thread to exit");
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlHandle, ControlState};
    use crate::net::send_command;

    #[test]
    fn test_server_delivers_and_replies() {
        let control = Arc::new(ControlHandle::new());
        let server = ControlServer::bind(Endpoint::localhost(0)).unwrap();
        let handle = server.spawn(Arc::clone(&control)).unwrap();
        let addr = handle.local_addr();

        let reply = send_command(addr, "COMMAND START\nSOURCE J0437\n", Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply, "ok\n");
        let header = control.wait_for_start().unwrap();
        assert_eq!(header.get_str("SOURCE"), Some("J0437"));
        assert_eq!(control.state(), ControlState::Active);

        let reply = send_command(addr, "COMMAND BOGUS\n", Duration::from_secs(2)).unwrap();
        assert!(reply.starts_with("fail:"), "{reply}");

        let reply = send_command(addr, "COMMAND QUIT\n", Duration::from_secs(2)).unwrap();
        assert_eq!(reply, "ok\n");
        assert_eq!(control.command(), ControlCommand::Quit);
        handle.shutdown();
    }

    #[test]
    fn test_server_shutdown_without_clients() {
        let server = ControlServer::bind(Endpoint::localhost(0)).unwrap();
        let handle = server.spawn(Arc::new(ControlHandle::new())).unwrap();
        assert!(!handle.is_finished());
        handle.shutdown();
    }
}
