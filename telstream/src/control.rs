//! Observation control: Start, Stop and Quit commands.
//!
//! Commands arrive as short ASCII messages (see [`server`]) and are delivered
//! to a [`CommandTarget`]. Receive loops poll the current command between
//! packets; nothing interrupts them preemptively.
//!
//! ```text
//!              Start(header)            Stop
//!   ┌──────┐ ───────────────> ┌────────┐ ─────> ┌──────────┐
//!   │ Idle │                  │ Active │        │ Stopping │
//!   └──────┘ <─────────────────────────────────  └──────────┘
//!                     observation closed
//! ```

pub mod server;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::header::{AsciiHeader, HeaderError};
use crate::trace::{debug, info, warn};

pub use server::{ControlServer, DEFAULT_CONTROL_PORT, ServerHandle};

/// Errors from the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("cannot {command:?} while {state:?}")]
    InvalidTransition {
        command: ControlCommand,
        state: ControlState,
    },
}

/// Pending command as seen by a receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    None = 0,
    Start = 1,
    Stop = 2,
    Quit = 3,
}

impl ControlCommand {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Start,
            2 => Self::Stop,
            3 => Self::Quit,
            _ => Self::None,
        }
    }
}

/// Observation state of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Active,
    Stopping,
}

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Begin an observation; carries header fields to merge into the
    /// configuration before the header is written (`COMMAND` removed).
    Start(AsciiHeader),
    Stop,
    Quit,
}

impl ControlMessage {
    /// Parses `COMMAND START|STOP|QUIT` (or `COMMAND=...`) plus, for START,
    /// any further `KEY value` lines.
    ///
    /// # Errors
    ///
    /// Malformed header lines, a missing `COMMAND`, or an unknown command.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let normalised: String = text
            .lines()
            .map(|line| {
                let line = line.trim();
                match line.split_once('=') {
                    Some((key, value)) if !key.contains(char::is_whitespace) => {
                        format!("{key} {value}\n")
                    }
                    _ => format!("{line}\n"),
                }
            })
            .collect();

        let mut header = AsciiHeader::load_from_str(&normalised)?;
        let command = header.del("COMMAND").ok_or_else(|| HeaderError::Missing {
            key: "COMMAND".to_string(),
        })?;

        match command.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(Self::Start(header)),
            "STOP" => Ok(Self::Stop),
            "QUIT" => Ok(Self::Quit),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }

    /// Serialises the message for the control socket.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Start(header) => format!("COMMAND START\n{}", header.raw()),
            Self::Stop => "COMMAND STOP\n".to_string(),
            Self::Quit => "COMMAND QUIT\n".to_string(),
        }
    }

    #[must_use]
    pub const fn command(&self) -> ControlCommand {
        match self {
            Self::Start(_) => ControlCommand::Start,
            Self::Stop => ControlCommand::Stop,
            Self::Quit => ControlCommand::Quit,
        }
    }
}

/// Receiver of control messages.
pub trait CommandTarget: Send + Sync {
    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// The message is not valid in the target's current state.
    fn deliver(&self, message: ControlMessage) -> Result<(), ControlError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Shared {
    state: ControlState,
    pending: Option<AsciiHeader>,
}

/// Control state of a single-stream receiver.
///
/// The command is mirrored in an atomic so the packet loop can poll it
/// without taking the lock.
#[derive(Debug)]
pub struct ControlHandle {
    command: AtomicU8,
    shared: Mutex<Shared>,
    cond: Condvar,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            command: AtomicU8::new(ControlCommand::None as u8),
            shared: Mutex::new(Shared {
                state: ControlState::Idle,
                pending: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// The pending command.
    #[inline]
    #[must_use]
    pub fn command(&self) -> ControlCommand {
        ControlCommand::from_u8(self.command.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self) -> ControlState {
        lock(&self.shared).state
    }

    fn set_command(&self, command: ControlCommand) {
        self.command.store(command as u8, Ordering::Release);
    }

    /// Blocks until a Start (returns its header) or Quit (returns `None`).
    ///
    /// On Start the state becomes [`ControlState::Active`].
    #[must_use]
    pub fn wait_for_start(&self) -> Option<AsciiHeader> {
        self.wait_for_start_within(None).flatten()
    }

    /// As [`wait_for_start`](Self::wait_for_start), giving up after `timeout`
    /// with `None`.
    #[must_use]
    pub fn wait_for_start_within(&self, timeout: Option<Duration>) -> Option<Option<AsciiHeader>> {
        let mut shared = lock(&self.shared);
        loop {
            match self.command() {
                ControlCommand::Start => {
                    let header = shared.pending.take().unwrap_or_default();
                    shared.state = ControlState::Active;
                    self.set_command(ControlCommand::None);
                    return Some(Some(header));
                }
                ControlCommand::Quit => return Some(None),
                _ => {}
            }
            shared = match timeout {
                None => self
                    .cond
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    let (guard, result) = self
                        .cond
                        .wait_timeout(shared, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() {
                        return None;
                    }
                    guard
                }
            };
        }
    }

    /// Marks the observation as winding down after a Stop was observed.
    pub fn begin_stopping(&self) {
        lock(&self.shared).state = ControlState::Stopping;
    }

    /// Returns to Idle once the observation is closed.
    ///
    /// A pending Stop is consumed; a pending Quit is kept.
    pub fn finish_observation(&self) {
        let mut shared = lock(&self.shared);
        shared.state = ControlState::Idle;
        if self.command() == ControlCommand::Stop {
            self.set_command(ControlCommand::None);
        }
        self.cond.notify_all();
    }

    /// Requests the current observation to stop.
    pub fn request_stop(&self) {
        let _ = self.deliver(ControlMessage::Stop);
    }

    /// Requests the receiver to exit.
    pub fn request_quit(&self) {
        let _ = self.deliver(ControlMessage::Quit);
    }
}

impl CommandTarget for ControlHandle {
    fn deliver(&self, message: ControlMessage) -> Result<(), ControlError> {
        let mut shared = lock(&self.shared);
        let command = message.command();
        match message {
            ControlMessage::Start(header) => {
                if shared.state != ControlState::Idle || self.command() != ControlCommand::None {
                    warn!(state = ?shared.state, "start ignored, observation in progress");
                    return Err(ControlError::InvalidTransition {
                        command,
                        state: shared.state,
                    });
                }
                shared.pending = Some(header);
                self.set_command(ControlCommand::Start);
                info!("start requested");
            }
            ControlMessage::Stop => {
                if shared.state == ControlState::Idle {
                    if self.command() == ControlCommand::Start {
                        // Cancel a start nobody has picked up yet.
                        shared.pending = None;
                        self.set_command(ControlCommand::None);
                    } else {
                        debug!("stop while idle ignored");
                    }
                } else if self.command() != ControlCommand::Quit {
                    self.set_command(ControlCommand::Stop);
                    info!("stop requested");
                }
            }
            ControlMessage::Quit => {
                self.set_command(ControlCommand::Quit);
                info!("quit requested");
            }
        }
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ControlMessage::parse("COMMAND STOP\n").unwrap(),
            ControlMessage::Stop
        );
        assert_eq!(
            ControlMessage::parse("COMMAND=quit").unwrap(),
            ControlMessage::Quit
        );

        let ControlMessage::Start(header) =
            ControlMessage::parse("COMMAND=START\nSOURCE J0437-4715\nUTC_START 2024-03-01-12:00:00\n")
                .unwrap()
        else {
            panic!("expected start");
        };
        assert!(!header.contains("COMMAND"));
        assert_eq!(header.get_str("SOURCE"), Some("J0437-4715"));
    }

    #[test]
    fn test_parse_rejects_unknown_and_missing() {
        assert!(matches!(
            ControlMessage::parse("COMMAND PAUSE\n"),
            Err(ControlError::UnknownCommand(cmd)) if cmd == "PAUSE"
        ));
        assert!(matches!(
            ControlMessage::parse("SOURCE J0437\n"),
            Err(ControlError::Header(HeaderError::Missing { .. }))
        ));
    }

    #[test]
    fn test_wire_round_trip() {
        let mut header = AsciiHeader::new();
        header.set("SOURCE", "J1939+2134");
        let message = ControlMessage::Start(header);
        assert_eq!(ControlMessage::parse(&message.to_wire()).unwrap(), message);
    }

    #[test]
    fn test_start_stop_cycle() {
        let control = ControlHandle::new();
        let mut header = AsciiHeader::new();
        header.set("SOURCE", "J0437");
        control.deliver(ControlMessage::Start(header)).unwrap();
        assert_eq!(control.command(), ControlCommand::Start);

        let header = control.wait_for_start().unwrap();
        assert_eq!(header.get_str("SOURCE"), Some("J0437"));
        assert_eq!(control.state(), ControlState::Active);
        assert_eq!(control.command(), ControlCommand::None);

        assert!(matches!(
            control.deliver(ControlMessage::Start(AsciiHeader::new())),
            Err(ControlError::InvalidTransition { .. })
        ));

        control.request_stop();
        assert_eq!(control.command(), ControlCommand::Stop);
        control.begin_stopping();
        control.finish_observation();
        assert_eq!(control.state(), ControlState::Idle);
        assert_eq!(control.command(), ControlCommand::None);
    }

    #[test]
    fn test_wait_for_start_wakes_on_quit() {
        let control = Arc::new(ControlHandle::new());
        let waiter = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.wait_for_start())
        };
        std::thread::sleep(Duration::from_millis(20));
        control.request_quit();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_wait_for_start_times_out() {
        let control = ControlHandle::new();
        assert!(
            control
                .wait_for_start_within(Some(Duration::from_millis(10)))
                .is_none()
        );
    }

    #[test]
    fn test_stop_cancels_unclaimed_start() {
        let control = ControlHandle::new();
        control
            .deliver(ControlMessage::Start(AsciiHeader::new()))
            .unwrap();
        control.request_stop();
        assert_eq!(control.command(), ControlCommand::None);
    }

    #[test]
    fn test_quit_survives_stop_and_start() {
        let control = ControlHandle::new();
        control
            .deliver(ControlMessage::Start(AsciiHeader::new()))
            .unwrap();
        assert!(control.wait_for_start().is_some());

        control.request_quit();
        control.request_stop();
        assert_eq!(control.command(), ControlCommand::Quit);
        control.begin_stopping();
        control.finish_observation();
        assert_eq!(control.command(), ControlCommand::Quit);

        assert!(matches!(
            control.deliver(ControlMessage::Start(AsciiHeader::new())),
            Err(ControlError::InvalidTransition { .. })
        ));
        assert_eq!(control.command(), ControlCommand::Quit);
        assert!(control.wait_for_start().is_none());
    }
}
