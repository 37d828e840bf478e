//! Control channel between a [`Song`](super::Song) and its session thread.

use crossbeam_channel::{bounded, Receiver, SendError, Sender, TrySendError};

/// Commands in flight at once before advisory sends start being dropped.
pub const CONTROL_CAPACITY: usize = 16;

/// A request from the controller to the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Leave the loop after the current wake and run cleanup.
    Quit,
    /// Mute and freeze the queue.
    Pause,
    /// Unfreeze the queue and restore the last volume.
    Resume,
    /// Change the output volume (0-127).
    SetVolume(u8),
}

/// Controller side of a session's control channel.
#[derive(Debug)]
pub struct ControlSender {
    tx: Sender<Command>,
}

/// Creates the control channel for one session.
pub fn control_channel() -> (ControlSender, Receiver<Command>) {
    let (tx, rx) = bounded(CONTROL_CAPACITY);
    (ControlSender { tx }, rx)
}

impl ControlSender {
    /// Sends an advisory command without waiting.
    ///
    /// Returns false if it was dropped because the channel is full or the
    /// session is gone; there is nothing to recover in either case.
    pub fn advise(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                tracing::debug!("Control channel full, dropping {:?}", command);
                false
            }
            Err(TrySendError::Disconnected(command)) => {
                tracing::debug!("Session gone, dropping {:?}", command);
                false
            }
        }
    }

    /// Asks the session to quit, waiting for room in the channel.
    ///
    /// # Errors
    ///
    /// Fails only if the session has already dropped its receiver, which
    /// means it has left its loop and can be joined.
    pub fn quit(&self) -> Result<(), SendError<Command>> {
        self.tx.send(Command::Quit)
    }
}
