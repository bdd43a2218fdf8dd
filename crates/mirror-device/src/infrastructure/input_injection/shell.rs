//! Input injection through the platform `input` command.
//!
//! Actions are queued to a single worker task that runs one command at a
//! time, so gestures never overlap and `inject` returns immediately.  The
//! queue is bounded; when it is full the action is refused and dropped.
//!
//!
//! | action       | command                                  |
//! |--------------|------------------------------------------|
//! | tap          | `input tap X Y`                          |
//! | long press   | `input swipe X Y X Y MS`                 |
//! | swipe        | `input swipe X1 Y1 X2 Y2 MS`             |
//! | key          | `input keyevent CODE`                    |

use std::process::Stdio;

use mirror_core::InputAction;
use tokio::process::Command;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::application::control::{InjectionError, InputInjector};

pub struct ShellInjector {
    tx: mpsc::Sender<InputAction>,
}

impl ShellInjector {
    /// Starts the worker task with room for `queue` waiting actions.  Must be
    /// called inside a Tokio runtime.
    pub fn spawn(program: impl Into<String>, queue: usize) -> Self {
        let program = program.into();
        let (tx, rx) = mpsc::channel(queue.max(1));
        tokio::spawn(run_worker(program, rx));
        Self { tx }
    }
}

impl InputInjector for ShellInjector {
    fn inject(&self, action: &InputAction) -> Result<(), InjectionError> {
        self.tx.try_send(*action).map_err(|e| match e {
            TrySendError::Full(_) => InjectionError::Unavailable("input queue full".into()),
            TrySendError::Closed(_) => InjectionError::Unavailable("input worker stopped".into()),
        })
    }
}

async fn run_worker(program: String, mut rx: mpsc::Receiver<InputAction>) {
    while let Some(action) = rx.recv().await {
        let args = args_for(&action);
        debug!("{program} {}", args.join(" "));
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => warn!("{program} {}: exited with {s}", args.join(" ")),
            Err(e) => warn!("{program}: failed to run: {e}"),
        }
    }
    debug!("input worker finished");
}

/// Command-line arguments for `action`.
pub fn args_for(action: &InputAction) -> Vec<String> {
    match *action {
        InputAction::Tap { at } => vec!["tap".into(), at.x.to_string(), at.y.to_string()],
        InputAction::LongPress { at, duration } => vec![
            "swipe".into(),
            at.x.to_string(),
            at.y.to_string(),
            at.x.to_string(),
            at.y.to_string(),
            duration.as_millis().to_string(),
        ],
        InputAction::Swipe { from, to, duration } => vec![
            "swipe".into(),
            from.x.to_string(),
            from.y.to_string(),
            to.x.to_string(),
            to.y.to_string(),
            duration.as_millis().to_string(),
        ],
        InputAction::Key(key) => vec!["keyevent".into(), key.key_code().to_string()],
    }
}
