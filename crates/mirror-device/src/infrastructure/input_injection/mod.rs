//! Input injection backends.
//!
//! - **`shell`** runs the platform `input` tool (`input tap`, `input swipe`,
//!   `input keyevent`) for each action, one at a time, off the caller's task.
//! - **`recording`** keeps actions in memory and logs them.  Used on hosts with
//!   no `input` tool and by tests.

pub mod recording;
pub mod shell;

pub use recording::RecordingInjector;
pub use shell::ShellInjector;
