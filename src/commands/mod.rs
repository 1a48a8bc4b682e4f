//! UI-facing command surface. Every call is a message to the session loop
//! answered over a oneshot channel.

mod session_api;

pub use session_api::{Command, SessionHandle};
