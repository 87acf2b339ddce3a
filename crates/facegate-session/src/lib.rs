//! facegate-session: Face enrollment and authentication session.
//!
//! A [`Session`] orchestrates a capture device, an enrollment store and a
//! verification oracle through `prepare`, `enroll`, `authenticate` and
//! `reset`, publishing a [`SessionStatus`] after every transition.

pub mod config;
pub mod phase;
pub mod session;

pub use config::Config;
pub use phase::{ErrorKind, MessageClass, Phase, SessionResult, SessionStatus};
pub use session::{Session, SessionError, SessionTimeouts};
