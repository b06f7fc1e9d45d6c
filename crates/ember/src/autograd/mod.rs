//! # Gradient Sessions
//!
//! Scoped recording of operations for reverse-mode differentiation.
//!
//! A [`GradientSession`] moves through [`SessionState::Unopened`],
//! [`SessionState::Open`] and [`SessionState::Closed`], in that order only.
//! Recording is scoped to the engine the session was opened on and to the
//! thread that opened it; there is no process-wide "recording" flag.

mod session;

pub use session::{GradientSession, SessionState};

pub use crate::engine::BackwardOptions;
