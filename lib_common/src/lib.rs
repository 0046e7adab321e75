//! Shared library behind the edge camera agent.
//!
//! Each top-level module sits behind a cargo feature of the same name so that
//! tools needing only part of the stack (for instance the logger or the HTTP
//! client) can depend on a slimmer build. `full` is on by default.

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "utils")]
pub mod utils;

#[cfg(feature = "camera")]
pub mod camera;

#[cfg(feature = "session")]
pub mod session;
