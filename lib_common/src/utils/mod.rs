//! # Utilities Module
//!
//! General helpers that do not belong to the camera or session layers.
//!
//! ## Contained Modules:
//!
//! - **`misc`**: host telemetry (`sys_info`): battery, uptime, board model and
//!   the hostname/IP block sent with status updates.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Miscellaneous helpers, currently host telemetry.
pub mod misc;
