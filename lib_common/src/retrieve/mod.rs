//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the control-plane clients: request
//! building, bearer authentication, JSON bodies and optional retries with
//! exponential backoff.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: `ApiClient`, a `reqwest` client wrapped in
//!   `reqwest-middleware`. The device registration call is built on it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
