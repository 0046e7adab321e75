/// fern-based logger writing to stdout and a timestamped file.
pub mod logfile;

pub use logfile::{setup_logging, LoggerError};
