use std::fs;
use std::path::Path;

use thiserror::Error;

/// Errors raised while installing the global logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("I/O error preparing log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("A global logger is already installed: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Installs a fern logger that writes to stdout and to
/// `<log_dir>/edge_agent_<timestamp>.log`.
///
/// Older `.log` files in `log_dir` are removed, only the most recent one is kept.
pub fn setup_logging(log_dir: &Path, debug: bool) -> Result<(), LoggerError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir)?;

    let log_file_name = format!("edge_agent_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        // Third-party HTTP/TLS chatter stays at warn even in debug mode.
        .level_for("hyper_util", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .level_for("tungstenite", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

fn cleanup_old_logs(log_dir: &Path) -> Result<(), LoggerError> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn cleanup_keeps_only_newest_log() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("edge_agent_old.log");
        let new = dir.path().join("edge_agent_new.log");
        let other = dir.path().join("notes.txt");
        fs::write(&old, "old").unwrap();
        fs::write(&new, "new").unwrap();
        fs::write(&other, "keep").unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        cleanup_old_logs(dir.path()).unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert!(other.exists());
    }
}
