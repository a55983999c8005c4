use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::project_dirs;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component.
///
/// - `component_name`: Name of the log file (e.g., "cli")
/// - `file_enabled`: If true, also log to a file. If false, only console logging.
/// - `default_filter`: Filter used when `RUST_LOG` is unset
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(
    component_name: &str,
    file_enabled: bool,
    default_filter: &str,
) -> io::Result<Option<WorkerGuard>> {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    if file_enabled {
        let log_dir = get_log_directory()?;
        fs::create_dir_all(&log_dir)?;

        let log_path = log_dir.join(format!("{}.log", component_name));
        let file = open_log_file(&log_path)?;

        let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
            .with(
                fmt::layer()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true),
            )
            .init();

        tracing::info!(target: "runner", "Logging to file: {}", log_path.display());

        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();

        Ok(None)
    }
}

/// Get the log directory path.
pub fn get_log_directory() -> io::Result<PathBuf> {
    let dirs = project_dirs()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Open a log file for appending, truncating it first if it grew too large.
fn open_log_file(log_path: &Path) -> io::Result<File> {
    truncate_if_needed(log_path)?;
    OpenOptions::new().create(true).append(true).open(log_path)
}

/// Truncate log file if it exceeds MAX_LOG_SIZE.
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() {
        let metadata = fs::metadata(log_path)?;
        if metadata.len() > MAX_LOG_SIZE {
            let file = File::create(log_path)?;
            file.set_len(0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_large_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        fs::write(&path, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"fresh\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn test_small_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.log");
        fs::write(&path, "old\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"new\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
