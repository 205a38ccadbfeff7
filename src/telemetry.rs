//! Logging setup: filtered stderr output plus an optional rolling file
//! layer with startup retention pruning.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "meshfsd.log";

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. The `LOG` env var overrides the
/// configured level filter.
pub fn init(config: &LoggingConfig) -> TelemetryGuard {
    let level: tracing_subscriber::filter::LevelFilter = config
        .level
        .parse()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(Box::new(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true),
    ));

    let mut pruned = 0usize;
    let mut file_setup_error = None;
    if let Some(dir) = &config.dir {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                match prune_logs(dir, LOG_FILE_PREFIX, config.backup_count, config.max_file_size)
                {
                    Ok(removed) => pruned = removed,
                    Err(err) => {
                        file_setup_error = Some(format!("log retention failed: {err}"));
                    }
                }
                let appender = tracing_appender::rolling::RollingFileAppender::new(
                    tracing_appender::rolling::Rotation::DAILY,
                    dir,
                    LOG_FILE_PREFIX,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_target(true),
                ));
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error = Some(format!(
                    "log dir init failed for {}: {err}",
                    dir.display()
                ));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if pruned > 0 {
        tracing::info!(pruned, "log retention applied");
    }
    if let Some(message) = file_setup_error {
        tracing::warn!("{message}");
    }

    TelemetryGuard { _guards: guards }
}

/// Removes the oldest rotated files beyond `max_files`, then keeps
/// removing oldest-first while the total size exceeds `max_total_bytes`
/// (0 disables the size bound). Returns how many files were removed.
fn prune_logs(
    dir: &Path,
    prefix: &str,
    max_files: usize,
    max_total_bytes: u64,
) -> std::io::Result<usize> {
    let mut entries = collect_log_entries(dir, prefix)?;
    entries.sort_by_key(|entry| entry.modified);

    let mut to_remove: Vec<PathBuf> = Vec::new();
    if max_files > 0 && entries.len() > max_files {
        let excess = entries.len() - max_files;
        for entry in entries.drain(..excess) {
            to_remove.push(entry.path);
        }
    }
    if max_total_bytes > 0 {
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        while total > max_total_bytes && entries.len() > 1 {
            let oldest = entries.remove(0);
            total -= oldest.size;
            to_remove.push(oldest.path);
        }
    }

    let mut removed = 0usize;
    for path in to_remove {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

struct LogEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

fn collect_log_entries(dir: &Path, prefix: &str) -> std::io::Result<Vec<LogEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push(LogEntry {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_respects_count_and_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (i, size) in [4096usize, 4096, 16, 16].iter().enumerate() {
            let path = dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-0{}", i + 1));
            fs::write(&path, vec![b'x'; *size]).unwrap();
        }

        // Count bound drops the oldest file.
        let removed = prune_logs(dir.path(), LOG_FILE_PREFIX, 3, 0).unwrap();
        assert_eq!(removed, 1);

        // Size bound keeps removing oldest-first, but never the newest.
        let removed = prune_logs(dir.path(), LOG_FILE_PREFIX, 0, 64).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(collect_log_entries(dir.path(), LOG_FILE_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn unrelated_files_are_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("keep.txt"), b"data").unwrap();
        let removed = prune_logs(dir.path(), LOG_FILE_PREFIX, 1, 1).unwrap();
        assert_eq!(removed, 0);
    }
}
