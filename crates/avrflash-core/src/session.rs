// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! The single in-flight update and its cleanup

use crate::classifier::FlashTimings;
use crate::config::UpdaterPaths;
use crate::launcher::FlashProcess;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug)]
pub struct UpdateSession {
    pub firmware_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub process: Option<FlashProcess>,
    pub port: Option<PathBuf>,
    read_seconds: Option<f64>,
    write_seconds: Option<f64>,
    pub completion_seconds: Option<f64>,
    partial_download: PathBuf,
}

impl UpdateSession {
    pub fn new(paths: &UpdaterPaths) -> Self {
        Self {
            firmware_path: None,
            log_path: paths.log_file.clone(),
            process: None,
            port: None,
            read_seconds: None,
            write_seconds: None,
            completion_seconds: None,
            partial_download: paths.partial_image(),
        }
    }

    pub fn record_timings(&mut self, timings: FlashTimings) {
        self.read_seconds = timings.reading_secs;
        self.write_seconds = timings.writing_secs;
        self.completion_seconds = timings.total();
    }

    /// One-line description of a finished flash for the log
    pub fn summary(&self) -> String {
        let port = self
            .port
            .as_deref()
            .map_or_else(|| "unknown port".to_owned(), |p| p.display().to_string());
        let secs =
            |value: Option<f64>| value.map_or_else(|| "n/a".to_owned(), |s| format!("{s:.2}s"));
        format!(
            "flashed via {port}: write {}, read {}, total {}",
            secs(self.write_seconds),
            secs(self.read_seconds),
            secs(self.completion_seconds)
        )
    }

    /// Release everything the attempt produced. Safe to call any number of times.
    pub async fn cleanup(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.reap().await;
            process.close_log();
        }

        let firmware = self.firmware_path.take();
        for path in firmware.iter().chain(std::iter::once(&self.partial_download)) {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }

        self.port = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_twice() {
        let dir = TempDir::new().unwrap();
        let paths = UpdaterPaths::new(dir.path());
        std::fs::create_dir_all(&paths.build_dir).unwrap();
        std::fs::write(&paths.firmware_image, ":00000001FF\n").unwrap();
        std::fs::write(paths.partial_image(), "partial").unwrap();

        let mut session = UpdateSession::new(&paths);
        session.firmware_path = Some(paths.firmware_image.clone());

        session.cleanup().await;
        assert!(!paths.firmware_image.exists());
        assert!(!paths.partial_image().exists());

        session.firmware_path = Some(paths.firmware_image.clone());
        session.cleanup().await;
        assert!(!paths.firmware_image.exists());
        assert!(session.firmware_path.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_log() {
        let dir = TempDir::new().unwrap();
        let paths = UpdaterPaths::new(dir.path());
        std::fs::write(&paths.log_file, "avrdude done.").unwrap();

        let mut session = UpdateSession::new(&paths);
        session.cleanup().await;

        assert!(paths.log_file.exists());
    }

    #[test]
    fn test_record_timings() {
        let dir = TempDir::new().unwrap();
        let mut session = UpdateSession::new(&UpdaterPaths::new(dir.path()));
        session.record_timings(FlashTimings {
            reading_secs: Some(1.23),
            writing_secs: Some(2.34),
        });
        assert_eq!(session.completion_seconds, Some(3.57));
    }

    #[test]
    fn test_summary_names_port_and_timings() {
        let dir = TempDir::new().unwrap();
        let mut session = UpdateSession::new(&UpdaterPaths::new(dir.path()));
        assert_eq!(
            session.summary(),
            "flashed via unknown port: write n/a, read n/a, total n/a"
        );

        session.port = Some(PathBuf::from("/dev/ttyACM0"));
        session.record_timings(FlashTimings {
            reading_secs: Some(1.23),
            writing_secs: Some(2.34),
        });
        assert_eq!(
            session.summary(),
            "flashed via /dev/ttyACM0: write 2.34s, read 1.23s, total 3.57s"
        );
    }
}
