use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::config::LogSettings;
use crate::error::Result;

/// Logger behind the `log` facade: every record goes to stdout and, when
/// a file could be opened, to `<path>/<name>-<date>.<ext>`.
struct FileLogger {
    file: Option<Mutex<File>>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        print!("{}", line);
        if let Some(file) = &self.file {
            if let Err(e) = file.lock().write_all(line.as_bytes()) {
                eprintln!("can't write log file: {}", e);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Installs the process logger. The log file lives under `settings.path`
/// and carries the current date rendered with `settings.time_format`.
/// Failing to open the file degrades to stdout-only logging.
pub fn setup(settings: &LogSettings) -> Result<()> {
    let file = open_log_file(settings);
    let logger = FileLogger { file };
    // set_boxed_logger fails only when a logger is already installed,
    // which tests hitting setup twice are allowed to do
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
    Ok(())
}

fn open_log_file(settings: &LogSettings) -> Option<Mutex<File>> {
    if settings.path.is_empty() {
        return None;
    }
    if let Err(e) = fs::create_dir_all(&settings.path) {
        eprintln!("can't create log dir {}: {}", settings.path, e);
        return None;
    }
    let name = format!(
        "{}-{}.{}",
        settings.name,
        Local::now().format(&settings.time_format),
        settings.ext
    );
    let path: PathBuf = [settings.path.as_str(), name.as_str()].iter().collect();
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(Mutex::new(f)),
        Err(e) => {
            eprintln!("can't open log file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_carries_formatted_date() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings {
            path: dir.path().to_str().unwrap().to_string(),
            name: "t".to_string(),
            ext: "log".to_string(),
            time_format: "%Y".to_string(),
        };
        let file = open_log_file(&settings);
        assert!(file.is_some());
        let expected = format!("t-{}.log", Local::now().format("%Y"));
        assert!(dir.path().join(expected).exists());
    }
}
