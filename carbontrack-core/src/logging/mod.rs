//! Логгер трекера.
//!
//! Диагностика идёт через `tracing`, а сообщения для пользователя
//! (отчёты, запрос подтверждения) идут через отдельный выходной канал
//! с префиксом `CarbonTracker: `. Если задан каталог логов, оба потока
//! дублируются в файлы:
//!
//! - `<prefix><pid>.root_<date>_carbontracker.log`: стандартный лог;
//! - `<prefix><pid>.root_<date>_carbontracker_output.log`: выходной канал;
//! - `<prefix><pid>.root_<date>_carbontracker_err.log`: предупреждения и ошибки.
//!
//! # Примеры
//!
//! ```no_run
//! use carbontrack_core::logging::TrackerLogger;
//!
//! let logger = TrackerLogger::new(Some(std::path::Path::new("./logs")), "", 1).unwrap();
//! logger.info("Epoch 1:");
//! logger.output("Finished monitoring.", 1);
//! ```

use chrono::{Local, Utc};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::constants::PUE_STATEMENT;
use crate::error::TrackerResult;

/// Префикс строк выходного канала.
pub const OUTPUT_PREFIX: &str = "CarbonTracker: ";

/// Уровень записи в файл ошибок.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARNING"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Пути к лог-файлам одного запуска.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub standard: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
}

impl LogPaths {
    /// Построить пути по каталогу, префиксу, PID и текущему времени (UTC).
    pub fn new(log_dir: &Path, prefix: &str, pid: u32) -> Self {
        let date = Utc::now().format("%Y-%m-%dT%H%M%SZ");
        let stem = format!("{prefix}{pid}.root_{date}_carbontracker");
        Self {
            standard: log_dir.join(format!("{stem}.log")),
            output: log_dir.join(format!("{stem}_output.log")),
            error: log_dir.join(format!("{stem}_err.log")),
        }
    }
}

/// Сообщения, накопленные логгером в режиме перехвата.
#[derive(Debug, Clone, Default)]
pub struct CapturedLog {
    pub standard: Vec<String>,
    pub output: Vec<String>,
    pub errors: Vec<String>,
}

impl CapturedLog {
    /// Сколько сообщений выходного канала содержат подстроку.
    pub fn output_count(&self, needle: &str) -> usize {
        self.output.iter().filter(|m| m.contains(needle)).count()
    }

    /// Сколько сообщений стандартного лога содержат подстроку.
    pub fn standard_count(&self, needle: &str) -> usize {
        self.standard.iter().filter(|m| m.contains(needle)).count()
    }
}

struct LogFiles {
    paths: LogPaths,
    standard: Mutex<File>,
    output: Mutex<File>,
    error: Mutex<File>,
}

struct Inner {
    verbose: u8,
    console: bool,
    files: Option<LogFiles>,
    capture: Option<Mutex<CapturedLog>>,
}

/// Логгер трекера. Дешёво клонируется; клоны пишут в одни и те же файлы.
#[derive(Clone)]
pub struct TrackerLogger {
    inner: Arc<Inner>,
}

impl fmt::Debug for TrackerLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerLogger")
            .field("verbose", &self.inner.verbose)
            .field("log_paths", &self.log_paths())
            .finish()
    }
}

impl TrackerLogger {
    /// Создать логгер. При `log_dir = Some(..)` каталог создаётся, а в стандартный
    /// лог пишутся строка версии и заявление о PUE.
    pub fn new(log_dir: Option<&Path>, log_prefix: &str, verbose: u8) -> TrackerResult<Self> {
        let files = match log_dir {
            Some(dir) => Some(open_log_files(dir, log_prefix)?),
            None => None,
        };
        let logger = Self {
            inner: Arc::new(Inner {
                verbose,
                console: true,
                files,
                capture: None,
            }),
        };
        logger.write_preamble();
        Ok(logger)
    }

    /// Логгер без консоли и файлов, сохраняющий все сообщения в памяти.
    pub fn capturing(verbose: u8) -> Self {
        let logger = Self {
            inner: Arc::new(Inner {
                verbose,
                console: false,
                files: None,
                capture: Some(Mutex::new(CapturedLog::default())),
            }),
        };
        logger.write_preamble();
        logger
    }

    fn write_preamble(&self) {
        self.info(&format!(
            "carbontrack-core version {}",
            env!("CARGO_PKG_VERSION")
        ));
        self.info(PUE_STATEMENT);
    }

    pub fn verbose(&self) -> u8 {
        self.inner.verbose
    }

    pub fn log_paths(&self) -> Option<&LogPaths> {
        self.inner.files.as_ref().map(|f| &f.paths)
    }

    /// Снимок перехваченных сообщений (пустой, если перехват выключен).
    pub fn captured(&self) -> CapturedLog {
        self.inner
            .capture
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.clone()))
            .unwrap_or_default()
    }

    pub fn debug(&self, msg: &str) {
        debug!("{msg}");
        self.write_error(LogLevel::Debug, msg);
    }

    /// Сообщение стандартного лога.
    pub fn info(&self, msg: &str) {
        info!("{msg}");
        if let Some(files) = &self.inner.files {
            append_line(&files.standard, msg);
        }
        self.capture(|c| c.standard.push(msg.to_string()));
    }

    pub fn warn(&self, msg: &str) {
        warn!("{msg}");
        self.write_error(LogLevel::Warn, msg);
    }

    pub fn critical(&self, msg: &str) {
        error!("{msg}");
        self.write_error(LogLevel::Critical, msg);
    }

    /// Сообщение выходного канала. В консоль попадает при `verbose >= verbose_level`,
    /// в файл выходного канала пишется всегда.
    pub fn output(&self, msg: &str, verbose_level: u8) {
        if self.inner.console && self.inner.verbose >= verbose_level {
            println!("{OUTPUT_PREFIX}{msg}");
        }
        if let Some(files) = &self.inner.files {
            append_line(&files.output, msg);
        }
        self.capture(|c| c.output.push(msg.to_string()));
    }

    fn write_error(&self, level: LogLevel, msg: &str) {
        let line = format!("{level} - {msg}");
        if let Some(files) = &self.inner.files {
            append_line(&files.error, &line);
        }
        self.capture(|c| c.errors.push(line));
    }

    fn capture(&self, f: impl FnOnce(&mut CapturedLog)) {
        if let Some(capture) = &self.inner.capture {
            if let Ok(mut captured) = capture.lock() {
                f(&mut captured);
            }
        }
    }
}

fn open_log_files(dir: &Path, prefix: &str) -> TrackerResult<LogFiles> {
    fs::create_dir_all(dir)?;
    let paths = LogPaths::new(dir, prefix, std::process::id());
    let open = |path: &Path| -> std::io::Result<Mutex<File>> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Mutex::new)
    };
    Ok(LogFiles {
        standard: open(&paths.standard)?,
        output: open(&paths.output)?,
        error: open(&paths.error)?,
        paths,
    })
}

fn append_line(file: &Mutex<File>, msg: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let Ok(mut file) = file.lock() else {
        return;
    };
    if let Err(e) = writeln!(file, "{timestamp} - {msg}") {
        warn!("Failed to write carbontrack log line: {e}");
    }
}

/// Отформатировать длительность как `H:MM:SS` или, с `with_fraction`, `H:MM:SS.ff`.
///
/// Секунды округляются с переносом в минуты и часы.
pub fn format_duration(seconds: f64, with_fraction: bool) -> String {
    let sign = if seconds < 0.0 { "-" } else { "" };
    let seconds = if seconds.is_finite() { seconds.abs() } else { 0.0 };
    if with_fraction {
        let centis = (seconds * 100.0).round() as u64;
        let hours = centis / 360_000;
        let minutes = (centis / 6_000) % 60;
        let secs = (centis % 6_000) as f64 / 100.0;
        format!("{sign}{hours}:{minutes:02}:{secs:05.2}")
    } else {
        let total = seconds.round() as u64;
        let hours = total / 3600;
        let minutes = (total / 60) % 60;
        let secs = total % 60;
        format!("{sign}{hours}:{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_seconds_with_carry() {
        assert_eq!(format_duration(0.0, false), "0:00:00");
        assert_eq!(format_duration(59.6, false), "0:01:00");
        assert_eq!(format_duration(3599.5, false), "1:00:00");
        assert_eq!(format_duration(50.0, false), "0:00:50");
        assert_eq!(format_duration(90061.0, false), "25:01:01");
        assert_eq!(format_duration(-61.0, false), "-0:01:01");
    }

    #[test]
    fn formats_fractional_seconds() {
        assert_eq!(format_duration(1.234, true), "0:00:01.23");
        assert_eq!(format_duration(59.999, true), "0:01:00.00");
        assert_eq!(format_duration(3723.5, true), "1:02:03.50");
    }

    #[test]
    fn capturing_logger_separates_channels() {
        let logger = TrackerLogger::capturing(1);
        logger.info("Epoch 1:");
        logger.output("Actual consumption:", 0);
        logger.warn("too short");
        logger.critical("boom");

        let captured = logger.captured();
        assert!(captured.standard[0].starts_with("carbontrack-core version"));
        assert_eq!(captured.standard[1], PUE_STATEMENT);
        assert_eq!(captured.standard_count("Epoch 1:"), 1);
        assert_eq!(captured.output, vec!["Actual consumption:".to_string()]);
        assert_eq!(
            captured.errors,
            vec!["WARNING - too short".to_string(), "CRITICAL - boom".to_string()]
        );
    }

    #[test]
    fn writes_log_files_with_expected_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = TrackerLogger::new(Some(dir.path()), "run_", 0).expect("logger");
        logger.info("Epoch 1:");
        logger.output("Finished monitoring.", 1);

        let paths = logger.log_paths().expect("paths").clone();
        let standard_name = paths.standard.file_name().unwrap().to_string_lossy().to_string();
        assert!(standard_name.starts_with(&format!("run_{}.root_", std::process::id())));
        assert!(standard_name.ends_with("_carbontracker.log"));
        assert!(paths
            .output
            .to_string_lossy()
            .ends_with("_carbontracker_output.log"));

        let standard = fs::read_to_string(&paths.standard).unwrap();
        assert!(standard.contains("carbontrack-core version"));
        assert!(standard.contains(" - Only predicted and actual consumptions"));
        assert!(standard.contains(" - Epoch 1:"));

        let output = fs::read_to_string(&paths.output).unwrap();
        assert!(output.contains(" - Finished monitoring."));
    }
}
