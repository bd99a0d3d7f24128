//! Единая точка обработки ошибок оркестрации.
//!
//! При `ignore_errors` ошибка логируется, политика помечается сработавшей,
//! и трекер снимает мониторинг, не мешая хосту. Иначе процесс завершается
//! с кодом [`EX_SOFTWARE`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::constants::EX_SOFTWARE;
use crate::error::TrackerError;
use crate::logging::TrackerLogger;

/// Политика обработки ошибок. Клоны разделяют флаг срабатывания.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    ignore_errors: bool,
    logger: TrackerLogger,
    tripped: Arc<AtomicBool>,
}

impl ErrorPolicy {
    pub fn new(ignore_errors: bool, logger: TrackerLogger) -> Self {
        Self {
            ignore_errors,
            logger,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ignore_errors(&self) -> bool {
        self.ignore_errors
    }

    /// Обработать ошибку: залогировать и либо пометить мониторинг остановленным,
    /// либо завершить процесс.
    pub fn handle(&self, err: &TrackerError) {
        if self.ignore_errors {
            let msg = format!("Ignored error: {err}\nContinued training without monitoring...");
            self.logger.critical(&msg);
            self.logger.output(&msg, 0);
            self.tripped.store(true, Ordering::SeqCst);
        } else {
            self.logger.critical(&err.to_string());
            self.logger.output(&err.to_string(), 0);
            std::process::exit(EX_SOFTWARE);
        }
    }

    /// Сработала ли политика (мониторинг должен быть снят).
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}
