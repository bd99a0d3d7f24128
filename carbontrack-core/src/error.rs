//! Таксономия ошибок публичного API трекера.
//!
//! Внутри бэкендов, источников интенсивности и загрузки конфигурации
//! используется `anyhow`; на границах компонентов ошибки приводятся
//! к вариантам [`TrackerError`].

use thiserror::Error;

use crate::components::ComponentName;

/// Ошибки трекера.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Некорректная конфигурация (эпохи, компоненты, ключи API, симулированные устройства).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// После фильтрации не осталось ни одного доступного компонента.
    #[error(
        "No components were available. Supported hardware: NVIDIA GPUs (NVML), \
         Intel CPUs with the RAPL interface and Apple Silicon (powermetrics)."
    )]
    NoComponentsAvailable,

    /// Запрошен сбор у компонента без обработчика.
    #[error("No {} available.", .0.display_name())]
    ComponentUnavailable(ComponentName),

    /// Нет прав на чтение измерений.
    #[error("{message}")]
    MeasurementPermission {
        /// Что именно не удалось прочитать.
        message: String,
        /// Как выдать права.
        remedy: String,
    },

    /// Измерение не удалось получить.
    #[error("failed to retrieve power usage: {0}")]
    MeasurementRetrieval(String),

    /// Источник углеродной интенсивности вернул ошибку.
    #[error("failed to fetch carbon intensity: {0}")]
    IntensityFetch(String),

    /// Не удалось определить местоположение.
    #[error("failed to resolve location: {0}")]
    LocationResolution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Сбой инфраструктуры (tokio runtime, фоновые задачи, запрос подтверждения).
    #[error("runtime failure: {0}")]
    Runtime(String),
}

impl TrackerError {
    /// Ошибка измерения, после которой компонент продолжает работу с нулевым замером.
    pub fn is_recoverable_measurement(&self) -> bool {
        matches!(
            self,
            TrackerError::MeasurementPermission { .. } | TrackerError::MeasurementRetrieval(_)
        )
    }
}

/// Результат операций трекера.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
