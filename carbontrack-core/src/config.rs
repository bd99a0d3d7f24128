use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::components::{parse_component_names, ComponentName};
use crate::error::{TrackerError, TrackerResult};
use crate::intensity::fetchers::KNOWN_API_KEY_NAMES;
use crate::intensity::worker::DEFAULT_REFRESH_INTERVAL;

/// Нижняя граница интервала опроса обработчиков.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(1);

/// Нижняя граница интервала обновления интенсивности.
pub const MIN_INTENSITY_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Конфигурация трекера. Неизменяема после создания [`crate::Tracker`].
///
/// Значения `-1` у `epochs_before_pred` и `monitor_epochs` означают
/// «все эпохи», `epochs_before_pred == 0` отключает прогноз.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrackerConfig {
    /// Общее число эпох обучения.
    pub epochs: u64,
    /// После какой эпохи выдать прогноз.
    pub epochs_before_pred: i64,
    /// Сколько эпох мониторить до фактического отчёта.
    pub monitor_epochs: i64,
    /// Интервал опроса обработчиков, секунды.
    pub update_interval: f64,
    /// Добавлять ли в отчёт эквиваленты CO2eq.
    pub interpretable: bool,
    /// Спрашивать подтверждение после прогноза.
    pub stop_and_confirm: bool,
    /// Продолжать работу хоста при ошибках трекера.
    pub ignore_errors: bool,
    /// `"all"` или список через запятую из `gpu`, `cpu`.
    pub components: String,
    /// Отслеживать только GPU, на которых запущены процессы хоста.
    pub devices_by_pid: bool,
    /// Каталог лог-файлов; `None` отключает запись в файлы.
    pub log_dir: Option<PathBuf>,
    /// Префикс имён лог-файлов.
    pub log_file_prefix: String,
    /// Уровень подробности выходного канала (0..=2).
    pub verbose: u8,
    /// Число знаков после запятой в отчётах.
    pub decimal_precision: usize,
    /// Ключи API источников интенсивности (имя источника -> ключ).
    pub api_keys: HashMap<String, String>,
    /// Симулированный CPU вместо реального обработчика.
    pub sim_cpu: Option<SimulatedDevice>,
    /// Симулированный GPU вместо реального обработчика.
    pub sim_gpu: Option<SimulatedDevice>,
    /// Интервал обновления углеродной интенсивности, секунды.
    pub intensity_refresh_interval: f64,
}

/// Описание симулированного устройства постоянной мощности.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SimulatedDevice {
    pub name: String,
    /// TDP для CPU или номинальная мощность для GPU, Вт.
    pub watts: f64,
    /// Доля загрузки в диапазоне [0, 1].
    #[serde(default = "default_utilization")]
    pub utilization: f64,
}

fn default_utilization() -> f64 {
    0.5
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>, watts: f64, utilization: f64) -> Self {
        Self {
            name: name.into(),
            watts,
            utilization,
        }
    }

    fn validate(&self, kind: &str) -> Result<()> {
        ensure!(
            !self.name.trim().is_empty(),
            "{kind}.name must be a non-empty string"
        );
        ensure!(
            self.watts.is_finite() && self.watts >= 0.0,
            "{kind}.watts must be a non-negative number (got {})",
            self.watts
        );
        ensure!(
            (0.0..=1.0).contains(&self.utilization),
            "{kind}.utilization must be in the [0, 1] range (got {})",
            self.utilization
        );
        Ok(())
    }
}

/// Разрешённые значения счётчиков эпох.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPlan {
    pub epochs: u64,
    /// 0 означает, что прогноз отключён.
    pub epochs_before_pred: u64,
    pub monitor_epochs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            epochs_before_pred: 1,
            monitor_epochs: 1,
            update_interval: 1.0,
            interpretable: true,
            stop_and_confirm: false,
            ignore_errors: false,
            components: "all".to_string(),
            devices_by_pid: false,
            log_dir: None,
            log_file_prefix: String::new(),
            verbose: 1,
            decimal_precision: 12,
            api_keys: HashMap::new(),
            sim_cpu: None,
            sim_gpu: None,
            intensity_refresh_interval: 900.0,
        }
    }
}

impl TrackerConfig {
    /// Загрузить конфигурацию из YAML-файла и проверить её.
    pub fn load(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let path = path.as_ref();
        let load = || -> Result<Self> {
            let data = fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            let cfg: TrackerConfig = serde_yaml::from_str(&data)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(cfg)
        };
        let cfg = load().map_err(|e| TrackerError::Configuration(format!("{e:#}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Проверить инварианты конфигурации.
    pub fn validate(&self) -> TrackerResult<()> {
        self.check()
            .map_err(|e| TrackerError::Configuration(format!("{e:#}")))
    }

    fn check(&self) -> Result<()> {
        ensure!(self.epochs > 0, "epochs must be positive (got {})", self.epochs);
        ensure!(
            self.epochs_before_pred >= -1,
            "epochs_before_pred must be -1 or non-negative (got {})",
            self.epochs_before_pred
        );
        ensure!(
            self.monitor_epochs >= -1,
            "monitor_epochs must be -1 or non-negative (got {})",
            self.monitor_epochs
        );

        let plan = self.resolve_epochs();
        if plan.monitor_epochs == 0 || plan.monitor_epochs < plan.epochs_before_pred {
            bail!(
                "Argument monitor_epochs expected a value in {{-1, >0, >=epochs_before_pred}}, got {}.",
                self.monitor_epochs
            );
        }

        check_interval("update_interval", self.update_interval, MIN_UPDATE_INTERVAL)?;
        check_interval(
            "intensity_refresh_interval",
            self.intensity_refresh_interval,
            MIN_INTENSITY_REFRESH_INTERVAL,
        )?;
        ensure!(
            self.verbose <= 2,
            "verbose must be in the 0..=2 range (got {})",
            self.verbose
        );
        ensure!(
            self.decimal_precision <= 17,
            "decimal_precision must be <= 17 (got {})",
            self.decimal_precision
        );

        self.component_names()?;
        validate_api_key_names(self.api_keys.keys())?;

        if let Some(cpu) = &self.sim_cpu {
            cpu.validate("sim_cpu")?;
        }
        if let Some(gpu) = &self.sim_gpu {
            gpu.validate("sim_gpu")?;
        }

        Ok(())
    }

    /// Разрешить сентинелы `-1` в счётчиках эпох.
    pub fn epoch_plan(&self) -> TrackerResult<EpochPlan> {
        self.validate()?;
        Ok(self.resolve_epochs())
    }

    fn resolve_epochs(&self) -> EpochPlan {
        let resolve = |value: i64| -> u64 {
            if value == -1 {
                self.epochs
            } else {
                value.max(0) as u64
            }
        };
        EpochPlan {
            epochs: self.epochs,
            epochs_before_pred: resolve(self.epochs_before_pred),
            monitor_epochs: resolve(self.monitor_epochs),
        }
    }

    /// Выбранные категории устройств в порядке опроса.
    pub fn component_names(&self) -> Result<Vec<ComponentName>> {
        parse_component_names(&self.components)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.update_interval)
            .unwrap_or(DEFAULT_UPDATE_INTERVAL)
            .max(MIN_UPDATE_INTERVAL)
    }

    pub fn intensity_refresh_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.intensity_refresh_interval)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
            .max(MIN_INTENSITY_REFRESH_INTERVAL)
    }
}

/// Интервал в секундах должен быть представим как `Duration` и не меньше `min`.
fn check_interval(name: &str, seconds: f64, min: Duration) -> Result<()> {
    let Ok(interval) = Duration::try_from_secs_f64(seconds) else {
        bail!("{name} must be a finite non-negative number of seconds (got {seconds})");
    };
    ensure!(
        interval >= min,
        "{name} must be at least {} s (got {seconds})",
        min.as_secs_f64()
    );
    Ok(())
}

/// Проверить имена ключей API (регистр не важен).
pub fn validate_api_key_names<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for name in names {
        let lowered = name.to_lowercase();
        ensure!(
            KNOWN_API_KEY_NAMES.contains(&lowered.as_str()),
            "Invalid API name '{name}' given. Valid names: {}",
            KNOWN_API_KEY_NAMES.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes())
            .expect("write temp config");
        file
    }

    #[test]
    fn loads_valid_config() {
        let file = write_temp_config(
            r#"
epochs: 10
epochs_before_pred: 2
monitor_epochs: 5
update_interval: 0.5
components: "cpu"
api_keys:
  ElectricityMaps: "secret"
sim_cpu:
  name: "Test CPU"
  watts: 40
"#,
        );
        let cfg = TrackerConfig::load(file.path()).expect("config should load");
        assert_eq!(cfg.epochs, 10);
        assert_eq!(cfg.update_interval(), Duration::from_millis(500));
        assert_eq!(cfg.component_names().unwrap(), vec![ComponentName::Cpu]);
        let sim = cfg.sim_cpu.expect("sim cpu");
        assert_eq!(sim.utilization, 0.5);
        assert_eq!(cfg.decimal_precision, 12);
    }

    #[test]
    fn sentinels_resolve_to_total_epochs() {
        let cfg = TrackerConfig {
            epochs: 7,
            epochs_before_pred: -1,
            monitor_epochs: -1,
            ..Default::default()
        };
        let plan = cfg.epoch_plan().unwrap();
        assert_eq!(plan.epochs_before_pred, 7);
        assert_eq!(plan.monitor_epochs, 7);
    }

    #[test]
    fn zero_epochs_before_pred_disables_prediction() {
        let cfg = TrackerConfig {
            epochs: 3,
            epochs_before_pred: 0,
            monitor_epochs: 2,
            ..Default::default()
        };
        assert_eq!(cfg.epoch_plan().unwrap().epochs_before_pred, 0);
    }

    #[test]
    fn rejects_monitor_epochs_zero_or_below_prediction() {
        let zero = TrackerConfig {
            monitor_epochs: 0,
            epochs_before_pred: 0,
            ..Default::default()
        };
        let err = zero.validate().unwrap_err();
        assert!(matches!(err, TrackerError::Configuration(_)));
        assert!(err.to_string().contains("monitor_epochs"));

        let below = TrackerConfig {
            epochs: 10,
            epochs_before_pred: 5,
            monitor_epochs: 3,
            ..Default::default()
        };
        assert!(below.validate().is_err());

        let all_pred_partial_monitor = TrackerConfig {
            epochs: 10,
            epochs_before_pred: -1,
            monitor_epochs: 3,
            ..Default::default()
        };
        assert!(all_pred_partial_monitor.validate().is_err());
    }

    #[test]
    fn rejects_unknown_component_and_api_names() {
        let bad_component = TrackerConfig {
            components: "cpu,tpu".to_string(),
            ..Default::default()
        };
        assert!(bad_component.validate().is_err());

        let mut api_keys = HashMap::new();
        api_keys.insert("watttime".to_string(), "key".to_string());
        let bad_key = TrackerConfig {
            api_keys,
            ..Default::default()
        };
        let err = bad_key.validate().unwrap_err();
        assert!(err.to_string().contains("watttime"));
    }

    #[test]
    fn rejects_invalid_simulated_devices() {
        let negative = TrackerConfig {
            sim_gpu: Some(SimulatedDevice::new("GPU", -1.0, 0.5)),
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let over_utilized = TrackerConfig {
            sim_cpu: Some(SimulatedDevice::new("CPU", 10.0, 1.5)),
            ..Default::default()
        };
        assert!(over_utilized.validate().is_err());

        let unnamed = TrackerConfig {
            sim_cpu: Some(SimulatedDevice::new("  ", 10.0, 0.5)),
            ..Default::default()
        };
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn rejects_unrepresentable_and_tiny_intervals() {
        for update_interval in [1e30, f64::INFINITY, f64::NAN, -1.0, 0.0, 1e-10] {
            let cfg = TrackerConfig {
                update_interval,
                ..Default::default()
            };
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, TrackerError::Configuration(_)));
            assert!(err.to_string().contains("update_interval"));
        }

        for intensity_refresh_interval in [1e30, 1e-10, 0.5] {
            let cfg = TrackerConfig {
                intensity_refresh_interval,
                ..Default::default()
            };
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("intensity_refresh_interval"));
        }

        let edge = TrackerConfig {
            update_interval: 0.001,
            intensity_refresh_interval: 1.0,
            ..Default::default()
        };
        assert!(edge.validate().is_ok());
        assert_eq!(edge.update_interval(), MIN_UPDATE_INTERVAL);
    }

    #[test]
    fn interval_accessors_never_panic() {
        let cfg = TrackerConfig {
            update_interval: 1e30,
            intensity_refresh_interval: 1e-10,
            ..Default::default()
        };
        assert_eq!(cfg.update_interval(), Duration::from_secs(1));
        assert_eq!(cfg.intensity_refresh_interval(), MIN_INTENSITY_REFRESH_INTERVAL);
    }

    #[test]
    fn reports_missing_file() {
        let err = TrackerConfig::load("/nonexistent/carbontrack.yml").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
