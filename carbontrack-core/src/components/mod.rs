//! Компоненты (категории устройств) и обработчики измерений мощности.
//!
//! Обработчик ([`Handler`]) оборачивает один источник измерений
//! (NVML, RAPL, powermetrics, таблица TDP, симуляция). Компонент
//! ([`Component`]) выбирает первый доступный обработчик из реестра,
//! буферизует замеры по эпохам и пересчитывает их в энергию.
//!
//! # Компоненты
//!
//! - **rapl**: счётчики энергии Intel RAPL из sysfs
//! - **nvidia**: телеметрия NVIDIA GPU через NVML (фича `nvml`)
//! - **powermetrics**: сэмплер macOS `powermetrics` для Apple Silicon
//! - **generic_cpu**: оценка по TDP из встроенной таблицы
//! - **simulated**: симулированные устройства постоянной мощности
//! - **devices**: отслеживаемые PID и `CUDA_VISIBLE_DEVICES`

pub mod devices;
pub mod generic_cpu;
#[cfg(feature = "nvml")]
pub mod nvidia;
pub mod powermetrics;
pub mod rapl;
pub mod simulated;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{SimulatedDevice, TrackerConfig};
use crate::constants::{JOULES_PER_KWH, PUE_2023};
use crate::error::{TrackerError, TrackerResult};
use crate::logging::TrackerLogger;

/// Обработчик одного источника измерений мощности.
///
/// `available()` идемпотентен и безопасен до `init()`. `init()` и `shutdown()`
/// захватывают и освобождают ресурс; компонент вызывает их строго парно.
pub trait Handler: Send {
    /// Короткое имя бэкенда для логов.
    fn name(&self) -> &str;

    /// Имена отслеживаемых устройств.
    fn devices(&self) -> Vec<String>;

    fn available(&self) -> bool;

    /// Мгновенная мощность по устройствам, Вт.
    fn power_usage(&mut self) -> TrackerResult<Vec<f64>>;

    fn init(&mut self) -> TrackerResult<()>;

    fn shutdown(&mut self) -> TrackerResult<()>;
}

/// Категория устройств.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentName {
    Gpu,
    Cpu,
}

impl ComponentName {
    /// Все категории в порядке опроса.
    pub const ALL: [ComponentName; 2] = [ComponentName::Gpu, ComponentName::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentName::Gpu => "gpu",
            ComponentName::Cpu => "cpu",
        }
    }

    /// Имя для сообщений об отсутствии устройств: `GPU(s)`.
    pub fn display_name(&self) -> &'static str {
        match self {
            ComponentName::Gpu => "GPU(s)",
            ComponentName::Cpu => "CPU(s)",
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gpu" => Ok(ComponentName::Gpu),
            "cpu" => Ok(ComponentName::Cpu),
            other => bail!(
                "Invalid component name '{other}' given. Valid names: gpu, cpu, all"
            ),
        }
    }
}

/// Разобрать `"all"` или список категорий через запятую.
pub fn parse_component_names(selection: &str) -> Result<Vec<ComponentName>> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case("all") {
        return Ok(ComponentName::ALL.to_vec());
    }

    let mut names = Vec::new();
    for part in selection.split(',') {
        let name: ComponentName = part.parse()?;
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Параметры, нужные обработчикам при создании.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub devices_by_pid: bool,
    pub sim_cpu: Option<SimulatedDevice>,
    pub sim_gpu: Option<SimulatedDevice>,
}

impl HandlerContext {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            devices_by_pid: config.devices_by_pid,
            sim_cpu: config.sim_cpu.clone(),
            sim_gpu: config.sim_gpu.clone(),
        }
    }
}

/// Кандидаты-обработчики категории в порядке приоритета.
pub fn handler_candidates(name: ComponentName, ctx: &HandlerContext) -> Vec<Box<dyn Handler>> {
    let mut candidates: Vec<Box<dyn Handler>> = Vec::new();
    match name {
        ComponentName::Cpu => {
            if let Some(sim) = &ctx.sim_cpu {
                candidates.push(Box::new(simulated::SimulatedHandler::cpu(sim)));
                return candidates;
            }
            candidates.push(Box::new(rapl::IntelRapl::new()));
            candidates.push(Box::new(powermetrics::AppleSiliconCpu::new()));
            candidates.push(Box::new(generic_cpu::GenericCpu::new()));
        }
        ComponentName::Gpu => {
            if let Some(sim) = &ctx.sim_gpu {
                candidates.push(Box::new(simulated::SimulatedHandler::gpu(sim)));
                return candidates;
            }
            #[cfg(feature = "nvml")]
            candidates.push(Box::new(nvidia::NvidiaGpu::new(ctx.devices_by_pid)));
            candidates.push(Box::new(powermetrics::AppleSiliconGpu::new()));
        }
    }
    candidates
}

/// Выбрать первый доступный обработчик.
pub fn select_handler(candidates: Vec<Box<dyn Handler>>) -> Option<Box<dyn Handler>> {
    candidates.into_iter().find(|handler| handler.available())
}

/// Создать компоненты для выбранных категорий.
pub fn create_components(
    names: &[ComponentName],
    ctx: &HandlerContext,
    logger: &TrackerLogger,
) -> Vec<Component> {
    names
        .iter()
        .map(|&name| {
            let handler = select_handler(handler_candidates(name, ctx));
            match &handler {
                Some(h) => logger.debug(&format!("Selected {} handler for {name}", h.name())),
                None => logger.debug(&format!("No available handler for {name}")),
            }
            Component::new(name, handler, logger.clone())
        })
        .collect()
}

/// Одна категория устройств с буфером замеров по эпохам.
pub struct Component {
    name: ComponentName,
    handler: Option<Box<dyn Handler>>,
    /// `power_usages[i]` хранит замеры эпохи `i + 1`; замер содержит ватты по устройствам.
    power_usages: Vec<Vec<Vec<f64>>>,
    cur_epoch: i64,
    logger: TrackerLogger,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("handler", &self.handler.as_ref().map(|h| h.name().to_string()))
            .field("epochs", &self.power_usages.len())
            .field("cur_epoch", &self.cur_epoch)
            .finish()
    }
}

impl Component {
    pub fn new(name: ComponentName, handler: Option<Box<dyn Handler>>, logger: TrackerLogger) -> Self {
        Self {
            name,
            handler,
            power_usages: Vec::new(),
            cur_epoch: -1,
            logger,
        }
    }

    pub fn name(&self) -> ComponentName {
        self.name
    }

    pub fn available(&self) -> bool {
        self.handler.is_some()
    }

    pub fn devices(&self) -> Vec<String> {
        self.handler.as_ref().map(|h| h.devices()).unwrap_or_default()
    }

    pub fn power_usages(&self) -> &[Vec<Vec<f64>>] {
        &self.power_usages
    }

    pub fn cur_epoch(&self) -> i64 {
        self.cur_epoch
    }

    pub fn init(&mut self) -> TrackerResult<()> {
        match self.handler.as_mut() {
            Some(handler) => handler.init(),
            None => Err(TrackerError::ComponentUnavailable(self.name)),
        }
    }

    pub fn shutdown(&mut self) -> TrackerResult<()> {
        match self.handler.as_mut() {
            Some(handler) => handler.shutdown(),
            None => Ok(()),
        }
    }

    /// Снять один замер для эпохи `epoch` (нумерация с 1).
    ///
    /// Ошибки прав и получения данных не прерывают работу: в буфер кладётся
    /// нулевой замер. Остальные ошибки пробрасываются вызывающему.
    pub fn collect(&mut self, epoch: i64) -> TrackerResult<()> {
        if epoch < 1 {
            return Ok(());
        }
        let slot = (epoch - 1) as usize;

        if slot >= self.power_usages.len() {
            let filler = self.power_usages.last().cloned().unwrap_or_default();
            while self.power_usages.len() < slot {
                self.power_usages.push(filler.clone());
            }
            self.power_usages.push(Vec::new());
        }
        self.cur_epoch = epoch;

        let zero_sample = self.zero_sample();
        let handler = self
            .handler
            .as_mut()
            .ok_or(TrackerError::ComponentUnavailable(self.name))?;

        let sample = match handler.power_usage() {
            Ok(watts) => watts,
            Err(TrackerError::MeasurementPermission { message, remedy }) => {
                if self.power_usages[slot].is_empty() {
                    self.logger.critical(&format!("{message} {remedy}"));
                }
                zero_sample
            }
            Err(TrackerError::MeasurementRetrieval(reason)) => {
                self.logger.debug(&format!(
                    "Failed to retrieve {} power usage: {reason}",
                    self.name
                ));
                zero_sample
            }
            Err(other) => return Err(other),
        };
        self.power_usages[slot].push(sample);
        Ok(())
    }

    fn zero_sample(&self) -> Vec<f64> {
        let devices = self.devices().len().max(1);
        vec![0.0; devices]
    }

    /// Средняя мощность по устройствам за эпоху (нумерация с 1), `None` без замеров.
    pub fn epoch_average(&self, epoch: u64) -> Option<Vec<f64>> {
        let slot = (epoch as usize).checked_sub(1)?;
        let samples = self.power_usages.get(slot)?;
        if samples.is_empty() {
            None
        } else {
            Some(elementwise_mean(samples))
        }
    }

    /// Энергия по эпохам, кВт·ч, без учёта PUE.
    ///
    /// Эпоха без замеров берёт замеры первой следующей непустой эпохи,
    /// при их отсутствии энергия равна нулю. Результат дополняется до длины
    /// `epoch_durations` повтором последнего значения.
    pub fn energy_usage(&self, epoch_durations: &[f64]) -> Vec<f64> {
        let mut energies = Vec::with_capacity(epoch_durations.len());

        for (idx, (samples, duration)) in self
            .power_usages
            .iter()
            .zip(epoch_durations.iter())
            .enumerate()
        {
            let samples = if samples.is_empty() {
                self.power_usages[idx + 1..].iter().find(|later| !later.is_empty())
            } else {
                Some(samples)
            };

            let energy_kwh = match samples {
                Some(samples) => {
                    let watts: f64 = elementwise_mean(samples).iter().sum();
                    let joules = watts * duration;
                    if joules == 0.0 {
                        0.0
                    } else {
                        joules / JOULES_PER_KWH
                    }
                }
                None => 0.0,
            };
            energies.push(energy_kwh);
        }

        let last = energies.last().copied().unwrap_or(0.0);
        energies.resize(epoch_durations.len(), last);
        energies
    }
}

/// Поэлементное среднее замеров. Замеры короче самого длинного
/// считаются дополненными нулями.
pub fn elementwise_mean(samples: &[Vec<f64>]) -> Vec<f64> {
    let width = samples.iter().map(Vec::len).max().unwrap_or(0);
    if samples.is_empty() || width == 0 {
        return vec![0.0];
    }
    let mut sums = vec![0.0; width];
    for sample in samples {
        for (sum, value) in sums.iter_mut().zip(sample) {
            *sum += value;
        }
    }
    let count = samples.len() as f64;
    sums.into_iter().map(|sum| sum / count).collect()
}

/// Суммарная энергия всех компонентов по эпохам с учётом PUE, кВт·ч.
pub fn total_energy_per_epoch(components: &[Component], epoch_durations: &[f64]) -> Vec<f64> {
    let mut total = vec![0.0; epoch_durations.len()];
    for component in components {
        for (sum, energy) in total.iter_mut().zip(component.energy_usage(epoch_durations)) {
            *sum += energy;
        }
    }
    total.iter().map(|energy| energy * PUE_2023).collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedHandler;
    use super::*;

    fn component_with(handler: ScriptedHandler) -> Component {
        Component::new(
            ComponentName::Cpu,
            Some(Box::new(handler)),
            TrackerLogger::capturing(0),
        )
    }

    fn component_with_usages(power_usages: Vec<Vec<Vec<f64>>>) -> Component {
        let mut component = component_with(ScriptedHandler::constant(vec![0.0]));
        component.power_usages = power_usages;
        component
    }

    #[test]
    fn parses_component_selection() {
        assert_eq!(parse_component_names("all").unwrap(), ComponentName::ALL.to_vec());
        assert_eq!(parse_component_names("ALL").unwrap(), ComponentName::ALL.to_vec());
        assert_eq!(
            parse_component_names(" cpu , GPU ").unwrap(),
            vec![ComponentName::Cpu, ComponentName::Gpu]
        );
        assert_eq!(parse_component_names("cpu,cpu").unwrap(), vec![ComponentName::Cpu]);
        assert!(parse_component_names("cpu,ram").is_err());
        assert!(parse_component_names("").is_err());
    }

    #[test]
    fn collect_ignores_epochs_before_first() {
        let mut component = component_with(ScriptedHandler::constant(vec![5.0]));
        component.collect(0).unwrap();
        component.collect(-1).unwrap();
        assert!(component.power_usages().is_empty());
        assert_eq!(component.cur_epoch(), -1);
    }

    #[test]
    fn collect_backfills_skipped_epochs() {
        let mut component = component_with(ScriptedHandler::constant(vec![5.0]));
        component.collect(1).unwrap();
        component.collect(1).unwrap();
        component.collect(3).unwrap();

        let usages = component.power_usages();
        assert_eq!(usages.len(), 3);
        assert_eq!(usages[0], vec![vec![5.0], vec![5.0]]);
        assert_eq!(usages[1], usages[0]);
        assert_eq!(usages[2], vec![vec![5.0]]);
        assert_eq!(component.cur_epoch(), 3);
    }

    #[test]
    fn collect_degrades_measurement_failures_to_zero() {
        let handler = ScriptedHandler::constant(vec![3.0, 4.0])
            .then(Err(TrackerError::MeasurementPermission {
                message: "Permission denied reading energy_uj.".into(),
                remedy: "Run chmod.".into(),
            }))
            .then(Err(TrackerError::MeasurementPermission {
                message: "Permission denied reading energy_uj.".into(),
                remedy: "Run chmod.".into(),
            }))
            .then(Err(TrackerError::MeasurementRetrieval("nvml".into())));
        let logger = TrackerLogger::capturing(0);
        let mut component = Component::new(ComponentName::Gpu, Some(Box::new(handler)), logger.clone());

        for _ in 0..4 {
            component.collect(1).unwrap();
        }

        assert_eq!(
            component.power_usages()[0],
            vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![0.0, 0.0], vec![3.0, 4.0]]
        );
        let critical = logger
            .captured()
            .errors
            .iter()
            .filter(|line| line.starts_with("CRITICAL") && line.contains("Run chmod."))
            .count();
        assert_eq!(critical, 1);
    }

    #[test]
    fn collect_propagates_other_errors() {
        let handler = ScriptedHandler::constant(vec![1.0])
            .then(Err(TrackerError::Runtime("device lost".into())));
        let mut component = component_with(handler);
        assert!(matches!(component.collect(1), Err(TrackerError::Runtime(_))));
    }

    #[test]
    fn collect_without_handler_fails() {
        let mut component = Component::new(ComponentName::Gpu, None, TrackerLogger::capturing(0));
        assert!(!component.available());
        assert!(matches!(
            component.collect(1),
            Err(TrackerError::ComponentUnavailable(ComponentName::Gpu))
        ));
    }

    #[test]
    fn constant_power_energy() {
        let component = component_with_usages(vec![vec![vec![20.0], vec![20.0]]]);
        let energy = component.energy_usage(&[10.0]);
        assert_eq!(energy.len(), 1);
        assert!((energy[0] - 20.0 * 10.0 / 3.6e6).abs() < 1e-15);
    }

    #[test]
    fn energy_sums_devices_of_mean_sample() {
        let component = component_with_usages(vec![vec![vec![10.0, 30.0], vec![20.0, 40.0]]]);
        let energy = component.energy_usage(&[3600.0]);
        // среднее [15, 35] Вт, сумма 50 Вт за час
        assert!((energy[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn empty_epoch_forward_fills_from_next() {
        let component = component_with_usages(vec![vec![], vec![vec![36.0]], vec![]]);
        let energy = component.energy_usage(&[100.0, 100.0, 100.0]);
        assert!((energy[0] - 36.0 * 100.0 / 3.6e6).abs() < 1e-15);
        assert_eq!(energy[0], energy[1]);
        assert_eq!(energy[2], 0.0);
    }

    #[test]
    fn pads_missing_epochs_with_last_value() {
        let component = component_with_usages(vec![vec![vec![36.0]]]);
        let energy = component.energy_usage(&[100.0, 200.0, 300.0]);
        assert_eq!(energy.len(), 3);
        assert_eq!(energy[1], energy[0]);
        assert_eq!(energy[2], energy[0]);

        let empty = component_with_usages(vec![]);
        assert_eq!(empty.energy_usage(&[1.0, 2.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn total_energy_applies_pue() {
        let cpu = component_with_usages(vec![vec![vec![20.0]]]);
        let gpu = component_with_usages(vec![vec![vec![40.0]]]);
        let total = total_energy_per_epoch(&[cpu, gpu], &[10.0]);
        let expected = 60.0 * 10.0 / 3.6e6 * PUE_2023;
        assert!((total[0] - expected).abs() < 1e-15);
    }

    #[test]
    fn mean_of_uneven_samples() {
        assert_eq!(elementwise_mean(&[vec![2.0, 4.0], vec![0.0]]), vec![1.0, 2.0]);
        assert_eq!(elementwise_mean(&[]), vec![0.0]);
    }

    #[test]
    fn epoch_average_reports_missing_samples() {
        let component = component_with_usages(vec![vec![vec![1.0], vec![3.0]], vec![]]);
        assert_eq!(component.epoch_average(1), Some(vec![2.0]));
        assert_eq!(component.epoch_average(2), None);
        assert_eq!(component.epoch_average(0), None);
        assert_eq!(component.epoch_average(5), None);
    }

    #[test]
    fn simulated_config_overrides_registry() {
        let ctx = HandlerContext {
            sim_cpu: Some(SimulatedDevice::new("Sim CPU", 40.0, 0.5)),
            ..Default::default()
        };
        let handler = select_handler(handler_candidates(ComponentName::Cpu, &ctx)).unwrap();
        assert_eq!(handler.name(), "simulated");
        assert_eq!(handler.devices(), vec!["Sim CPU".to_string()]);
    }

    #[test]
    fn cpu_always_has_a_fallback_handler() {
        let handler = select_handler(handler_candidates(ComponentName::Cpu, &HandlerContext::default()));
        assert!(handler.is_some());
    }
}
