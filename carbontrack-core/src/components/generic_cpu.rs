//! Оценка мощности CPU по TDP из встроенной таблицы.
//!
//! Используется, когда нет ни RAPL, ни powermetrics. Мощность считается
//! постоянной и равной половине TDP модели; для неизвестной модели берётся
//! половина среднего TDP по таблице.

use once_cell::sync::Lazy;
use serde::Deserialize;
use sysinfo::System;
use tracing::{debug, warn};

use super::Handler;
use crate::error::{TrackerError, TrackerResult};

const CPU_POWER_CSV: &str = include_str!("../../data/cpu_power.csv");

/// Доля TDP, принимаемая за среднюю нагрузку.
const TDP_UTILIZATION: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
struct CpuRecord {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TDP")]
    tdp: f64,
}

static CPU_TABLE: Lazy<Vec<CpuRecord>> = Lazy::new(|| {
    let mut reader = csv::Reader::from_reader(CPU_POWER_CSV.as_bytes());
    reader
        .deserialize::<CpuRecord>()
        .filter_map(|record| match record {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping malformed CPU power record: {e}");
                None
            }
        })
        .collect()
});

/// Привести строку модели к виду для сравнения: без `(R)`/`(TM)`, частоты,
/// слов `CPU`/`Processor` и числа ядер.
pub fn normalize_cpu_name(name: &str) -> String {
    let without_freq = name.split('@').next().unwrap_or_default();
    let lowered = without_freq
        .to_lowercase()
        .replace("(r)", " ")
        .replace("(tm)", " ");
    lowered
        .split_whitespace()
        .filter(|token| {
            *token != "cpu" && *token != "processor" && !token.ends_with("-core")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// TDP модели, Вт, если она есть в таблице.
pub fn lookup_tdp(brand: &str) -> Option<f64> {
    let brand = brand.trim();
    if brand.is_empty() {
        return None;
    }
    if let Some(record) = CPU_TABLE.iter().find(|r| r.name == brand) {
        return Some(record.tdp);
    }
    let normalized = normalize_cpu_name(brand);
    if normalized.is_empty() {
        return None;
    }
    CPU_TABLE
        .iter()
        .find(|r| normalize_cpu_name(&r.name) == normalized)
        .map(|r| r.tdp)
}

/// Средний TDP по таблице, Вт.
pub fn average_tdp() -> f64 {
    if CPU_TABLE.is_empty() {
        return 0.0;
    }
    CPU_TABLE.iter().map(|r| r.tdp).sum::<f64>() / CPU_TABLE.len() as f64
}

fn detect_cpu_brand() -> String {
    let mut system = System::new();
    system.refresh_cpu();
    system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default()
}

/// Обработчик CPU по таблице TDP.
#[derive(Debug)]
pub struct GenericCpu {
    brand: String,
    power: Option<f64>,
}

impl Default for GenericCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericCpu {
    pub fn new() -> Self {
        Self::with_brand(detect_cpu_brand())
    }

    pub fn with_brand(brand: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            power: None,
        }
    }
}

impl Handler for GenericCpu {
    fn name(&self) -> &str {
        "generic_cpu"
    }

    fn devices(&self) -> Vec<String> {
        if self.brand.is_empty() {
            vec!["Unknown CPU".to_string()]
        } else {
            vec![self.brand.clone()]
        }
    }

    fn available(&self) -> bool {
        true
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        self.power
            .map(|watts| vec![watts])
            .ok_or_else(|| TrackerError::MeasurementRetrieval("generic CPU handler is not initialised".to_string()))
    }

    fn init(&mut self) -> TrackerResult<()> {
        let tdp = match lookup_tdp(&self.brand) {
            Some(tdp) => {
                debug!("Using TDP {tdp} W for CPU '{}'", self.brand);
                tdp
            }
            None => {
                let average = average_tdp();
                warn!(
                    "CPU model '{}' not found in the TDP table, using average TDP of {average:.2} W",
                    self.brand
                );
                average
            }
        };
        self.power = Some(tdp * TDP_UTILIZATION);
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        self.power = None;
        Ok(())
    }
}
