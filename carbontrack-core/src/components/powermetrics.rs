//! Обработчики Apple Silicon на основе `powermetrics`.
//!
//! Один запуск `sudo powermetrics -n 1 -i 1000 --samplers all` занимает около
//! секунды, поэтому вывод кэшируется на секунду и разделяется обработчиками
//! CPU и GPU.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Handler;
use crate::error::{TrackerError, TrackerResult};

const CACHE_TTL: Duration = Duration::from_secs(1);

static CPU_POWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CPU Power: (\d+) mW").expect("CPU power regex is valid"));
static GPU_POWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GPU Power: (\d+) mW").expect("GPU power regex is valid"));
static ANE_POWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ANE Power: (\d+) mW").expect("ANE power regex is valid"));

static SAMPLER: Lazy<PowerMetricsSampler> = Lazy::new(|| PowerMetricsSampler::new(CACHE_TTL));

/// Кэширующий запуск `powermetrics`.
pub struct PowerMetricsSampler {
    ttl: Duration,
    cache: Mutex<Option<(Instant, String)>>,
}

impl PowerMetricsSampler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Вывод `powermetrics`, не старше `ttl`.
    pub fn output(&self) -> TrackerResult<String> {
        self.output_with(run_powermetrics)
    }

    fn output_with(&self, run: impl FnOnce() -> TrackerResult<String>) -> TrackerResult<String> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| TrackerError::Runtime("powermetrics cache lock poisoned".to_string()))?;
        if let Some((taken, output)) = cache.as_ref() {
            if taken.elapsed() < self.ttl {
                return Ok(output.clone());
            }
        }
        let output = run()?;
        *cache = Some((Instant::now(), output.clone()));
        Ok(output)
    }
}

fn run_powermetrics() -> TrackerResult<String> {
    let output = Command::new("sudo")
        .args(["powermetrics", "-n", "1", "-i", "1000", "--samplers", "all"])
        .output()
        .map_err(|e| TrackerError::MeasurementRetrieval(format!("failed to run powermetrics: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("must be invoked as the superuser") || stderr.contains("password") {
            return Err(TrackerError::MeasurementPermission {
                message: "powermetrics requires superuser privileges.".to_string(),
                remedy: "Allow passwordless `sudo powermetrics` for this user in sudoers."
                    .to_string(),
            });
        }
        return Err(TrackerError::MeasurementRetrieval(format!(
            "powermetrics exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Мощность по шаблону `<X> Power: N mW` в ваттах; без строки 0.
pub fn parse_power(output: &str, pattern: &Regex) -> f64 {
    pattern
        .captures(output)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(|mw| mw / 1000.0)
        .unwrap_or(0.0)
}

fn apple_silicon() -> bool {
    cfg!(all(target_os = "macos", target_arch = "aarch64"))
}

/// CPU Apple Silicon.
#[derive(Debug, Default)]
pub struct AppleSiliconCpu;

impl AppleSiliconCpu {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for AppleSiliconCpu {
    fn name(&self) -> &str {
        "powermetrics_cpu"
    }

    fn devices(&self) -> Vec<String> {
        vec!["CPU".to_string()]
    }

    fn available(&self) -> bool {
        apple_silicon()
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        let output = SAMPLER.output()?;
        Ok(vec![parse_power(&output, &CPU_POWER_RE)])
    }

    fn init(&mut self) -> TrackerResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        Ok(())
    }
}

/// GPU и Neural Engine Apple Silicon.
#[derive(Debug, Default)]
pub struct AppleSiliconGpu;

impl AppleSiliconGpu {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for AppleSiliconGpu {
    fn name(&self) -> &str {
        "powermetrics_gpu"
    }

    fn devices(&self) -> Vec<String> {
        vec!["GPU".to_string(), "ANE".to_string()]
    }

    fn available(&self) -> bool {
        apple_silicon()
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        let output = SAMPLER.output()?;
        Ok(vec![
            parse_power(&output, &GPU_POWER_RE),
            parse_power(&output, &ANE_POWER_RE),
        ])
    }

    fn init(&mut self) -> TrackerResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        Ok(())
    }
}
