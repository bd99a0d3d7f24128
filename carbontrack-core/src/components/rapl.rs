//! Счётчики энергии Intel RAPL из `/sys/class/powercap`.
//!
//! Мощность считается по двум чтениям `energy_uj` с паузой в одну секунду.
//! Отслеживаются домены пакетов (`cpu:N`) и памяти (`dram:N`); `psys` пропускается.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use super::Handler;
use crate::error::{TrackerError, TrackerResult};

pub const RAPL_DIR: &str = "/sys/class/powercap";

/// Сколько раз повторить замер при отрицательной разнице (переполнение счётчика).
const MAX_ATTEMPTS: usize = 3;

static DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^intel-rapl:(\d+)(:\d+)?$").expect("RAPL domain regex is valid"));
static SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^intel-rapl:\d+:\d+$").expect("RAPL subdomain regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
struct RaplDomain {
    dir: String,
    device: String,
}

/// Обработчик Intel RAPL.
#[derive(Debug)]
pub struct IntelRapl {
    base_path: PathBuf,
    measure_delay: Duration,
    domains: Vec<RaplDomain>,
}

impl Default for IntelRapl {
    fn default() -> Self {
        Self::new()
    }
}

impl IntelRapl {
    pub fn new() -> Self {
        Self::with_base_path(RAPL_DIR, Duration::from_secs(1))
    }

    /// Обработчик над произвольным каталогом powercap (для тестов и контейнеров).
    pub fn with_base_path(base_path: impl Into<PathBuf>, measure_delay: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            measure_delay,
            domains: Vec::new(),
        }
    }

    fn discover_domains(&self) -> Result<Vec<RaplDomain>> {
        let mut names: Vec<String> = fs::read_dir(&self.base_path)
            .with_context(|| format!("failed to list {}", self.base_path.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let mut domains = Vec::new();
        for dir in names {
            let Some(caps) = DOMAIN_RE.captures(&dir) else {
                continue;
            };
            let package = caps[1].to_string();
            let label = match fs::read_to_string(self.base_path.join(&dir).join("name")) {
                Ok(label) => label.trim().to_string(),
                Err(e) => {
                    debug!("Skipping RAPL domain {dir}: cannot read name: {e}");
                    continue;
                }
            };
            if label == "psys" {
                continue;
            }
            let kind = if label.contains("package") {
                "cpu"
            } else if label.contains("dram") {
                "dram"
            } else {
                continue;
            };
            domains.push(RaplDomain {
                device: format!("{kind}:{package}"),
                dir,
            });
        }
        Ok(domains)
    }

    /// Текущие значения счётчиков по доменам, мкДж.
    fn read_energy(&self) -> TrackerResult<Vec<f64>> {
        let mut denied = Vec::new();
        let mut values = Vec::with_capacity(self.domains.len());

        for domain in &self.domains {
            let path = self.base_path.join(&domain.dir).join("energy_uj");
            match read_counter(&path) {
                Ok(value) => values.push(value),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    denied.push(path);
                    values.push(0.0);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    values.push(self.sum_subdomains(&domain.dir, &mut denied)?);
                }
                Err(e) => {
                    return Err(TrackerError::MeasurementRetrieval(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
            }
        }

        if denied.is_empty() {
            Ok(values)
        } else {
            Err(permission_error(&denied))
        }
    }

    fn sum_subdomains(&self, dir: &str, denied: &mut Vec<PathBuf>) -> TrackerResult<f64> {
        let package_dir = self.base_path.join(dir);
        let entries = fs::read_dir(&package_dir).map_err(|e| {
            TrackerError::MeasurementRetrieval(format!(
                "failed to list {}: {e}",
                package_dir.display()
            ))
        })?;

        let mut total = 0.0;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !SUBDOMAIN_RE.is_match(&name) {
                continue;
            }
            let path = package_dir.join(&name).join("energy_uj");
            match read_counter(&path) {
                Ok(value) => total += value,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => denied.push(path),
                Err(e) => {
                    return Err(TrackerError::MeasurementRetrieval(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(total)
    }
}

fn read_counter(path: &Path) -> io::Result<f64> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn permission_error(denied: &[PathBuf]) -> TrackerError {
    let files = denied
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    TrackerError::MeasurementPermission {
        message: format!("Permission denied reading Intel RAPL energy counters: {files}."),
        remedy: "Grant read access with `sudo chmod -R a+r /sys/class/powercap/intel-rapl*` \
                 (the counters are root-only since Linux 5.10)."
            .to_string(),
    }
}

impl Handler for IntelRapl {
    fn name(&self) -> &str {
        "intel_rapl"
    }

    fn devices(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.device.clone()).collect()
    }

    fn available(&self) -> bool {
        match fs::read_dir(&self.base_path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .any(|entry| DOMAIN_RE.is_match(&entry.file_name().to_string_lossy())),
            Err(_) => false,
        }
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        for attempt in 1..=MAX_ATTEMPTS {
            let before = self.read_energy()?;
            let started = Instant::now();
            std::thread::sleep(self.measure_delay);
            let after = self.read_energy()?;
            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);

            let deltas: Vec<f64> = after.iter().zip(&before).map(|(a, b)| a - b).collect();
            if deltas.iter().all(|delta| *delta >= 0.0) {
                return Ok(deltas.iter().map(|uj| uj / 1_000_000.0 / elapsed).collect());
            }
            debug!("Negative RAPL energy delta on attempt {attempt}, counter wrapped");
        }
        Ok(vec![0.0; self.domains.len()])
    }

    fn init(&mut self) -> TrackerResult<()> {
        self.domains = self
            .discover_domains()
            .map_err(|e| TrackerError::MeasurementRetrieval(format!("{e:#}")))?;
        if self.domains.is_empty() {
            return Err(TrackerError::MeasurementRetrieval(format!(
                "no RAPL package or dram domains found under {}",
                self.base_path.display()
            )));
        }
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        self.domains.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn write_domain(base: &Path, dir: &str, name: &str, energy: Option<&str>) {
        let domain = base.join(dir);
        fs::create_dir_all(&domain).unwrap();
        fs::write(domain.join("name"), format!("{name}\n")).unwrap();
        if let Some(energy) = energy {
            fs::write(domain.join("energy_uj"), format!("{energy}\n")).unwrap();
        }
    }

    #[test]
    fn unavailable_without_powercap() {
        let dir = tempfile::tempdir().unwrap();
        let missing = IntelRapl::with_base_path(dir.path().join("missing"), Duration::ZERO);
        assert!(!missing.available());

        let empty = IntelRapl::with_base_path(dir.path(), Duration::ZERO);
        assert!(!empty.available());
    }

    #[test]
    fn discovers_package_and_dram_domains() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "intel-rapl:0", "package-0", Some("100"));
        write_domain(dir.path(), "intel-rapl:0:0", "core", Some("10"));
        write_domain(dir.path(), "intel-rapl:0:2", "dram", Some("20"));
        write_domain(dir.path(), "intel-rapl:1", "psys", Some("30"));

        let mut rapl = IntelRapl::with_base_path(dir.path(), Duration::ZERO);
        assert!(rapl.available());
        rapl.init().unwrap();
        assert_eq!(rapl.devices(), vec!["cpu:0".to_string(), "dram:0".to_string()]);

        let power = rapl.power_usage().unwrap();
        assert_eq!(power, vec![0.0, 0.0]);

        rapl.shutdown().unwrap();
        assert!(rapl.devices().is_empty());
    }

    #[test]
    fn converts_energy_delta_to_watts() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "intel-rapl:0", "package-0", Some("1000000"));
        let mut rapl = IntelRapl::with_base_path(dir.path(), Duration::from_millis(300));
        rapl.init().unwrap();

        let energy_path = dir.path().join("intel-rapl:0").join("energy_uj");
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fs::write(energy_path, "4000000\n").unwrap();
        });
        let power = rapl.power_usage().unwrap();
        writer.join().unwrap();

        // 3 Дж за ~0.3 с
        assert_eq!(power.len(), 1);
        assert!(power[0] > 5.0 && power[0] <= 10.0, "power = {}", power[0]);
    }

    #[test]
    fn sums_subdomains_when_package_counter_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "intel-rapl:0", "package-0", None);
        write_domain(&dir.path().join("intel-rapl:0"), "intel-rapl:0:0", "core", Some("5"));
        write_domain(&dir.path().join("intel-rapl:0"), "intel-rapl:0:1", "uncore", Some("7"));

        let mut rapl = IntelRapl::with_base_path(dir.path(), Duration::ZERO);
        rapl.init().unwrap();
        assert_eq!(rapl.read_energy().unwrap(), vec![12.0]);
    }

    #[test]
    fn init_fails_without_supported_domains() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "intel-rapl:0", "psys", Some("1"));
        let mut rapl = IntelRapl::with_base_path(dir.path(), Duration::ZERO);
        assert!(matches!(
            rapl.init(),
            Err(TrackerError::MeasurementRetrieval(_))
        ));
    }

    #[test]
    fn permission_error_lists_files() {
        let err = permission_error(&[PathBuf::from("/sys/class/powercap/intel-rapl:0/energy_uj")]);
        match err {
            TrackerError::MeasurementPermission { message, remedy } => {
                assert!(message.contains("intel-rapl:0/energy_uj"));
                assert!(remedy.contains("chmod"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
