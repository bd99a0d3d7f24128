//! NVIDIA GPU через NVML.

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::debug;

use super::devices::{cuda_visible_devices, tracked_pids};
use super::Handler;
use crate::error::{TrackerError, TrackerResult};

/// Обработчик NVIDIA GPU. Сессия NVML открывается в `init()` и закрывается в `shutdown()`.
pub struct NvidiaGpu {
    devices_by_pid: bool,
    nvml: Option<Nvml>,
    indices: Vec<u32>,
    names: Vec<String>,
}

impl NvidiaGpu {
    pub fn new(devices_by_pid: bool) -> Self {
        Self {
            devices_by_pid,
            nvml: None,
            indices: Vec::new(),
            names: Vec::new(),
        }
    }

    fn select_indices(&self, nvml: &Nvml) -> Result<Vec<u32>, NvmlError> {
        let count = nvml.device_count()?;

        if self.devices_by_pid {
            let pids = tracked_pids();
            let mut indices = Vec::new();
            for index in 0..count {
                let device = nvml.device_by_index(index)?;
                let mut processes = device.running_compute_processes()?;
                processes.extend(device.running_graphics_processes()?);
                if processes.iter().any(|p| pids.contains(&p.pid)) {
                    indices.push(index);
                }
            }
            return Ok(indices);
        }

        Ok(match cuda_visible_devices() {
            Some(visible) => visible.into_iter().filter(|i| *i < count).collect(),
            None => (0..count).collect(),
        })
    }
}

fn map_nvml_error(e: NvmlError) -> TrackerError {
    match e {
        NvmlError::NoPermission => TrackerError::MeasurementPermission {
            message: "NVML denied access to GPU power readings.".to_string(),
            remedy: "Run with a user allowed to query NVIDIA power counters.".to_string(),
        },
        other => TrackerError::MeasurementRetrieval(format!("NVML: {other}")),
    }
}

impl Handler for NvidiaGpu {
    fn name(&self) -> &str {
        "nvml"
    }

    fn devices(&self) -> Vec<String> {
        self.names.clone()
    }

    fn available(&self) -> bool {
        match Nvml::init() {
            Ok(nvml) => nvml.device_count().map(|count| count > 0).unwrap_or(false),
            Err(e) => {
                debug!("NVML is not available: {e}");
                false
            }
        }
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| TrackerError::MeasurementRetrieval("NVML is not initialised".to_string()))?;
        self.indices
            .iter()
            .map(|&index| {
                let device = nvml.device_by_index(index).map_err(map_nvml_error)?;
                let milliwatts = device.power_usage().map_err(map_nvml_error)?;
                Ok(milliwatts as f64 / 1000.0)
            })
            .collect()
    }

    fn init(&mut self) -> TrackerResult<()> {
        let nvml = Nvml::init().map_err(map_nvml_error)?;
        let indices = self.select_indices(&nvml).map_err(map_nvml_error)?;
        let mut names = Vec::with_capacity(indices.len());
        for &index in &indices {
            let name = nvml
                .device_by_index(index)
                .and_then(|device| device.name())
                .map_err(map_nvml_error)?;
            names.push(name);
        }
        self.indices = indices;
        self.names = names;
        self.nvml = Some(nvml);
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        self.indices.clear();
        self.names.clear();
        if let Some(nvml) = self.nvml.take() {
            nvml.shutdown().map_err(map_nvml_error)?;
        }
        Ok(())
    }
}
