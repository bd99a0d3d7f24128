//! Симулированные устройства постоянной мощности.

use tracing::info;

use super::{ComponentName, Handler};
use crate::config::SimulatedDevice;
use crate::error::TrackerResult;

/// Обработчик, отдающий `watts × utilization` для одного устройства.
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    kind: ComponentName,
    device: SimulatedDevice,
}

impl SimulatedHandler {
    pub fn cpu(device: &SimulatedDevice) -> Self {
        Self {
            kind: ComponentName::Cpu,
            device: device.clone(),
        }
    }

    pub fn gpu(device: &SimulatedDevice) -> Self {
        Self {
            kind: ComponentName::Gpu,
            device: device.clone(),
        }
    }

    pub fn power(&self) -> f64 {
        self.device.watts * self.device.utilization
    }
}

impl Handler for SimulatedHandler {
    fn name(&self) -> &str {
        "simulated"
    }

    fn devices(&self) -> Vec<String> {
        vec![self.device.name.clone()]
    }

    fn available(&self) -> bool {
        true
    }

    fn power_usage(&mut self) -> TrackerResult<Vec<f64>> {
        Ok(vec![self.power()])
    }

    fn init(&mut self) -> TrackerResult<()> {
        let rating = match self.kind {
            ComponentName::Cpu => "TDP",
            ComponentName::Gpu => "power",
        };
        info!(
            "Using simulated {}: {} with {rating}: {:.2}W (at {:.0}% utilization)",
            self.kind.as_str().to_uppercase(),
            self.device.name,
            self.device.watts,
            self.device.utilization * 100.0
        );
        Ok(())
    }

    fn shutdown(&mut self) -> TrackerResult<()> {
        Ok(())
    }
}
