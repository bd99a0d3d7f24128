//! Источники углеродной интенсивности.
//!
//! Порядок опроса: ElectricityMaps (нужен ключ API), Energi Data Service
//! (Дания), Carbon Intensity API (Великобритания).

pub mod carbonintensitygb;
pub mod electricitymaps;
pub mod energidataservice;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::location::Location;

/// Имена источников, принимающих ключ API.
pub const KNOWN_API_KEY_NAMES: &[&str] = &["electricitymaps"];

/// Значение, полученное от источника.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchedIntensity {
    /// gCO2/kWh; `NaN` означает отсутствие данных.
    pub value: f64,
    pub is_prediction: bool,
}

/// Источник углеродной интенсивности.
#[async_trait]
pub trait IntensityFetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Может ли источник обслужить это местоположение.
    fn suitable(&self, location: &Location) -> bool;

    /// Текущая интенсивность, или прогноз на `duration` вперёд.
    async fn carbon_intensity(
        &self,
        location: &Location,
        duration: Option<Duration>,
    ) -> Result<FetchedIntensity>;
}

/// Стандартный набор источников в порядке приоритета.
pub fn standard_fetchers(
    client: reqwest::Client,
    api_keys: &HashMap<String, String>,
) -> Vec<Box<dyn IntensityFetcher>> {
    let electricitymaps_key = api_keys
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("electricitymaps"))
        .map(|(_, key)| key.clone());

    vec![
        Box::new(electricitymaps::ElectricityMaps::new(
            client.clone(),
            electricitymaps_key,
        )),
        Box::new(energidataservice::EnergiDataService::new(client.clone())),
        Box::new(carbonintensitygb::CarbonIntensityGb::new(client)),
    ]
}

/// Среднее значение или `None` для пустого набора.
pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
