//! Статические средние значения углеродной интенсивности по странам.

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::constants::WORLD_2019_CARBON_INTENSITY;

const COUNTRY_INTENSITIES_CSV: &str = include_str!("../../data/carbon-intensities.csv");

#[derive(Debug, Deserialize)]
struct CountryRecord {
    #[serde(rename = "alpha-2")]
    alpha_2: String,
    #[serde(rename = "Year")]
    year: u16,
    #[serde(rename = "Carbon intensity of electricity (gCO2/kWh)")]
    intensity: f64,
}

static COUNTRY_INTENSITIES: Lazy<HashMap<String, (f64, u16)>> = Lazy::new(|| {
    let mut reader = csv::Reader::from_reader(COUNTRY_INTENSITIES_CSV.as_bytes());
    reader
        .deserialize::<CountryRecord>()
        .filter_map(|record| match record {
            Ok(record) => Some((record.alpha_2.to_uppercase(), (record.intensity, record.year))),
            Err(e) => {
                debug!("Skipping malformed carbon intensity record: {e}");
                None
            }
        })
        .collect()
});

/// Среднее значение интенсивности для страны или мира.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultIntensity {
    /// gCO2/kWh.
    pub value: f64,
    /// Код страны ISO alpha-2 или `world`.
    pub region: String,
    pub year: u16,
}

impl DefaultIntensity {
    pub fn world() -> Self {
        Self {
            value: WORLD_2019_CARBON_INTENSITY,
            region: "world".to_string(),
            year: 2019,
        }
    }

    /// Сообщение о переходе на среднее значение.
    pub fn description(&self, address: &str) -> String {
        format!(
            "Live carbon intensity could not be fetched at detected location: {address}. \
             Defaulted to average carbon intensity for {} in {} of {:.2} gCO2/kWh.",
            self.region, self.year, self.value
        )
    }
}

/// Среднее значение для страны; неизвестная страна или `None` дают мировое.
pub fn default_intensity(country: Option<&str>) -> DefaultIntensity {
    let Some(country) = country.map(|c| c.trim().to_uppercase()) else {
        return DefaultIntensity::world();
    };
    match COUNTRY_INTENSITIES.get(&country) {
        Some(&(value, year)) => DefaultIntensity {
            value,
            region: country,
            year,
        },
        None => DefaultIntensity::world(),
    }
}
