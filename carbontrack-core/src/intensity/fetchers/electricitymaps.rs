//! ElectricityMaps: `carbon-intensity/latest` бесплатного тарифа.
//!
//! API отдаёт только текущее значение, поэтому прогноз равен текущему.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{FetchedIntensity, IntensityFetcher};
use crate::intensity::location::Location;

pub const API_URL: &str = "https://api-access.electricitymaps.com/free-tier/carbon-intensity/latest";

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
}

pub struct ElectricityMaps {
    client: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
}

impl ElectricityMaps {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            api_url: API_URL.to_string(),
        }
    }

    async fn latest(&self, query: &[(&str, String)]) -> Result<f64> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let response: LatestResponse = self
            .client
            .get(&self.api_url)
            .header("auth-token", key)
            .query(query)
            .send()
            .await
            .context("failed to query ElectricityMaps")?
            .error_for_status()
            .context("ElectricityMaps returned an error status")?
            .json()
            .await
            .context("failed to decode ElectricityMaps response")?;
        Ok(response.carbon_intensity)
    }
}

#[async_trait]
impl IntensityFetcher for ElectricityMaps {
    fn name(&self) -> &str {
        "electricitymaps"
    }

    fn suitable(&self, _location: &Location) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    async fn carbon_intensity(
        &self,
        location: &Location,
        duration: Option<Duration>,
    ) -> Result<FetchedIntensity> {
        if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
            match self
                .latest(&[("lat", lat.to_string()), ("lon", lon.to_string())])
                .await
            {
                Ok(value) => {
                    return Ok(FetchedIntensity {
                        value,
                        is_prediction: duration.is_some(),
                    })
                }
                Err(e) => debug!("ElectricityMaps lookup by coordinates failed, trying zone: {e:#}"),
            }
        }

        let value = self
            .latest(&[("zone", location.country.clone())])
            .await
            .with_context(|| format!("no ElectricityMaps data for zone {}", location.country))?;
        Ok(FetchedIntensity {
            value,
            is_prediction: duration.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_latest_payload() {
        let payload = r#"{"zone": "DE", "carbonIntensity": 302, "datetime": "2024-01-01T00:00:00.000Z"}"#;
        let response: LatestResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(response.carbon_intensity, 302.0);
    }

    #[test]
    fn suitable_only_with_key() {
        let location = Location::default();
        assert!(!ElectricityMaps::new(reqwest::Client::new(), None).suitable(&location));
        assert!(!ElectricityMaps::new(reqwest::Client::new(), Some(String::new())).suitable(&location));
        assert!(ElectricityMaps::new(reqwest::Client::new(), Some("k".into())).suitable(&location));
    }
}
