//! Carbon Intensity API (National Grid ESO, Великобритания).
//!
//! Сначала запрашивается регион по почтовому индексу, при неудаче
//! берётся национальное значение. С длительностью запрашиваются прогнозы
//! на окно `{from}/{to}` и усредняются.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{mean, FetchedIntensity, IntensityFetcher};
use crate::intensity::location::Location;

pub const API_URL: &str = "https://api.carbonintensity.org.uk";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

/// Окно `from/to` для запроса прогноза.
pub fn time_window(now: DateTime<Utc>, duration: Duration) -> String {
    let span = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
    format!(
        "{}/{}",
        now.format(TIME_FORMAT),
        (now + span).format(TIME_FORMAT)
    )
}

/// Внешняя часть британского индекса (`SW1A 1AA` → `SW1A`).
pub fn outward_code(postal: &str) -> Option<String> {
    postal
        .split_whitespace()
        .next()
        .map(|code| code.to_uppercase())
}

fn forecasts(entries: &Value) -> Result<Vec<f64>> {
    let entries = entries
        .as_array()
        .context("carbon intensity response has no entries")?;
    Ok(entries
        .iter()
        .filter_map(|entry| entry["intensity"]["forecast"].as_f64())
        .collect())
}

/// Прогнозы из регионального ответа: `data` бывает массивом регионов или одним регионом.
pub fn regional_forecasts(body: &Value) -> Result<Vec<f64>> {
    let region = match &body["data"] {
        Value::Array(regions) => regions.first().context("regional response has no regions")?,
        region => region,
    };
    forecasts(&region["data"])
}

pub fn national_forecasts(body: &Value) -> Result<Vec<f64>> {
    forecasts(&body["data"])
}

pub struct CarbonIntensityGb {
    client: reqwest::Client,
    api_url: String,
}

impl CarbonIntensityGb {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: API_URL.to_string(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        self.client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to query {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?
            .json()
            .await
            .with_context(|| format!("failed to decode response from {url}"))
    }

    async fn regional(&self, postcode: &str, window: Option<&str>) -> Result<f64> {
        let url = match window {
            Some(window) => format!("{}/regional/intensity/{window}/postcode/{postcode}", self.api_url),
            None => format!("{}/regional/postcode/{postcode}", self.api_url),
        };
        let body = self.get_json(&url).await?;
        mean(&regional_forecasts(&body)?).context("regional response has no forecasts")
    }

    async fn national(&self, window: Option<&str>) -> Result<f64> {
        let url = match window {
            Some(window) => format!("{}/intensity/{window}", self.api_url),
            None => format!("{}/intensity", self.api_url),
        };
        let body = self.get_json(&url).await?;
        mean(&national_forecasts(&body)?).context("national response has no forecasts")
    }
}

#[async_trait]
impl IntensityFetcher for CarbonIntensityGb {
    fn name(&self) -> &str {
        "carbonintensitygb"
    }

    fn suitable(&self, location: &Location) -> bool {
        location.country == "GB"
    }

    async fn carbon_intensity(
        &self,
        location: &Location,
        duration: Option<Duration>,
    ) -> Result<FetchedIntensity> {
        let window = duration.map(|d| time_window(Utc::now(), d));

        if let Some(postcode) = location.postal.as_deref().and_then(outward_code) {
            match self.regional(&postcode, window.as_deref()).await {
                Ok(value) => {
                    return Ok(FetchedIntensity {
                        value,
                        is_prediction: duration.is_some(),
                    })
                }
                Err(e) => debug!("Regional carbon intensity for {postcode} failed, using national: {e:#}"),
            }
        }

        Ok(FetchedIntensity {
            value: self.national(window.as_deref()).await?,
            is_prediction: duration.is_some(),
        })
    }
}
