//! Energi Data Service (Дания): наборы `CO2Emis` и `CO2EmisProg`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::{mean, FetchedIntensity, IntensityFetcher};
use crate::intensity::location::Location;

pub const API_URL: &str = "https://api.energidataservice.dk/dataset";

const PRICE_AREAS: [&str; 2] = ["DK1", "DK2"];
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Deserialize)]
struct DatasetResponse {
    records: Vec<EmissionRecord>,
}

#[derive(Debug, Deserialize)]
struct EmissionRecord {
    #[serde(rename = "CO2Emission")]
    co2_emission: Option<f64>,
}

impl DatasetResponse {
    fn emissions(&self) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.co2_emission).collect()
    }
}

/// Округлить время вниз до 5 минут.
pub fn floor_to_five_minutes(time: DateTime<Utc>) -> DateTime<Utc> {
    let minute = time.minute() - time.minute() % 5;
    time.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// Окно прогноза `[now, now + duration]`, обе границы округлены вниз до 5 минут.
pub fn forecast_window(now: DateTime<Utc>, duration: Duration) -> (String, String) {
    let span = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
    let start = floor_to_five_minutes(now);
    let mut end = floor_to_five_minutes(now + span);
    if end <= start {
        end = start + ChronoDuration::minutes(5);
    }
    (
        start.format(TIME_FORMAT).to_string(),
        end.format(TIME_FORMAT).to_string(),
    )
}

pub struct EnergiDataService {
    client: reqwest::Client,
    api_url: String,
}

impl EnergiDataService {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: API_URL.to_string(),
        }
    }

    async fn dataset(&self, dataset: &str, query: &[(&str, String)]) -> Result<DatasetResponse> {
        let url = format!("{}/{dataset}", self.api_url);
        self.client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("failed to query {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?
            .json()
            .await
            .with_context(|| format!("failed to decode {dataset} response"))
    }

    async fn current(&self) -> Result<f64> {
        let mut latest = Vec::with_capacity(PRICE_AREAS.len());
        for area in PRICE_AREAS {
            let response = self
                .dataset(
                    "CO2Emis",
                    &[
                        ("filter", format!(r#"{{"PriceArea":["{area}"]}}"#)),
                        ("sort", "Minutes5UTC DESC".to_string()),
                        ("limit", "1".to_string()),
                    ],
                )
                .await?;
            match response.emissions().first() {
                Some(value) => latest.push(*value),
                None => bail!("no CO2Emis records for price area {area}"),
            }
        }
        mean(&latest).context("no CO2Emis records")
    }

    async fn forecast(&self, duration: Duration) -> Result<f64> {
        let (start, end) = forecast_window(Utc::now(), duration);
        let response = self
            .dataset(
                "CO2EmisProg",
                &[
                    ("start", start.clone()),
                    ("end", end.clone()),
                    ("limit", "0".to_string()),
                ],
            )
            .await?;
        mean(&response.emissions())
            .with_context(|| format!("no CO2EmisProg records between {start} and {end}"))
    }
}

#[async_trait]
impl IntensityFetcher for EnergiDataService {
    fn name(&self) -> &str {
        "energidataservice"
    }

    fn suitable(&self, location: &Location) -> bool {
        location.country == "DK"
    }

    async fn carbon_intensity(
        &self,
        _location: &Location,
        duration: Option<Duration>,
    ) -> Result<FetchedIntensity> {
        match duration {
            Some(duration) => Ok(FetchedIntensity {
                value: self.forecast(duration).await?,
                is_prediction: true,
            }),
            None => Ok(FetchedIntensity {
                value: self.current().await?,
                is_prediction: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn floors_to_five_minutes() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 38, 45).unwrap();
        let floored = floor_to_five_minutes(time);
        assert_eq!(floored, Utc.with_ymd_and_hms(2024, 3, 1, 12, 35, 0).unwrap());
    }

    #[test]
    fn builds_forecast_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 58, 10).unwrap();
        let (start, end) = forecast_window(now, Duration::from_secs(3 * 3600));
        assert_eq!(start, "2024-03-01T23:55");
        assert_eq!(end, "2024-03-02T02:55");

        let (start, end) = forecast_window(now, Duration::from_secs(30));
        assert_eq!(start, "2024-03-01T23:55");
        assert_eq!(end, "2024-03-02T00:00");
    }

    #[test]
    fn decodes_dataset_records() {
        let payload = r#"{
            "total": 2,
            "records": [
                {"Minutes5UTC": "2024-03-01T12:35:00", "PriceArea": "DK1", "CO2Emission": 120.0},
                {"Minutes5UTC": "2024-03-01T12:30:00", "PriceArea": "DK1", "CO2Emission": null},
                {"Minutes5UTC": "2024-03-01T12:25:00", "PriceArea": "DK1", "CO2Emission": 140.0}
            ]
        }"#;
        let response: DatasetResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(response.emissions(), vec![120.0, 140.0]);
        assert_eq!(mean(&response.emissions()), Some(130.0));
    }

    #[test]
    fn suitable_only_for_denmark() {
        let fetcher = EnergiDataService::new(reqwest::Client::new());
        let mut location = Location {
            ok: true,
            country: "DK".to_string(),
            ..Default::default()
        };
        assert!(fetcher.suitable(&location));
        location.country = "SE".to_string();
        assert!(!fetcher.suitable(&location));
    }
}
