//! Определение местоположения хоста.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Адрес, используемый, когда местоположение определить не удалось.
pub const UNDETECTED_ADDRESS: &str = "UNDETECTED";

pub const IPINFO_URL: &str = "https://ipinfo.io/json";

/// Местоположение хоста.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub ok: bool,
    /// Человекочитаемый адрес: `город, регион, страна`.
    pub address: String,
    /// Код страны ISO alpha-2.
    pub country: String,
    pub postal: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn undetected() -> Self {
        Self {
            ok: false,
            address: UNDETECTED_ADDRESS.to_string(),
            ..Default::default()
        }
    }
}

/// Источник местоположения.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn locate(&self) -> Result<Location>;
}

/// Геолокация по IP через ipinfo.io.
pub struct IpInfoLocator {
    client: reqwest::Client,
    url: String,
}

impl IpInfoLocator {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_url(client, IPINFO_URL)
    }

    pub fn with_url(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    loc: Option<String>,
    postal: Option<String>,
}

impl IpInfoResponse {
    fn into_location(self) -> Location {
        let (latitude, longitude) = self
            .loc
            .as_deref()
            .and_then(parse_coordinates)
            .map(|(lat, lon)| (Some(lat), Some(lon)))
            .unwrap_or((None, None));

        let country = self.country.unwrap_or_default().to_uppercase();
        let address = [self.city.as_deref(), self.region.as_deref(), Some(country.as_str())]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Location {
            ok: !country.is_empty(),
            address: if address.is_empty() {
                UNDETECTED_ADDRESS.to_string()
            } else {
                address
            },
            country,
            postal: self.postal.filter(|p| !p.is_empty()),
            latitude,
            longitude,
        }
    }
}

fn parse_coordinates(loc: &str) -> Option<(f64, f64)> {
    let (lat, lon) = loc.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

#[async_trait]
impl Locator for IpInfoLocator {
    async fn locate(&self) -> Result<Location> {
        let response: IpInfoResponse = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to query {}", self.url))?
            .error_for_status()
            .context("geolocation service returned an error status")?
            .json()
            .await
            .context("failed to decode geolocation response")?;
        Ok(response.into_location())
    }
}

/// Фиксированное местоположение (офлайн-хосты и тесты).
#[derive(Debug, Clone)]
pub struct FixedLocator(pub Location);

#[async_trait]
impl Locator for FixedLocator {
    async fn locate(&self) -> Result<Location> {
        Ok(self.0.clone())
    }
}
