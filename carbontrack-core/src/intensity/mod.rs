//! Подсистема углеродной интенсивности.
//!
//! # Компоненты
//!
//! - **location**: определение страны и адреса хоста
//! - **fetchers**: источники живых данных и прогнозов
//! - **defaults**: встроенные средние значения по странам
//! - **worker**: фоновое обновление, среднее и прогноз
//!
//! Цепочка [`IntensityChain`] определяет местоположение, опрашивает подходящие
//! источники по порядку и возвращает первое значение, отличное от NaN. Если
//! ни один источник не ответил, берётся среднее для страны (или мира).

pub mod defaults;
pub mod fetchers;
pub mod location;
pub mod worker;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use self::defaults::{default_intensity, DefaultIntensity};
use self::fetchers::{standard_fetchers, IntensityFetcher};
use self::location::{IpInfoLocator, Location, Locator};
use crate::error::TrackerError;
use crate::logging::{format_duration, TrackerLogger};

/// Углеродная интенсивность электроэнергии.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarbonIntensity {
    /// gCO2/kWh.
    pub value: Option<f64>,
    pub is_prediction: bool,
    pub success: bool,
    pub address: String,
    pub message: String,
    /// Источник значения; `None` для встроенного среднего.
    pub fetcher: Option<String>,
}

impl CarbonIntensity {
    /// Значение по умолчанию для страны (`success = false`).
    pub fn from_default(default: &DefaultIntensity, address: &str, is_prediction: bool) -> Self {
        Self {
            value: Some(default.value),
            is_prediction,
            success: false,
            address: address.to_string(),
            message: String::new(),
            fetcher: None,
        }
    }

    /// Значение для расчётов; отсутствие значения трактуется как мировое среднее.
    pub fn value_or_world(&self) -> f64 {
        self.value
            .filter(|v| v.is_finite())
            .unwrap_or(crate::constants::WORLD_2019_CARBON_INTENSITY)
    }
}

/// Сформировать сообщение для результата запроса.
///
/// `duration`: горизонт прогноза в секундах, `None` для текущего значения.
pub fn intensity_message(ci: &CarbonIntensity, duration: Option<f64>, default: &DefaultIntensity) -> String {
    let body = match (ci.is_prediction, ci.success) {
        (true, true) => format!(
            "Carbon intensity for the next {} is predicted to be {:.2} gCO2/kWh",
            format_duration(duration.unwrap_or(0.0), false),
            ci.value_or_world()
        ),
        (true, false) => format!(
            "Failed to predict carbon intensity for the next {}, fallback on average measured intensity",
            format_duration(duration.unwrap_or(0.0), false)
        ),
        (false, true) => format!("Current carbon intensity is {:.2} gCO2/kWh", ci.value_or_world()),
        (false, false) => default.description(&ci.address),
    };
    format!("{body} at detected location: {}.", ci.address)
}

/// Сообщение о средней интенсивности за обучение.
pub fn average_message(value: f64, address: &str) -> String {
    format!(
        "Average carbon intensity during training was {value:.2} gCO2/kWh at detected location: {address}."
    )
}

/// HTTP-клиент с таймаутами для источников и геолокации.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Цепочка источников с запасным значением по умолчанию.
pub struct IntensityChain {
    fetchers: Vec<Box<dyn IntensityFetcher>>,
    locator: Arc<dyn Locator>,
    logger: TrackerLogger,
}

impl IntensityChain {
    pub fn new(
        fetchers: Vec<Box<dyn IntensityFetcher>>,
        locator: Arc<dyn Locator>,
        logger: TrackerLogger,
    ) -> Self {
        Self {
            fetchers,
            locator,
            logger,
        }
    }

    /// Стандартные источники и геолокация по IP.
    pub fn standard(api_keys: &HashMap<String, String>, logger: TrackerLogger) -> Self {
        let client = http_client();
        Self::new(
            standard_fetchers(client.clone(), api_keys),
            Arc::new(IpInfoLocator::new(client)),
            logger,
        )
    }

    async fn resolve_location(&self) -> Option<Location> {
        match self.locator.locate().await {
            Ok(location) if location.ok => Some(location),
            Ok(_) => {
                let err = TrackerError::LocationResolution("location service returned no country".to_string());
                self.logger.debug(&err.to_string());
                None
            }
            Err(e) => {
                let err = TrackerError::LocationResolution(format!("{e:#}"));
                self.logger.debug(&err.to_string());
                None
            }
        }
    }

    /// Текущая интенсивность или прогноз на `duration`.
    pub async fn carbon_intensity(&self, duration: Option<Duration>) -> CarbonIntensity {
        let is_prediction = duration.is_some();
        let duration_secs = duration.map(|d| d.as_secs_f64());

        let Some(location) = self.resolve_location().await else {
            let default = DefaultIntensity::world();
            let mut ci = CarbonIntensity::from_default(&default, location::UNDETECTED_ADDRESS, is_prediction);
            ci.message = intensity_message(&ci, duration_secs, &default);
            return ci;
        };

        let default = default_intensity(Some(&location.country));
        for fetcher in &self.fetchers {
            if !fetcher.suitable(&location) {
                continue;
            }
            match fetcher.carbon_intensity(&location, duration).await {
                Ok(fetched) if !fetched.value.is_nan() => {
                    let mut ci = CarbonIntensity {
                        value: Some(fetched.value),
                        is_prediction: fetched.is_prediction || is_prediction,
                        success: true,
                        address: location.address.clone(),
                        message: String::new(),
                        fetcher: Some(fetcher.name().to_string()),
                    };
                    ci.message = intensity_message(&ci, duration_secs, &default);
                    return ci;
                }
                Ok(_) => {
                    self.logger
                        .debug(&format!("{} returned no carbon intensity value", fetcher.name()));
                }
                Err(e) => {
                    let err = TrackerError::IntensityFetch(format!("{}: {e:#}", fetcher.name()));
                    self.logger.warn(&err.to_string());
                }
            }
        }

        let mut ci = CarbonIntensity::from_default(&default, &location.address, is_prediction);
        ci.message = intensity_message(&ci, duration_secs, &default);
        ci
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::fetchers::FetchedIntensity;
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum Behaviour {
        Unsuitable,
        Fails,
        Returns(f64),
    }

    /// Источник с заданным поведением и счётчиком вызовов.
    pub struct FakeFetcher {
        pub behaviour: Behaviour,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeFetcher {
        pub fn boxed(behaviour: Behaviour) -> Box<dyn IntensityFetcher> {
            Box::new(Self {
                behaviour,
                calls: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl IntensityFetcher for FakeFetcher {
        fn name(&self) -> &str {
            "fake"
        }

        fn suitable(&self, _location: &Location) -> bool {
            !matches!(self.behaviour, Behaviour::Unsuitable)
        }

        async fn carbon_intensity(&self, _location: &Location, duration: Option<Duration>) -> Result<FetchedIntensity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Unsuitable => bail!("unsuitable fetcher called"),
                Behaviour::Fails => bail!("upstream unavailable"),
                Behaviour::Returns(value) => Ok(FetchedIntensity {
                    value,
                    is_prediction: duration.is_some(),
                }),
            }
        }
    }

    pub struct FailingLocator;

    #[async_trait]
    impl Locator for FailingLocator {
        async fn locate(&self) -> Result<Location> {
            bail!("network unreachable")
        }
    }

    pub fn danish_location() -> Location {
        Location {
            ok: true,
            address: "Copenhagen, Capital Region, DK".to_string(),
            country: "DK".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::location::FixedLocator;
    use super::test_support::*;
    use super::*;

    fn chain(fetchers: Vec<Box<dyn IntensityFetcher>>) -> IntensityChain {
        IntensityChain::new(
            fetchers,
            Arc::new(FixedLocator(danish_location())),
            TrackerLogger::capturing(0),
        )
    }

    #[tokio::test]
    async fn first_suitable_value_wins() {
        let chain = chain(vec![
            FakeFetcher::boxed(Behaviour::Unsuitable),
            FakeFetcher::boxed(Behaviour::Fails),
            FakeFetcher::boxed(Behaviour::Returns(42.0)),
            FakeFetcher::boxed(Behaviour::Returns(99.0)),
        ]);
        let ci = chain.carbon_intensity(None).await;
        assert!(ci.success);
        assert_eq!(ci.value, Some(42.0));
        assert_eq!(ci.fetcher.as_deref(), Some("fake"));
        assert_eq!(
            ci.message,
            "Current carbon intensity is 42.00 gCO2/kWh at detected location: Copenhagen, Capital Region, DK."
        );
    }

    #[tokio::test]
    async fn all_failures_fall_back_to_country_default() {
        let chain = chain(vec![
            FakeFetcher::boxed(Behaviour::Unsuitable),
            FakeFetcher::boxed(Behaviour::Fails),
        ]);
        let ci = chain.carbon_intensity(None).await;
        assert!(!ci.success);
        assert_eq!(ci.value, Some(151.65));
        assert!(ci.message.starts_with(
            "Live carbon intensity could not be fetched at detected location: Copenhagen, Capital Region, DK."
        ));
        assert!(ci.message.contains("for DK in 2023 of 151.65 gCO2/kWh."));
    }

    #[tokio::test]
    async fn nan_values_are_skipped() {
        let chain = chain(vec![
            FakeFetcher::boxed(Behaviour::Returns(f64::NAN)),
            FakeFetcher::boxed(Behaviour::Returns(10.0)),
        ]);
        assert_eq!(chain.carbon_intensity(None).await.value, Some(10.0));

        let only_nan = self::chain(vec![FakeFetcher::boxed(Behaviour::Returns(f64::NAN))]);
        let ci = only_nan.carbon_intensity(None).await;
        assert!(!ci.success);
        assert_eq!(ci.value, Some(151.65));
    }

    #[tokio::test]
    async fn undetected_location_skips_fetchers() {
        let fetcher = FakeFetcher {
            behaviour: Behaviour::Returns(1.0),
            calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        };
        let calls = Arc::clone(&fetcher.calls);
        let chain = IntensityChain::new(
            vec![Box::new(fetcher) as Box<dyn IntensityFetcher>],
            Arc::new(FailingLocator),
            TrackerLogger::capturing(0),
        );
        let ci = chain.carbon_intensity(None).await;
        assert!(!ci.success);
        assert_eq!(ci.address, "UNDETECTED");
        assert_eq!(ci.value, Some(475.0));
        assert!(ci
            .message
            .contains("Live carbon intensity could not be fetched at detected location: UNDETECTED."));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prediction_messages() {
        let ok = chain(vec![FakeFetcher::boxed(Behaviour::Returns(80.0))]);
        let ci = ok.carbon_intensity(Some(Duration::from_secs(3723))).await;
        assert!(ci.is_prediction);
        assert_eq!(
            ci.message,
            "Carbon intensity for the next 1:02:03 is predicted to be 80.00 gCO2/kWh \
             at detected location: Copenhagen, Capital Region, DK."
        );

        let failed = chain(vec![FakeFetcher::boxed(Behaviour::Fails)]);
        let ci = failed.carbon_intensity(Some(Duration::from_secs(60))).await;
        assert!(ci.is_prediction);
        assert!(!ci.success);
        assert_eq!(
            ci.message,
            "Failed to predict carbon intensity for the next 0:01:00, fallback on average \
             measured intensity at detected location: Copenhagen, Capital Region, DK."
        );
    }

    #[test]
    fn formats_average_message() {
        assert_eq!(
            average_message(123.456, "London, England, GB"),
            "Average carbon intensity during training was 123.46 gCO2/kWh at detected location: London, England, GB."
        );
    }
}
