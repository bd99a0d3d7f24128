//! Фоновое обновление углеродной интенсивности.
//!
//! Каждые `refresh_interval` (по умолчанию 900 с) запрашивается текущее
//! значение; успешные и конечные значения попадают в историю. История
//! используется для среднего за обучение и для взвешенного прогноза.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::defaults::DefaultIntensity;
use super::{average_message, intensity_message, CarbonIntensity, IntensityChain};
use crate::logging::TrackerLogger;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(900);

struct Shared {
    chain: IntensityChain,
    refresh_interval: Duration,
    history: Mutex<Vec<CarbonIntensity>>,
    logger: TrackerLogger,
    stop_tx: watch::Sender<bool>,
}

/// Фоновый обновлятель интенсивности. Клоны разделяют историю.
#[derive(Clone)]
pub struct IntensityWorker {
    shared: Arc<Shared>,
}

impl IntensityWorker {
    pub fn new(chain: IntensityChain, refresh_interval: Duration, logger: TrackerLogger) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                chain,
                refresh_interval,
                history: Mutex::new(Vec::new()),
                logger,
                stop_tx,
            }),
        }
    }

    /// Запустить цикл обновления на `handle`.
    pub fn start(&self, handle: &Handle) -> JoinHandle<()> {
        let worker = self.clone();
        let mut stop_rx = self.shared.stop_tx.subscribe();
        handle.spawn(async move {
            loop {
                if *stop_rx.borrow_and_update() {
                    break;
                }
                worker.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(worker.shared.refresh_interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Carbon intensity worker finished");
        })
    }

    /// Остановить цикл. Идемпотентно; ожидание прерывается сразу.
    pub fn stop(&self) {
        self.shared.stop_tx.send_replace(true);
    }

    /// Запросить текущую интенсивность и сохранить её, если запрос удался.
    pub async fn refresh(&self) -> CarbonIntensity {
        let ci = self.shared.chain.carbon_intensity(None).await;
        let usable = ci.success && ci.value.is_some_and(f64::is_finite);
        if usable {
            if let Ok(mut history) = self.shared.history.lock() {
                history.push(ci.clone());
            }
        } else {
            self.shared.logger.debug(&ci.message);
        }
        ci
    }

    /// Снимок истории успешных значений.
    pub fn history(&self) -> Vec<CarbonIntensity> {
        self.shared
            .history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    fn history_values(&self) -> Vec<f64> {
        self.history().iter().map(CarbonIntensity::value_or_world).collect()
    }

    /// Средняя интенсивность за время обучения.
    pub async fn average(&self) -> CarbonIntensity {
        let mut fallback = None;
        if self.history().is_empty() {
            fallback = Some(self.refresh().await);
        }

        let history = self.history();
        let ci = match history.last() {
            Some(last) => {
                let values = self.history_values();
                let value = values.iter().sum::<f64>() / values.len() as f64;
                CarbonIntensity {
                    value: Some(value),
                    is_prediction: false,
                    success: true,
                    address: last.address.clone(),
                    message: average_message(value, &last.address),
                    fetcher: last.fetcher.clone(),
                }
            }
            None => match fallback {
                Some(ci) => ci,
                None => {
                    let default = DefaultIntensity::world();
                    let mut ci = CarbonIntensity::from_default(&default, super::location::UNDETECTED_ADDRESS, false);
                    ci.message = intensity_message(&ci, None, &default);
                    ci
                }
            },
        };

        self.shared.logger.info(&ci.message);
        self.shared.logger.output(&ci.message, 2);
        ci
    }

    /// Прогноз на `duration`: свежее значение взвешивается по числу
    /// интервалов обновления, которые уложатся в `duration`.
    pub async fn predict(&self, duration: Duration) -> CarbonIntensity {
        let mut ci = self.shared.chain.carbon_intensity(Some(duration)).await;
        ci.is_prediction = true;

        let fresh = ci.value_or_world();
        let weight = prediction_weight(duration, self.shared.refresh_interval);
        ci.value = Some(weighted_mean(&self.history_values(), fresh, weight));
        // прогнозные шаблоны не используют среднее по стране
        ci.message = intensity_message(&ci, Some(duration.as_secs_f64()), &DefaultIntensity::world());

        self.shared.logger.info(&ci.message);
        self.shared.logger.output(&ci.message, 2);
        ci
    }
}

/// Сколько интервалов обновления целиком уложится в `duration`.
fn prediction_weight(duration: Duration, refresh_interval: Duration) -> f64 {
    if refresh_interval.is_zero() {
        return 0.0;
    }
    (duration.as_secs_f64() / refresh_interval.as_secs_f64()).floor()
}

/// Среднее по истории и свежему значению, взятому `1 + weight` раз.
fn weighted_mean(history: &[f64], fresh: f64, weight: f64) -> f64 {
    let fresh_count = 1.0 + weight;
    (history.iter().sum::<f64>() + fresh * fresh_count) / (history.len() as f64 + fresh_count)
}
