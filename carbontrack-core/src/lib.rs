//! Учёт энергопотребления и углеродного следа обучения по эпохам.
//!
//! [`Tracker`] опрашивает обработчики GPU и CPU в фоне, пока эпоха активна,
//! пересчитывает замеры в кВт·ч и граммы CO2eq по углеродной интенсивности
//! текущего региона и выводит прогноз и фактическое потребление.

pub mod components;
pub mod config;
pub mod constants;
pub mod error;
pub mod intensity;
pub mod logging;
pub mod policy;
pub mod report;
pub mod sampling;
pub mod tracker;

pub use config::{SimulatedDevice, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use tracker::{ConfirmPrompt, Lifecycle, StdinPrompt, Tracker};
