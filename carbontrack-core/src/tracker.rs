//! Оркестратор эпох: запуск сборщиков, прогноз и фактический отчёт, снятие мониторинга.
//!
//! Публичный API синхронный. Трекер владеет собственным многопоточным
//! runtime tokio, в котором живут сборщик замеров и обновлятель
//! интенсивности; асинхронные запросы выполняются через `block_on`.
//! Поэтому из асинхронного кода трекер нужно вызывать через
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, BufRead};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::components::{create_components, Component, HandlerContext};
use crate::config::{validate_api_key_names, EpochPlan, TrackerConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::intensity::worker::IntensityWorker;
use crate::intensity::IntensityChain;
use crate::logging::{format_duration, TrackerLogger};
use crate::policy::ErrorPolicy;
use crate::report::{predict_energy, predict_time, ConsumptionReport, ReportKind};
use crate::sampling::SamplingWorker;

/// Сколько ждать завершения цикла опроса при удалении трекера.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Состояние трекера. После `Deleted` все вызовы ничего не делают.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Deleted,
}

/// Источник ответов на вопрос «продолжить обучение?».
pub trait ConfirmPrompt: Send {
    /// Следующая строка ответа; `None`, если ввод закрыт.
    fn read_answer(&mut self) -> io::Result<Option<String>>;
}

/// Ответы из стандартного ввода.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl ConfirmPrompt for StdinPrompt {
    fn read_answer(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then_some(line))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    Continue,
    Quit,
}

/// Трекер энергопотребления и углеродного следа обучения.
///
/// # Примеры использования
///
/// ```no_run
/// use carbontrack_core::{Tracker, TrackerConfig};
///
/// let config = TrackerConfig {
///     epochs: 10,
///     ..TrackerConfig::default()
/// };
/// let mut tracker = Tracker::new(config)?;
/// for _ in 0..10 {
///     tracker.epoch_start();
///     // обучение одной эпохи
///     tracker.epoch_end();
/// }
/// tracker.stop();
/// # Ok::<(), carbontrack_core::TrackerError>(())
/// ```
pub struct Tracker {
    config: TrackerConfig,
    plan: EpochPlan,
    logger: TrackerLogger,
    policy: ErrorPolicy,
    runtime: Option<Runtime>,
    sampler: SamplingWorker,
    intensity: IntensityWorker,
    intensity_task: Option<JoinHandle<()>>,
    prompt: Box<dyn ConfirmPrompt>,
    lifecycle: Lifecycle,
    epoch_counter: u64,
}

impl Tracker {
    /// Создать трекер с реальными обработчиками, геолокацией по IP и стандартными источниками.
    pub fn new(config: TrackerConfig) -> TrackerResult<Self> {
        config.validate()?;
        let logger = TrackerLogger::new(config.log_dir.as_deref(), &config.log_file_prefix, config.verbose)?;
        let names = config
            .component_names()
            .map_err(|e| TrackerError::Configuration(format!("{e:#}")))?;
        let components = create_components(&names, &HandlerContext::from_config(&config), &logger);
        let chain = IntensityChain::standard(&config.api_keys, logger.clone());
        Self::with_parts(config, logger, components, chain, Box::new(StdinPrompt))
    }

    /// Создать трекер из готовых частей. Сборщик запускается на первой эпохе,
    /// обновлятель интенсивности стартует сразу.
    pub fn with_parts(
        config: TrackerConfig,
        logger: TrackerLogger,
        components: Vec<Component>,
        chain: IntensityChain,
        prompt: Box<dyn ConfirmPrompt>,
    ) -> TrackerResult<Self> {
        let plan = config.epoch_plan()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("carbontrack")
            .enable_all()
            .build()?;

        let policy = ErrorPolicy::new(config.ignore_errors, logger.clone());
        let sampler = SamplingWorker::new(components, config.update_interval(), logger.clone(), policy.clone());
        let intensity = IntensityWorker::new(chain, config.intensity_refresh_interval(), logger.clone());
        let intensity_task = intensity.start(runtime.handle());

        debug!(
            "Tracker created: epochs={}, epochs_before_pred={}, monitor_epochs={}",
            plan.epochs, plan.epochs_before_pred, plan.monitor_epochs
        );

        Ok(Self {
            config,
            plan,
            logger,
            policy,
            runtime: Some(runtime),
            sampler,
            intensity,
            intensity_task: Some(intensity_task),
            prompt,
            lifecycle: Lifecycle::Active,
            epoch_counter: 0,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Число начатых эпох.
    pub fn epoch_counter(&self) -> u64 {
        self.epoch_counter
    }

    pub fn epoch_plan(&self) -> EpochPlan {
        self.plan
    }

    /// Длительности завершённых эпох, секунды.
    pub fn epoch_durations(&self) -> &[f64] {
        self.sampler.epoch_durations()
    }

    pub fn logger(&self) -> &TrackerLogger {
        &self.logger
    }

    /// Начать эпоху. Первая эпоха запускает сборщик замеров.
    pub fn epoch_start(&mut self) {
        if !self.ensure_active() {
            return;
        }
        if self.epoch_counter == 0 {
            let Some(handle) = self.runtime.as_ref().map(|rt| rt.handle().clone()) else {
                return;
            };
            if let Err(e) = self.sampler.begin(&handle) {
                self.fail(&e);
                return;
            }
        }
        self.epoch_counter += 1;
        self.sampler.epoch_start(self.epoch_counter as i64);
    }

    /// Завершить эпоху. После `epochs_before_pred` эпох выводится прогноз,
    /// после `monitor_epochs` выводится фактический отчёт и мониторинг снимается.
    pub fn epoch_end(&mut self) {
        if !self.ensure_active() {
            return;
        }
        let Some(duration) = self.sampler.epoch_end() else {
            return;
        };
        if let Err(e) = self.end_epoch(duration) {
            self.fail(&e);
        }
    }

    fn end_epoch(&mut self, duration: f64) -> TrackerResult<()> {
        self.log_epoch(duration)?;

        if self.plan.epochs_before_pred > 0 && self.epoch_counter == self.plan.epochs_before_pred {
            self.output_predicted()?;
            if self.config.stop_and_confirm && self.confirm()? == Confirmation::Quit {
                self.quit();
            }
        }

        if self.epoch_counter == self.plan.monitor_epochs {
            self.output_actual()?;
            self.delete();
        }
        Ok(())
    }

    /// Прервать мониторинг досрочно: фактический отчёт по завершённым эпохам.
    pub fn stop(&mut self) {
        if !self.ensure_active() {
            return;
        }
        self.logger
            .info("Training was interrupted before all epochs were monitored.");
        // текущая эпоха была начата, но не завершена
        self.epoch_counter = self.epoch_counter.saturating_sub(1);
        if let Err(e) = self.output_actual() {
            self.fail(&e);
            return;
        }
        self.delete();
    }

    /// Задать ключи API источников интенсивности. Обновлятель интенсивности
    /// пересоздаётся с новыми источниками.
    pub fn set_api_keys(&mut self, api_keys: HashMap<String, String>) -> TrackerResult<()> {
        if self.lifecycle == Lifecycle::Deleted {
            return Ok(());
        }
        validate_api_key_names(api_keys.keys())
            .map_err(|e| TrackerError::Configuration(format!("{e:#}")))?;

        let normalized = api_keys
            .into_iter()
            .map(|(name, key)| (name.to_lowercase(), key));
        self.config.api_keys.extend(normalized);

        let Some(runtime) = self.runtime.as_ref() else {
            return Ok(());
        };
        self.intensity.stop();
        if let Some(task) = self.intensity_task.take() {
            task.abort();
        }
        let chain = IntensityChain::standard(&self.config.api_keys, self.logger.clone());
        self.intensity = IntensityWorker::new(chain, self.config.intensity_refresh_interval(), self.logger.clone());
        self.intensity_task = Some(self.intensity.start(runtime.handle()));
        Ok(())
    }

    fn ensure_active(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Deleted {
            return false;
        }
        if self.policy.is_tripped() {
            self.delete();
            return false;
        }
        true
    }

    fn fail(&mut self, err: &TrackerError) {
        self.policy.handle(err);
        self.delete();
    }

    fn log_epoch(&self, duration: f64) -> TrackerResult<()> {
        self.logger.info(&format!("Epoch {}:", self.epoch_counter));
        self.logger
            .info(&format!("Duration: {}", format_duration(duration, true)));
        for (name, average) in self.sampler.epoch_averages(self.epoch_counter)? {
            let rendered = match average {
                Some(watts) => format!(
                    "[{}]",
                    watts
                        .iter()
                        .map(|w| w.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
                None => "None".to_string(),
            };
            self.logger
                .info(&format!("Average power usage (W) for {name}: {rendered}"));
        }
        Ok(())
    }

    fn output_predicted(&self) -> TrackerResult<()> {
        let epoch_energies = self.sampler.energy_per_epoch(self.epoch_counter as usize)?;
        let energy = predict_energy(self.plan.epochs, &epoch_energies);
        let time = predict_time(self.plan.epochs, self.sampler.epoch_durations());

        let horizon = Duration::try_from_secs_f64(time).unwrap_or_default();
        let ci = self.block_on(self.intensity.predict(horizon))?;
        let report = ConsumptionReport::new(
            ReportKind::Predicted { epochs: self.plan.epochs },
            time,
            energy,
            ci.value_or_world(),
            self.config.interpretable,
        );
        self.logger
            .output(&report.render(self.config.decimal_precision), 0);
        Ok(())
    }

    fn output_actual(&self) -> TrackerResult<()> {
        let completed = self.epoch_counter as usize;
        let energy: f64 = self.sampler.energy_per_epoch(completed)?.iter().sum();
        let durations = self.sampler.epoch_durations();
        let time: f64 = durations[..completed.min(durations.len())].iter().sum();

        let ci = self.block_on(self.intensity.average())?;
        let kind = if self.plan.epochs_before_pred == 0 {
            ReportKind::ActualOnly
        } else {
            ReportKind::Actual {
                epochs: self.epoch_counter,
            }
        };
        let report = ConsumptionReport::new(kind, time, energy, ci.value_or_world(), self.config.interpretable);
        self.logger
            .output(&report.render(self.config.decimal_precision), 0);
        Ok(())
    }

    fn confirm(&mut self) -> TrackerResult<Confirmation> {
        self.logger.output("Continue training (y/n)?", 0);
        loop {
            let answer = self.prompt.read_answer()?.ok_or_else(|| {
                TrackerError::Runtime("input closed while waiting for confirmation".to_string())
            })?;
            match answer.trim().to_lowercase().as_str() {
                "y" => {
                    self.logger.output("Continuing...", 0);
                    return Ok(Confirmation::Continue);
                }
                "n" => {
                    self.logger.info("Session ended by user.");
                    self.logger.output("Quitting...", 0);
                    return Ok(Confirmation::Quit);
                }
                _ => self
                    .logger
                    .output("Input not recognized. Try again (y/n):", 0),
            }
        }
    }

    fn block_on<F: Future>(&self, future: F) -> TrackerResult<F::Output> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| TrackerError::Runtime("tracker runtime is shut down".to_string()))?;
        Ok(runtime.block_on(future))
    }

    /// Снять мониторинг. Выполняется один раз.
    fn delete(&mut self) {
        if self.lifecycle == Lifecycle::Deleted {
            return;
        }
        self.sampler.stop();
        self.intensity.stop();
        self.lifecycle = Lifecycle::Deleted;
        debug!("Tracker deleted after {} epoch(s)", self.epoch_counter);
    }

    /// Дождаться остановки сборщика (с вызовом `shutdown()` обработчиков)
    /// не дольше [`SHUTDOWN_WAIT`] и погасить runtime.
    fn shutdown_runtime(&mut self) {
        if let Some(task) = self.intensity_task.take() {
            task.abort();
        }
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            // внутри чужого runtime блокироваться нельзя
            runtime.shutdown_background();
            return;
        }
        if let Some(task) = self.sampler.take_task() {
            match runtime.block_on(tokio::time::timeout(SHUTDOWN_WAIT, task)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Sampling task failed: {e}"),
                Err(_) => warn!("Sampling task did not finish within {SHUTDOWN_WAIT:?}"),
            }
        }
        runtime.shutdown_timeout(SHUTDOWN_WAIT);
    }

    /// Пользователь отказался продолжать: снять мониторинг и завершить процесс.
    fn quit(&mut self) -> ! {
        self.delete();
        self.shutdown_runtime();
        std::process::exit(0);
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.delete();
        self.shutdown_runtime();
    }
}
