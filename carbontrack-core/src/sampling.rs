//! Фоновый сбор замеров мощности.
//!
//! Жизненный цикл: `Created → Begun → (Active ↔ Paused) → Stopped`.
//! Цикл работает задачей tokio: ждёт сигнала активной эпохи, опрашивает
//! компоненты (блокирующие вызовы идут через `spawn_blocking`) и спит
//! `update_interval`. Сигналы эпохи и остановки передаются через
//! `tokio::sync::watch`.
//!
//! Между последней записью замера в эпоху и чтением после паузы нет барьера:
//! замер, начатый до паузы, может попасть в буфер уже завершённой эпохи.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::components::{total_energy_per_epoch, Component, ComponentName};
use crate::error::{TrackerError, TrackerResult};
use crate::logging::TrackerLogger;
use crate::policy::ErrorPolicy;

/// Состояние сборщика.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Begun,
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct EpochSignal {
    epoch: i64,
    active: bool,
}

/// Общий буфер компонентов.
pub type SharedComponents = Arc<Mutex<Vec<Component>>>;

/// Сборщик замеров мощности.
pub struct SamplingWorker {
    components: SharedComponents,
    update_interval: Duration,
    logger: TrackerLogger,
    policy: ErrorPolicy,
    state: WorkerState,
    epoch_counter: i64,
    epoch_started: Option<Instant>,
    epoch_durations: Vec<f64>,
    signal_tx: watch::Sender<EpochSignal>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SamplingWorker {
    pub fn new(
        components: Vec<Component>,
        update_interval: Duration,
        logger: TrackerLogger,
        policy: ErrorPolicy,
    ) -> Self {
        let (signal_tx, _) = watch::channel(EpochSignal::default());
        let (stop_tx, _) = watch::channel(false);
        Self {
            components: Arc::new(Mutex::new(components)),
            update_interval,
            logger,
            policy,
            state: WorkerState::Created,
            epoch_counter: 0,
            epoch_started: None,
            epoch_durations: Vec::new(),
            signal_tx,
            stop_tx,
            task: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn components(&self) -> SharedComponents {
        Arc::clone(&self.components)
    }

    /// Длительности завершённых эпох, секунды.
    pub fn epoch_durations(&self) -> &[f64] {
        &self.epoch_durations
    }

    /// Отфильтровать недоступные компоненты, инициализировать обработчики
    /// и запустить цикл опроса на `handle`.
    pub fn begin(&mut self, handle: &Handle) -> TrackerResult<()> {
        if self.state != WorkerState::Created {
            return Ok(());
        }

        {
            let mut components = lock_components(&self.components)?;
            components.retain(|component| {
                if !component.available() {
                    debug!("Dropping {} component: no available handler", component.name());
                }
                component.available()
            });
            if components.is_empty() {
                return Err(TrackerError::NoComponentsAvailable);
            }

            for idx in 0..components.len() {
                if let Err(e) = components[idx].init() {
                    for initialised in components[..idx].iter_mut() {
                        if let Err(shutdown_err) = initialised.shutdown() {
                            warn!("Failed to shut down {} handler: {shutdown_err}", initialised.name());
                        }
                    }
                    return Err(e);
                }
            }

            let line = components_found_line(&components);
            self.logger.info(&line);
            self.logger.output(&line, 1);
        }

        let task = handle.spawn(sampling_loop(
            Arc::clone(&self.components),
            self.update_interval,
            self.signal_tx.subscribe(),
            self.stop_tx.subscribe(),
            self.policy.clone(),
        ));
        self.task = Some(task);
        self.state = WorkerState::Begun;
        Ok(())
    }

    /// Начать эпоху `epoch` и возобновить опрос.
    pub fn epoch_start(&mut self, epoch: i64) {
        if matches!(self.state, WorkerState::Created | WorkerState::Stopped) {
            return;
        }
        self.epoch_counter = epoch;
        self.epoch_started = Some(Instant::now());
        self.signal_tx.send_replace(EpochSignal {
            epoch,
            active: true,
        });
        self.state = WorkerState::Active;
    }

    /// Приостановить опрос и записать длительность эпохи.
    pub fn epoch_end(&mut self) -> Option<f64> {
        if self.state != WorkerState::Active {
            return None;
        }
        self.signal_tx.send_replace(EpochSignal {
            epoch: self.epoch_counter,
            active: false,
        });
        let duration = self
            .epoch_started
            .take()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.epoch_durations.push(duration);
        self.state = WorkerState::Paused;

        if let Ok(components) = lock_components(&self.components) {
            let missing = components
                .iter()
                .any(|c| c.epoch_average(self.epoch_counter as u64).is_none());
            if missing {
                self.logger
                    .warn("Epoch duration is too short for a measurement to be collected.");
            }
        }
        Some(duration)
    }

    /// Остановить цикл. Идемпотентно; длительность активной эпохи сохраняется.
    pub fn stop(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        if self.state == WorkerState::Active {
            self.epoch_end();
        }
        let was_running = self.state != WorkerState::Created;
        self.stop_tx.send_replace(true);
        self.state = WorkerState::Stopped;
        if was_running {
            self.logger.info("Monitoring thread ended.");
            self.logger.output("Finished monitoring.", 1);
        }
    }

    /// Забрать задачу цикла, чтобы дождаться её завершения.
    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }

    /// Энергия первых `epochs` эпох с учётом PUE, кВт·ч.
    pub fn energy_per_epoch(&self, epochs: usize) -> TrackerResult<Vec<f64>> {
        let durations = &self.epoch_durations[..epochs.min(self.epoch_durations.len())];
        let components = lock_components(&self.components)?;
        Ok(total_energy_per_epoch(&components, durations))
    }

    /// Средняя мощность каждого компонента за эпоху.
    pub fn epoch_averages(&self, epoch: u64) -> TrackerResult<Vec<(ComponentName, Option<Vec<f64>>)>> {
        let components = lock_components(&self.components)?;
        Ok(components
            .iter()
            .map(|c| (c.name(), c.epoch_average(epoch)))
            .collect())
    }
}

/// Строка `The following components were found: ...`.
pub fn components_found_line(components: &[Component]) -> String {
    let described: Vec<String> = components
        .iter()
        .map(|c| {
            format!(
                "{} with device(s) {}.",
                c.name().as_str().to_uppercase(),
                c.devices().join(", ")
            )
        })
        .collect();
    format!("The following components were found: {}", described.join(" "))
}

fn lock_components(components: &Mutex<Vec<Component>>) -> TrackerResult<MutexGuard<'_, Vec<Component>>> {
    components
        .lock()
        .map_err(|_| TrackerError::Runtime("component buffer lock poisoned".to_string()))
}

fn collect_all(components: &Mutex<Vec<Component>>, epoch: i64) -> TrackerResult<()> {
    let mut components = lock_components(components)?;
    for component in components.iter_mut() {
        component.collect(epoch)?;
    }
    Ok(())
}

fn shutdown_all(components: &Mutex<Vec<Component>>) {
    let mut components = match lock_components(components) {
        Ok(components) => components,
        Err(e) => {
            warn!("Cannot shut down handlers: {e}");
            return;
        }
    };
    for component in components.iter_mut() {
        if let Err(e) = component.shutdown() {
            warn!("Failed to shut down {} handler: {e}", component.name());
        }
    }
}

async fn sampling_loop(
    components: SharedComponents,
    update_interval: Duration,
    mut signal_rx: watch::Receiver<EpochSignal>,
    mut stop_rx: watch::Receiver<bool>,
    policy: ErrorPolicy,
) {
    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }

        let signal = *signal_rx.borrow_and_update();
        if !signal.active {
            tokio::select! {
                changed = signal_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        let shared = Arc::clone(&components);
        let collected = tokio::task::spawn_blocking(move || collect_all(&shared, signal.epoch))
            .await
            .unwrap_or_else(|e| Err(TrackerError::Runtime(format!("sampling task failed: {e}"))));
        if let Err(e) = collected {
            policy.handle(&e);
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(update_interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let shared = Arc::clone(&components);
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown_all(&shared)).await {
        warn!("Handler shutdown task failed: {e}");
    }
    debug!("Sampling loop finished");
}
