use crate::application::session::Session;
use crate::application::session_cache::SessionCache;
use crate::domain::errors::{ModelError, SeriesError, SessionError};
use crate::domain::events::EngineEvent;
use crate::domain::features::FeatureBuilder;
use crate::domain::ports::{MarketDataFetcher, ModelTrainer, PredictionLog};
use crate::domain::types::{Bar, Direction, PredictionRecord, SessionKey};
use crate::infrastructure::event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The (key, generation) pair the scheduler currently drives tasks against.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveTarget {
    key: SessionKey,
    generation: u64,
}

/// Requests handled by the scheduler's command loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Make a different key the active session.
    Switch(SessionKey),
    /// Rebuild a key whose session hit an artifact inconsistency. Sent by
    /// the refresh tasks themselves.
    Rebuild(SessionKey),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence shared by all three refresh tasks.
    pub interval: Duration,
    pub lookback: usize,
    /// Symbols the ticker task polls spot prices for.
    pub ticker_symbols: Vec<String>,
}

/// Drives the three periodic refresh tasks (ticker, prediction, accuracy)
/// for whichever key is active.
///
/// Tasks are never cancelled in place. Each spawned task captures the
/// (key, generation) it was started against and re-checks it before doing
/// work and again before publishing; a task whose target is gone simply
/// exits, and `start` for the replacement target has already spawned fresh
/// tasks. This keeps results from a superseded session from ever reaching
/// the log or the event bus.
pub struct PredictionScheduler {
    cache: Arc<SessionCache>,
    fetcher: Arc<dyn MarketDataFetcher>,
    trainer: Arc<dyn ModelTrainer>,
    log: Arc<dyn PredictionLog>,
    events: EventBus,
    config: SchedulerConfig,
    active: watch::Sender<Option<ActiveTarget>>,
    commands: mpsc::Sender<SchedulerCommand>,
}

impl PredictionScheduler {
    pub fn new(
        cache: Arc<SessionCache>,
        fetcher: Arc<dyn MarketDataFetcher>,
        trainer: Arc<dyn ModelTrainer>,
        log: Arc<dyn PredictionLog>,
        events: EventBus,
        config: SchedulerConfig,
        commands: mpsc::Sender<SchedulerCommand>,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            cache,
            fetcher,
            trainer,
            log,
            events,
            config,
            active,
            commands,
        }
    }

    /// Resolve (or build) the session for `key`, make it the active target
    /// and spawn its refresh tasks. Tasks belonging to a previous target
    /// notice the change at their next staleness check and exit.
    pub async fn start(&self, key: SessionKey) -> Result<(), SessionError> {
        self.events
            .publish(EngineEvent::SessionLoading { key: key.clone() })
            .await;

        let session = match self.cache.get_or_build(&key).await {
            Ok(session) => session,
            Err(err) => {
                error!(
                    "PredictionScheduler: Could not start session for {}: {}",
                    key, err
                );
                return Err(err);
            }
        };

        let target = ActiveTarget {
            key: key.clone(),
            generation: session.generation,
        };
        self.active.send_replace(Some(target.clone()));
        self.events
            .publish(EngineEvent::SessionReady {
                key,
                generation: session.generation,
            })
            .await;

        self.spawn_ticker_task(target.clone());
        self.spawn_accuracy_task(Arc::clone(&session), target.clone());
        self.spawn_prediction_task(session, target);
        Ok(())
    }

    /// Cancel-and-switch: retire the current target immediately, then start
    /// the new key. In-flight work for the old target is discarded at its
    /// next staleness check, never awaited, so a slow build of the new
    /// session cannot let old results slip out meanwhile.
    pub async fn switch_key(&self, new_key: SessionKey) -> Result<(), SessionError> {
        let current = self.active.borrow().clone();
        if let Some(target) = current {
            if target.key == new_key
                && self.cache.generation_of(&new_key).await == Some(target.generation)
            {
                debug!(
                    "PredictionScheduler: {} is already the active session",
                    new_key
                );
                return Ok(());
            }
            info!(
                "PredictionScheduler: Switching {} -> {}",
                target.key, new_key
            );
        }

        self.active.send_replace(None);
        self.start(new_key).await
    }

    /// Retire the active target without starting a new one. Running tasks
    /// exit at their next staleness check.
    pub fn stop(&self) {
        if self.active.send_replace(None).is_some() {
            info!("PredictionScheduler: Stopped");
        }
    }

    /// Serve `Switch` and `Rebuild` requests until the channel closes.
    pub async fn run(&self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        info!("PredictionScheduler: Command loop started");
        while let Some(command) = commands.recv().await {
            match command {
                SchedulerCommand::Switch(key) => {
                    if let Err(e) = self.switch_key(key.clone()).await {
                        error!("PredictionScheduler: Switch to {} failed: {}", key, e);
                    }
                }
                SchedulerCommand::Rebuild(key) => {
                    let still_active = self
                        .active
                        .borrow()
                        .as_ref()
                        .map(|target| target.key == key)
                        .unwrap_or(false);
                    if !still_active {
                        debug!("PredictionScheduler: Ignoring rebuild for inactive {}", key);
                        continue;
                    }

                    self.cache.invalidate(&key).await;
                    if let Err(e) = self.start(key.clone()).await {
                        error!("PredictionScheduler: Rebuild of {} failed: {}", key, e);
                    }
                }
            }
        }
        debug!("PredictionScheduler: Command loop ended");
    }

    fn guard_for(&self, target: ActiveTarget) -> TaskGuard {
        TaskGuard {
            cache: Arc::clone(&self.cache),
            active: self.active.subscribe(),
            target,
        }
    }

    fn spawn_ticker_task(&self, target: ActiveTarget) {
        let guard = self.guard_for(target);
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let symbols = self.config.ticker_symbols.clone();
        let interval = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if guard.is_stale().await {
                    debug!(
                        "PredictionScheduler: Ticker task for {} retired",
                        guard.target.key
                    );
                    break;
                }

                let mut prices = Vec::with_capacity(symbols.len());
                for symbol in &symbols {
                    match fetcher.fetch_ticker(symbol).await {
                        Ok(price) => prices.push((symbol.clone(), price)),
                        Err(e) => {
                            warn!(
                                "PredictionScheduler: Ticker fetch failed for {}: {:#}",
                                symbol, e
                            );
                        }
                    }
                }

                if guard.is_stale().await {
                    debug!(
                        "PredictionScheduler: Discarding stale ticker prices for {}",
                        guard.target.key
                    );
                    break;
                }
                for (symbol, price) in prices {
                    events
                        .publish(EngineEvent::TickerUpdated { symbol, price })
                        .await;
                }
            }
        });
    }

    fn spawn_prediction_task(&self, session: Arc<Session>, target: ActiveTarget) {
        let guard = self.guard_for(target);
        let fetcher = Arc::clone(&self.fetcher);
        let log = Arc::clone(&self.log);
        let events = self.events.clone();
        let commands = self.commands.clone();
        let lookback = self.config.lookback;
        let interval = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if guard.is_stale().await {
                    debug!(
                        "PredictionScheduler: Prediction task for {} retired",
                        guard.target.key
                    );
                    break;
                }

                match run_prediction_cycle(&session, fetcher.as_ref(), lookback).await {
                    Ok(outcome) => {
                        if guard.is_stale().await {
                            debug!(
                                "PredictionScheduler: Discarding stale prediction for {}",
                                guard.target.key
                            );
                            break;
                        }

                        // The append is the single authority on whether this
                        // bar is new; only a new bar earns a durable record.
                        let appended = session.series.append(outcome.bar);
                        if appended {
                            let record = PredictionRecord::new(
                                &session.key,
                                outcome.bar.timestamp,
                                outcome.predicted_price,
                            );
                            if let Err(e) = log.append(&record).await {
                                error!(
                                    "PredictionScheduler: Failed to append prediction record for {}: {:#}",
                                    session.key, e
                                );
                            }
                        }

                        events
                            .publish(EngineEvent::PredictionUpdated {
                                key: session.key.clone(),
                                generation: session.generation,
                                predicted_price: outcome.predicted_price,
                                direction: outcome.direction,
                                bar_timestamp: outcome.bar.timestamp,
                            })
                            .await;
                    }
                    Err(err) => match classify_failure(&err) {
                        CycleFailure::NotReady => {
                            debug!(
                                "PredictionScheduler: {} not ready for prediction: {}",
                                guard.target.key, err
                            );
                        }
                        CycleFailure::Inconsistent => {
                            error!(
                                "PredictionScheduler: Artifact inconsistency for {}: {:#}; scheduling rebuild",
                                guard.target.key, err
                            );
                            guard.cache.invalidate(&guard.target.key).await;
                            let _ = commands
                                .send(SchedulerCommand::Rebuild(guard.target.key.clone()))
                                .await;
                            break;
                        }
                        CycleFailure::Transient => {
                            warn!(
                                "PredictionScheduler: Prediction cycle failed for {}: {:#}",
                                guard.target.key, err
                            );
                        }
                    },
                }
            }
        });
    }

    fn spawn_accuracy_task(&self, session: Arc<Session>, target: ActiveTarget) {
        let guard = self.guard_for(target);
        let trainer = Arc::clone(&self.trainer);
        let events = self.events.clone();
        let commands = self.commands.clone();
        let lookback = self.config.lookback;
        let interval = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if guard.is_stale().await {
                    debug!(
                        "PredictionScheduler: Accuracy task for {} retired",
                        guard.target.key
                    );
                    break;
                }

                match evaluate_holdout(&session, trainer.as_ref(), lookback) {
                    Ok(mse) => {
                        if guard.is_stale().await {
                            debug!(
                                "PredictionScheduler: Discarding stale accuracy figure for {}",
                                guard.target.key
                            );
                            break;
                        }
                        events
                            .publish(EngineEvent::AccuracyUpdated {
                                key: session.key.clone(),
                                generation: session.generation,
                                mse,
                            })
                            .await;
                    }
                    Err(err) => match classify_failure(&err) {
                        CycleFailure::NotReady => {
                            debug!(
                                "PredictionScheduler: {} not ready for accuracy evaluation: {}",
                                guard.target.key, err
                            );
                        }
                        CycleFailure::Inconsistent => {
                            error!(
                                "PredictionScheduler: Artifact inconsistency for {}: {:#}; scheduling rebuild",
                                guard.target.key, err
                            );
                            guard.cache.invalidate(&guard.target.key).await;
                            let _ = commands
                                .send(SchedulerCommand::Rebuild(guard.target.key.clone()))
                                .await;
                            break;
                        }
                        CycleFailure::Transient => {
                            warn!(
                                "PredictionScheduler: Accuracy evaluation failed for {}: {:#}",
                                guard.target.key, err
                            );
                        }
                    },
                }
            }
        });
    }
}

/// Staleness guard carried by every spawned task: the target it was spawned
/// against, checked once before work starts and once more before results
/// are published.
struct TaskGuard {
    cache: Arc<SessionCache>,
    active: watch::Receiver<Option<ActiveTarget>>,
    target: ActiveTarget,
}

impl TaskGuard {
    /// True when the scheduler drives a different target, or the cache no
    /// longer holds this generation for the key (invalidated or rebuilt).
    async fn is_stale(&self) -> bool {
        {
            let current = self.active.borrow();
            if current.as_ref() != Some(&self.target) {
                return true;
            }
        }
        self.cache.generation_of(&self.target.key).await != Some(self.target.generation)
    }
}

struct PredictionOutcome {
    bar: Bar,
    predicted_price: f64,
    direction: Direction,
}

/// One prediction cycle, free of side effects: the caller decides whether
/// the outcome is still worth publishing.
async fn run_prediction_cycle(
    session: &Session,
    fetcher: &dyn MarketDataFetcher,
    lookback: usize,
) -> anyhow::Result<PredictionOutcome> {
    let bar = fetcher.fetch_latest_bar(&session.key).await?;
    let predicted_price = session.predict_next_price(lookback)?;
    let direction = match session.series.latest() {
        Some(previous) if predicted_price > previous.close => Direction::Up,
        _ => Direction::Down,
    };
    Ok(PredictionOutcome {
        bar,
        predicted_price,
        direction,
    })
}

fn evaluate_holdout(
    session: &Session,
    trainer: &dyn ModelTrainer,
    lookback: usize,
) -> anyhow::Result<f64> {
    let snapshot = session.series.snapshot();
    let training = FeatureBuilder::build_training_set(&snapshot, &session.normalizers, lookback)?;
    let (_, holdout) = trainer.holdout_split(training);
    holdout.mean_squared_error(session.model.as_ref())
}

enum CycleFailure {
    /// The series does not hold enough bars yet; skip this cycle.
    NotReady,
    /// Model and window shapes disagree; the session must be rebuilt.
    Inconsistent,
    /// Anything else, most likely a fetch error; retry next cycle.
    Transient,
}

fn classify_failure(err: &anyhow::Error) -> CycleFailure {
    if err.downcast_ref::<SeriesError>().is_some() {
        CycleFailure::NotReady
    } else if matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::WindowMismatch { .. })
    ) {
        CycleFailure::Inconsistent
    } else {
        CycleFailure::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure_distinguishes_error_kinds() {
        let not_ready: anyhow::Error = SeriesError::InsufficientData { have: 3, need: 94 }.into();
        assert!(matches!(classify_failure(&not_ready), CycleFailure::NotReady));

        let inconsistent: anyhow::Error =
            ModelError::WindowMismatch { expected: 94, actual: 60 }.into();
        assert!(matches!(
            classify_failure(&inconsistent),
            CycleFailure::Inconsistent
        ));

        let transient = anyhow::anyhow!("connection reset by peer");
        assert!(matches!(classify_failure(&transient), CycleFailure::Transient));
    }
}
