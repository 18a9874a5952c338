use crate::application::session::Session;
use crate::domain::errors::SessionError;
use crate::domain::normalizer::{NormalizerSet, RangeNormalizer};
use crate::domain::ports::{
    ArtifactStore, MODEL_SLOT, MarketDataFetcher, ModelArtifact, ModelTag, ModelTrainer,
    PredictionModel,
};
use crate::domain::series::{SeriesSnapshot, SlidingSeries};
use crate::domain::types::{Channel, SessionKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

type BuildOutcome = Result<Arc<Session>, SessionError>;

enum Slot {
    Ready(Arc<Session>),
    Building {
        build_id: u64,
        receiver: watch::Receiver<Option<BuildOutcome>>,
    },
}

/// Who does the work for one `get_or_build` call.
enum Admission {
    Hit(Arc<Session>),
    Join(watch::Receiver<Option<BuildOutcome>>),
    Lead(watch::Sender<Option<BuildOutcome>>, u64),
}

struct CacheState {
    entries: HashMap<SessionKey, Slot>,
    /// Per-key install counter. Survives invalidation so a rebuilt session
    /// never reuses a generation number.
    generations: HashMap<SessionKey, u64>,
    next_build_id: u64,
}

struct SessionParts {
    normalizers: NormalizerSet,
    model: Arc<dyn PredictionModel>,
    series: SlidingSeries,
}

/// Keyed registry of prediction sessions with single-flight builds.
///
/// The first caller for an absent key becomes the leader and runs the full
/// fetch/fit/train cycle; concurrent callers for the same key wait on the
/// leader's outcome instead of stampeding the exchange and the trainer. A
/// failed build reverts the entry to absent, so the next access retries.
pub struct SessionCache {
    fetcher: Arc<dyn MarketDataFetcher>,
    trainer: Arc<dyn ModelTrainer>,
    store: Arc<dyn ArtifactStore>,
    history_limit: usize,
    lookback: usize,
    state: Mutex<CacheState>,
}

impl SessionCache {
    pub fn new(
        fetcher: Arc<dyn MarketDataFetcher>,
        trainer: Arc<dyn ModelTrainer>,
        store: Arc<dyn ArtifactStore>,
        history_limit: usize,
        lookback: usize,
    ) -> Self {
        Self {
            fetcher,
            trainer,
            store,
            history_limit,
            lookback,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                generations: HashMap::new(),
                next_build_id: 0,
            }),
        }
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    /// Return the key's session, building it first if necessary.
    pub async fn get_or_build(&self, key: &SessionKey) -> BuildOutcome {
        let admission = {
            let mut state = self.state.lock().await;
            match state.entries.get(key) {
                Some(Slot::Ready(session)) => Admission::Hit(Arc::clone(session)),
                Some(Slot::Building { receiver, .. }) => Admission::Join(receiver.clone()),
                None => {
                    state.next_build_id += 1;
                    let build_id = state.next_build_id;
                    let (sender, receiver) = watch::channel(None);
                    state
                        .entries
                        .insert(key.clone(), Slot::Building { build_id, receiver });
                    Admission::Lead(sender, build_id)
                }
            }
        };

        match admission {
            Admission::Hit(session) => {
                debug!("SessionCache: Hit for {}", key);
                Ok(session)
            }
            Admission::Join(mut receiver) => {
                debug!("SessionCache: Joining in-flight build for {}", key);
                Self::await_outcome(key, &mut receiver).await
            }
            Admission::Lead(sender, build_id) => {
                info!("SessionCache: Building session for {}", key);
                let parts = self.build_parts(key).await;
                let outcome = self.install(key, build_id, parts).await;
                let _ = sender.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// Drop the key's entry. The installed generation counter is kept, so
    /// the next build gets a strictly larger generation. A build in flight
    /// for the key is orphaned: its result will not be installed.
    pub async fn invalidate(&self, key: &SessionKey) {
        let mut state = self.state.lock().await;
        if state.entries.remove(key).is_some() {
            info!("SessionCache: Invalidated session for {}", key);
        }
    }

    /// Generation of the currently installed session for the key, if one is
    /// installed right now. Stale-work checks compare against this.
    pub async fn generation_of(&self, key: &SessionKey) -> Option<u64> {
        let state = self.state.lock().await;
        match state.entries.get(key) {
            Some(Slot::Ready(session)) => Some(session.generation),
            _ => None,
        }
    }

    async fn await_outcome(
        key: &SessionKey,
        receiver: &mut watch::Receiver<Option<BuildOutcome>>,
    ) -> BuildOutcome {
        loop {
            if let Some(outcome) = receiver.borrow_and_update().clone() {
                return outcome;
            }
            if receiver.changed().await.is_err() {
                return Err(Self::build_failure(key, "build abandoned before completing"));
            }
        }
    }

    /// Publish a finished build into the cache. The slot identity check
    /// keeps an invalidated-mid-build result from resurrecting the entry.
    async fn install(
        &self,
        key: &SessionKey,
        build_id: u64,
        parts: Result<SessionParts, SessionError>,
    ) -> BuildOutcome {
        let mut state = self.state.lock().await;
        let ours = matches!(
            state.entries.get(key),
            Some(Slot::Building { build_id: current, .. }) if *current == build_id
        );

        match parts {
            Ok(parts) if ours => {
                let generation = {
                    let counter = state.generations.entry(key.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                let session = Arc::new(Session {
                    key: key.clone(),
                    generation,
                    normalizers: parts.normalizers,
                    model: parts.model,
                    series: parts.series,
                });
                state.entries.insert(key.clone(), Slot::Ready(Arc::clone(&session)));
                info!(
                    "SessionCache: Session ready for {} (generation {})",
                    key, generation
                );
                Ok(session)
            }
            Ok(_) => {
                warn!(
                    "SessionCache: Discarding completed build for {}: entry was invalidated mid-build",
                    key
                );
                Err(Self::build_failure(key, "session was invalidated while building"))
            }
            Err(err) => {
                if ours {
                    state.entries.remove(key);
                }
                warn!("SessionCache: Build failed for {}: {}", key, err);
                Err(err)
            }
        }
    }

    /// The full build cycle: fetch history, resolve normalizers, resolve the
    /// model, seed the sliding history. History is fetched even when every
    /// artifact is already stored, because the fresh bars seed the series.
    async fn build_parts(&self, key: &SessionKey) -> Result<SessionParts, SessionError> {
        let bars = self
            .fetcher
            .fetch_history(key, self.history_limit)
            .await
            .map_err(|e| Self::build_failure(key, format!("history fetch: {e:#}")))?;

        if bars.len() <= self.lookback {
            return Err(Self::build_failure(
                key,
                format!(
                    "history too short: {} bars for lookback {}",
                    bars.len(),
                    self.lookback
                ),
            ));
        }
        debug!("SessionCache: Fetched {} bars for {}", bars.len(), key);

        let snapshot = SeriesSnapshot::from_bars(&bars);
        let normalizers = self.resolve_normalizers(key, &snapshot).await?;

        let tag = ModelTag {
            lookback: self.lookback,
            channels: Channel::COUNT,
            fingerprint: normalizers.fingerprint(),
        };
        let model = match self.load_stored_model(key, &tag).await? {
            Some(model) => model,
            None => self.train_and_store(key, &snapshot, &normalizers, &tag).await?,
        };

        Ok(SessionParts {
            normalizers,
            model,
            series: SlidingSeries::seeded(self.history_limit, &bars),
        })
    }

    /// Per channel: use the stored normalizer if it parses, otherwise fit
    /// over the fetched history and persist for the next process.
    async fn resolve_normalizers(
        &self,
        key: &SessionKey,
        snapshot: &SeriesSnapshot,
    ) -> Result<NormalizerSet, SessionError> {
        let mut resolved = Vec::with_capacity(Channel::COUNT);
        for channel in Channel::ALL {
            let slot = channel.artifact_slot();
            let stored = self
                .store
                .load(key, slot)
                .await
                .map_err(|e| Self::build_failure(key, format!("loading {slot}: {e:#}")))?;

            let normalizer = match stored.and_then(|bytes| Self::parse_normalizer(key, slot, &bytes)) {
                Some(normalizer) => {
                    debug!("SessionCache: Loaded {} for {}", slot, key);
                    normalizer
                }
                None => {
                    let fitted = RangeNormalizer::fit(channel, snapshot.channel(channel))
                        .map_err(|e| Self::build_failure(key, e.to_string()))?;
                    let bytes = serde_json::to_vec(&fitted)
                        .map_err(|e| Self::build_failure(key, format!("encoding {slot}: {e}")))?;
                    self.store
                        .save(key, slot, &bytes)
                        .await
                        .map_err(|e| Self::build_failure(key, format!("storing {slot}: {e:#}")))?;
                    info!("SessionCache: Fitted and stored {} for {}", slot, key);
                    fitted
                }
            };
            resolved.push(normalizer);
        }

        let normalizers: [RangeNormalizer; Channel::COUNT] = resolved
            .try_into()
            .map_err(|_| Self::build_failure(key, "incomplete normalizer set"))?;
        Ok(NormalizerSet::from_parts(normalizers))
    }

    fn parse_normalizer(key: &SessionKey, slot: &str, bytes: &[u8]) -> Option<RangeNormalizer> {
        match serde_json::from_slice(bytes) {
            Ok(normalizer) => Some(normalizer),
            Err(e) => {
                warn!(
                    "SessionCache: Unreadable {} artifact for {}: {}; refitting",
                    slot, key, e
                );
                None
            }
        }
    }

    /// Ok(None) demotes the stored model to a miss, which makes the caller
    /// retrain. Only store access itself is a build failure.
    async fn load_stored_model(
        &self,
        key: &SessionKey,
        tag: &ModelTag,
    ) -> Result<Option<Arc<dyn PredictionModel>>, SessionError> {
        let Some(bytes) = self
            .store
            .load(key, MODEL_SLOT)
            .await
            .map_err(|e| Self::build_failure(key, format!("loading model: {e:#}")))?
        else {
            return Ok(None);
        };

        let artifact: ModelArtifact = match serde_json::from_slice(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(
                    "SessionCache: Unreadable model artifact for {}: {}; retraining",
                    key, e
                );
                return Ok(None);
            }
        };

        if artifact.tag != *tag {
            let err = SessionError::InconsistentArtifact {
                key: key.to_string(),
                reason: "stored model was trained with a different window shape or normalizer ranges"
                    .to_string(),
            };
            warn!("SessionCache: {}; retraining", err);
            return Ok(None);
        }

        match self.trainer.load(&artifact.payload) {
            Ok(model) if model.lookback() == self.lookback => {
                info!("SessionCache: Loaded stored model for {}", key);
                Ok(Some(model))
            }
            Ok(model) => {
                warn!(
                    "SessionCache: Stored model for {} has lookback {}, expected {}; retraining",
                    key,
                    model.lookback(),
                    self.lookback
                );
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "SessionCache: Stored model for {} failed to load: {:#}; retraining",
                    key, e
                );
                Ok(None)
            }
        }
    }

    async fn train_and_store(
        &self,
        key: &SessionKey,
        snapshot: &SeriesSnapshot,
        normalizers: &NormalizerSet,
        tag: &ModelTag,
    ) -> Result<Arc<dyn PredictionModel>, SessionError> {
        let training = crate::domain::features::FeatureBuilder::build_training_set(
            snapshot,
            normalizers,
            self.lookback,
        )
        .map_err(|e| Self::build_failure(key, format!("training windows: {e}")))?;

        info!(
            "SessionCache: Training model for {} on {} examples",
            key,
            training.len()
        );
        let model = self
            .trainer
            .train(&training)
            .await
            .map_err(|e| Self::build_failure(key, format!("training: {e:#}")))?;

        let payload = model
            .to_bytes()
            .map_err(|e| Self::build_failure(key, format!("encoding model: {e:#}")))?;
        let artifact = ModelArtifact {
            tag: tag.clone(),
            payload,
        };
        let bytes = serde_json::to_vec(&artifact)
            .map_err(|e| Self::build_failure(key, format!("encoding model artifact: {e}")))?;
        self.store
            .save(key, MODEL_SLOT, &bytes)
            .await
            .map_err(|e| Self::build_failure(key, format!("storing model: {e:#}")))?;

        info!("SessionCache: Trained and stored model for {}", key);
        Ok(model)
    }

    fn build_failure(key: &SessionKey, reason: impl Into<String>) -> SessionError {
        SessionError::BuildFailed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
