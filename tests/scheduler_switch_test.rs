use candlecast::application::scheduler::{PredictionScheduler, SchedulerCommand, SchedulerConfig};
use candlecast::application::session_cache::SessionCache;
use candlecast::domain::events::EngineEvent;
use candlecast::domain::types::{Bar, SessionKey};
use candlecast::infrastructure::event_bus::EventBus;
use candlecast::infrastructure::mock::{
    CollectingListener, MemoryArtifactStore, MemoryPredictionLog, MockDataFetcher, MockTrainer,
    synthetic_bars,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const LOOKBACK: usize = 6;
const HISTORY_LIMIT: usize = 64;

struct Engine {
    fetcher: Arc<MockDataFetcher>,
    log: Arc<MemoryPredictionLog>,
    listener: Arc<CollectingListener>,
    cache: Arc<SessionCache>,
    scheduler: Arc<PredictionScheduler>,
    command_tx: mpsc::Sender<SchedulerCommand>,
    command_rx: Option<mpsc::Receiver<SchedulerCommand>>,
}

async fn engine(interval: Duration) -> Engine {
    let fetcher = Arc::new(MockDataFetcher::new());
    let trainer = Arc::new(MockTrainer::new());
    let store = Arc::new(MemoryArtifactStore::new());
    let log = Arc::new(MemoryPredictionLog::new());
    let listener = Arc::new(CollectingListener::new());

    let cache = Arc::new(SessionCache::new(
        fetcher.clone(),
        trainer.clone(),
        store,
        HISTORY_LIMIT,
        LOOKBACK,
    ));
    let events = EventBus::new();
    events.subscribe(listener.clone()).await;

    let (command_tx, command_rx) = mpsc::channel(16);
    let scheduler = Arc::new(PredictionScheduler::new(
        Arc::clone(&cache),
        fetcher.clone(),
        trainer,
        log.clone(),
        events,
        SchedulerConfig {
            interval,
            lookback: LOOKBACK,
            ticker_symbols: Vec::new(),
        },
        command_tx.clone(),
    ));

    Engine {
        fetcher,
        log,
        listener,
        cache,
        scheduler,
        command_tx,
        command_rx: Some(command_rx),
    }
}

#[tokio::test]
async fn test_switch_discards_in_flight_work() {
    // 1. Two keys with scripted histories, and latest-bar fetches slow
    //    enough that a prediction cycle is always in flight during the switch
    let mut e = engine(Duration::from_millis(25)).await;
    drop(e.command_rx.take());
    let key_a = SessionKey::new("AAA/USDT", "5m");
    let key_b = SessionKey::new("BBB/USDT", "5m");
    e.fetcher
        .set_history(&key_a, synthetic_bars(40, 0, 300_000))
        .await;
    e.fetcher
        .set_history(&key_b, synthetic_bars(40, 0, 300_000))
        .await;
    e.fetcher.set_latest_delay(Duration::from_millis(60)).await;

    e.scheduler.start(key_a.clone()).await.unwrap();

    // 2. Switch while the first cycle for A is still inside its fetch
    tokio::time::sleep(Duration::from_millis(20)).await;
    e.scheduler.switch_key(key_b.clone()).await.unwrap();

    // 3. Give B a fresh bar so its cycles produce durable records
    e.fetcher
        .set_latest_bar(
            &key_b,
            Bar {
                timestamp: 39 * 300_000 + 300_000,
                open: 2_040.0,
                high: 2_060.0,
                low: 2_030.0,
                close: 2_050.0,
                volume: 640.0,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    e.scheduler.stop();

    // 4. A's prediction cycle was in flight when the switch landed, so its
    //    result must have been discarded at the staleness check
    let events = e.listener.events();
    assert!(
        events.iter().all(|ev| match ev {
            EngineEvent::PredictionUpdated { key, .. } => *key != key_a,
            _ => true,
        }),
        "in-flight results for the retired key must be discarded, not published"
    );
    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, EngineEvent::PredictionUpdated { key, .. } if *key == key_b)),
        "the new key's refresh cycles should be publishing"
    );

    let records = e.log.records().await;
    assert!(!records.is_empty(), "B should have recorded its fresh bar");
    assert!(
        records.iter().all(|r| r.symbol == "BBB/USDT"),
        "no record may carry the retired key's symbol"
    );
}

#[tokio::test]
async fn test_switch_to_active_key_is_a_no_op() {
    let mut e = engine(Duration::from_millis(50)).await;
    drop(e.command_rx.take());
    let key = SessionKey::new("ETH/USDT", "5m");
    e.fetcher
        .set_history(&key, synthetic_bars(40, 0, 300_000))
        .await;

    e.scheduler.start(key.clone()).await.unwrap();
    assert_eq!(e.fetcher.history_calls(), 1);

    // Re-selecting the key that is already active must not tear anything down.
    e.scheduler.switch_key(key.clone()).await.unwrap();
    e.scheduler.stop();

    assert_eq!(e.fetcher.history_calls(), 1, "no rebuild may happen");
    let ready_count = e
        .listener
        .events()
        .iter()
        .filter(|ev| matches!(ev, EngineEvent::SessionReady { .. }))
        .count();
    assert_eq!(ready_count, 1, "the session must not be re-announced");
}

#[tokio::test]
async fn test_stop_silences_all_tasks() {
    let e = engine(Duration::from_millis(20)).await;
    let key = SessionKey::new("ETH/USDT", "5m");
    e.fetcher
        .set_history(&key, synthetic_bars(40, 0, 300_000))
        .await;

    e.scheduler.start(key.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    e.scheduler.stop();

    // Let any in-flight cycle finish and every task observe the stop.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let settled = e.listener.events().len();
    assert!(settled > 0, "some refresh events should have been published");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        e.listener.events().len(),
        settled,
        "no task may publish after stop"
    );
}

#[tokio::test]
async fn test_rebuild_command_reinstalls_only_the_active_key() {
    // 1. Engine with its command loop running
    let mut e = engine(Duration::from_millis(30)).await;
    let key_a = SessionKey::new("AAA/USDT", "5m");
    let key_b = SessionKey::new("BBB/USDT", "1h");
    e.fetcher
        .set_history(&key_a, synthetic_bars(40, 0, 300_000))
        .await;
    e.fetcher
        .set_history(&key_b, synthetic_bars(40, 0, 3_600_000))
        .await;

    let command_rx = e.command_rx.take().unwrap();
    let loop_scheduler = Arc::clone(&e.scheduler);
    tokio::spawn(async move { loop_scheduler.run(command_rx).await });

    e.scheduler.start(key_a.clone()).await.unwrap();
    assert_eq!(e.cache.generation_of(&key_a).await, Some(1));

    // 2. Rebuilding the active key installs a fresh generation
    e.command_tx
        .send(SchedulerCommand::Rebuild(key_a.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        e.cache.generation_of(&key_a).await,
        Some(2),
        "a rebuild of the active key must install a new generation"
    );
    assert_eq!(e.fetcher.history_calls(), 2);
    assert!(
        e.listener
            .events()
            .iter()
            .any(|ev| matches!(ev, EngineEvent::SessionReady { key, generation: 2 } if *key == key_a)),
        "the rebuilt session must be announced"
    );

    // 3. A switch command moves the active target to B
    e.command_tx
        .send(SchedulerCommand::Switch(key_b.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(e.cache.generation_of(&key_b).await, Some(1));

    // 4. A rebuild for the now-inactive A is ignored
    e.command_tx
        .send(SchedulerCommand::Rebuild(key_a.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    e.scheduler.stop();

    assert_eq!(
        e.cache.generation_of(&key_a).await,
        Some(2),
        "rebuild requests for an inactive key must be ignored"
    );
    assert_eq!(e.fetcher.history_calls(), 3, "A: 2 builds, B: 1 build");
}
