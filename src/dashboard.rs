//! Live dashboard feed sessions.
//!
//! A session is a pair of mpsc channels carrying JSON strings, so any
//! transport (WebSocket bridge, SSE writer, a test) can drive one. On
//! open the session receives an `init` message with the current state and
//! a short sample history, then `stats` on every collector tick and
//! `activity` entries as they happen. A client `ping` gets a `pong`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stats::{Activity, DashboardState, Sample, SiteSample, StatsCollector, StatsEvent};

/// Samples included in the init message
const INIT_HISTORY: usize = 30;
/// Outbound buffer per session; a stalled consumer gets disconnected
/// instead of backing up the collector.
const SESSION_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    Init {
        state: DashboardState,
        history: Vec<Sample>,
    },
    Stats {
        global: Sample,
        sites: Vec<SiteSample>,
    },
    Activity {
        activity: Activity,
    },
    Pong,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
}

/// Transport-facing half of one feed session.
pub struct FeedSession {
    pub id: Uuid,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
}

impl FeedSession {
    /// Next JSON message for the client, None when the session ended.
    pub async fn next_message(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Deliver a raw client message to the session.
    pub async fn send(&self, text: String) {
        let _ = self.inbound.send(text).await;
    }
}

/// Tracks open sessions and wires each one to the collector broadcast.
pub struct FeedHub {
    collector: Arc<StatsCollector>,
    sessions: Arc<DashMap<Uuid, ()>>,
}

impl FeedHub {
    pub fn new(collector: Arc<StatsCollector>) -> Self {
        Self {
            collector,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn open(&self) -> FeedSession {
        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::channel(SESSION_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(SESSION_BUFFER);

        self.sessions.insert(id, ());
        debug!(session = %id, "dashboard session opened");

        let events = self.collector.subscribe();
        let collector = self.collector.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            run_session(id, collector, events, out_tx, in_rx).await;
            sessions.remove(&id);
            debug!(session = %id, "dashboard session closed");
        });

        FeedSession {
            id,
            outbound: out_rx,
            inbound: in_tx,
        }
    }
}

async fn run_session(
    id: Uuid,
    collector: Arc<StatsCollector>,
    mut events: broadcast::Receiver<StatsEvent>,
    outbound: mpsc::Sender<String>,
    mut inbound: mpsc::Receiver<String>,
) {
    let mut history = collector.global_series();
    if history.len() > INIT_HISTORY {
        history.drain(..history.len() - INIT_HISTORY);
    }
    let init = FeedMessage::Init {
        state: collector.dashboard_state(),
        history,
    };
    if !deliver(&outbound, &init).await {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let message = match event {
                    Ok(StatsEvent::Sample { global, sites }) => {
                        FeedMessage::Stats { global, sites }
                    }
                    Ok(StatsEvent::Activity { activity }) => FeedMessage::Activity { activity },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped ticks are fine, the next sample catches up.
                        debug!(session = %id, missed, "feed session lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !deliver(&outbound, &message).await {
                    break;
                }
            }
            client = inbound.recv() => {
                let Some(text) = client else {
                    break;
                };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        if !deliver(&outbound, &FeedMessage::Pong).await {
                            break;
                        }
                    }
                    Err(_) => debug!(session = %id, "ignoring unknown client message"),
                }
            }
        }
    }
}

/// Serialize and send; false means the client is gone or hopelessly slow.
async fn deliver(outbound: &mpsc::Sender<String>, message: &FeedMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize feed message");
            return true;
        }
    };
    match outbound.try_send(json) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("feed session consumer too slow, disconnecting");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatcher::Dispatcher;
    use crate::stats::ActivityKind;
    use crate::store::Store;
    use crate::worker::{ProcessHandle, ProcessSpawner, SpawnSpec};
    use std::time::Duration;

    struct NoopSpawner;

    impl ProcessSpawner for NoopSpawner {
        fn spawn(&self, _spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
            anyhow::bail!("not used here")
        }
    }

    fn test_collector() -> Arc<StatsCollector> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let dispatcher = Dispatcher::new(Arc::new(Config::default()), Arc::new(NoopSpawner), tx)
            .unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        StatsCollector::new(Config::default().stats, dispatcher, store)
    }

    fn parse_type(json: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_session_starts_with_init() {
        let collector = test_collector();
        collector.sample_once();

        let hub = FeedHub::new(collector);
        let mut session = hub.open();

        let first = session.next_message().await.unwrap();
        assert_eq!(parse_type(&first), "init");
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert!(value["state"]["generated_at_ms"].as_i64().unwrap() > 0);
        assert_eq!(value["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_receives_stats_and_activity() {
        let collector = test_collector();
        let hub = FeedHub::new(collector.clone());
        let mut session = hub.open();
        assert_eq!(parse_type(&session.next_message().await.unwrap()), "init");

        collector.sample_once();
        assert_eq!(parse_type(&session.next_message().await.unwrap()), "stats");

        collector.record_activity(Activity::new(
            "s1",
            "blog",
            ActivityKind::WorkerStarted,
            "pid 123",
        ));
        let msg = session.next_message().await.unwrap();
        assert_eq!(parse_type(&msg), "activity");
        assert!(msg.contains("worker_started"));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let hub = FeedHub::new(test_collector());
        let mut session = hub.open();
        assert_eq!(parse_type(&session.next_message().await.unwrap()), "init");

        session.send(r#"{"type":"ping"}"#.to_string()).await;
        assert_eq!(parse_type(&session.next_message().await.unwrap()), "pong");

        // Garbage is ignored, the session stays alive.
        session.send("not json".to_string()).await;
        session.send(r#"{"type":"ping"}"#.to_string()).await;
        assert_eq!(parse_type(&session.next_message().await.unwrap()), "pong");
    }

    #[tokio::test]
    async fn test_dropping_session_unsubscribes() {
        let hub = FeedHub::new(test_collector());
        let session = hub.open();
        // Session registration is synchronous in open().
        assert_eq!(hub.active_sessions(), 1);

        drop(session);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hub.active_sessions() != 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
