//! Supervised worker processes: state machine, control protocol, and the
//! spawning seam.
//!
//! Spawning is injected through the `ProcessSpawner` trait so the pool logic
//! can be exercised without forking real processes. The production impl
//! (`TokioSpawner`) wires stdout as a line-delimited JSON control channel.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ring::RingBuffer;

/// Exit timestamps kept for crash-loop detection
pub const EXIT_LOG_CAPACITY: usize = 20;
/// Exits required before the backoff rule is evaluated
const CRASH_LOOP_MIN_EXITS: usize = 5;
/// Per-exit window factor in the backoff rule
const CRASH_LOOP_WINDOW_PER_EXIT: Duration = Duration::from_millis(2500);
/// Replenishment delay applied when a crash loop is detected
pub const CRASH_LOOP_COOLDOWN: Duration = Duration::from_secs(3);

/// Lifecycle of a worker. No transition skips `Spawning`; `Exited` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Isolated,
    Exited,
}

/// Message a worker sends on its control channel (one JSON object per line).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControlError {
    pub code: String,
}

impl ControlMessage {
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_addr_in_use(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.code == "EADDRINUSE")
    }
}

/// Event forwarded from a spawned process to its supervisor.
#[derive(Debug)]
pub enum WorkerEvent {
    Control(ControlMessage),
    Exited { code: Option<i32> },
}

/// Signal sent from the supervisor to a running process.
#[derive(Debug, Clone, Copy)]
pub enum WorkerSignal {
    Terminate,
    Kill,
}

/// Where a worker listens; a pool uses one strategy for its whole generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Port(u16),
    Socket(PathBuf),
}

impl BindTarget {
    /// Value passed to the worker's `--port=` argument
    pub fn as_arg(&self) -> String {
        match self {
            BindTarget::Port(port) => port.to_string(),
            BindTarget::Socket(path) => path.display().to_string(),
        }
    }

    /// Address the dispatcher forwards requests to
    pub fn backend_address(&self) -> String {
        match self {
            BindTarget::Port(port) => format!("127.0.0.1:{port}"),
            BindTarget::Socket(path) => path.display().to_string(),
        }
    }
}

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// Handle returned by a spawner: pid plus the event/signal channels.
pub struct ProcessHandle {
    pub pid: u32,
    pub events: mpsc::Receiver<WorkerEvent>,
    pub signals: mpsc::Sender<WorkerSignal>,
}

/// Capability to launch worker processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<ProcessHandle>;
}

/// Production spawner backed by tokio::process.
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
        let mut command = tokio::process::Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned process has no pid"))?;

        let (event_tx, event_rx) = mpsc::channel(32);
        let (signal_tx, mut signal_rx) = mpsc::channel::<WorkerSignal>(8);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout not captured"))?;

        // Control-channel reader: one JSON object per stdout line; anything
        // else is treated as plain worker output.
        let control_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(msg) if msg != ControlMessage::default() => {
                        if control_tx.send(WorkerEvent::Control(msg)).await.is_err() {
                            break;
                        }
                    }
                    _ => tracing::debug!(pid, output = %line, "worker stdout"),
                }
            }
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signal_rx.recv() => match signal {
                        Some(WorkerSignal::Terminate) => {
                            #[cfg(unix)]
                            unsafe {
                                libc::kill(pid as i32, libc::SIGTERM);
                            }
                        }
                        Some(WorkerSignal::Kill) => {
                            let _ = child.start_kill();
                        }
                        None => {
                            let _ = child.start_kill();
                            break;
                        }
                    },
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        let _ = event_tx.send(WorkerEvent::Exited { code }).await;
                        break;
                    }
                }
            }
        });

        Ok(ProcessHandle {
            pid,
            events: event_rx,
            signals: signal_tx,
        })
    }
}

/// Sticky routing key derived from client IP, User-Agent, and
/// Accept-Language.
pub fn fingerprint(remote_ip: &str, user_agent: &str, accept_language: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    remote_ip.hash(&mut hasher);
    user_agent.hash(&mut hasher);
    accept_language.hash(&mut hasher);
    hasher.finish()
}

/// Fingerprint → last-seen cache with idle eviction.
#[derive(Debug)]
pub struct FingerprintCache {
    entries: Mutex<HashMap<u64, Instant>>,
    ttl: Duration,
}

impl FingerprintCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// True when the fingerprint is cached and not yet expired; refreshes
    /// its last-seen time on hit.
    pub fn touch(&self, fp: u64) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(&fp) {
            Some(last_seen) if now.duration_since(*last_seen) < self.ttl => {
                *last_seen = now;
                true
            }
            Some(_) => {
                entries.remove(&fp);
                false
            }
            None => false,
        }
    }

    pub fn insert(&self, fp: u64) {
        self.entries.lock().insert(fp, Instant::now());
    }

    /// Drop entries idle longer than the TTL; returns remaining count.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, last_seen| now.duration_since(*last_seen) < self.ttl);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Recent exit timestamps, consulted before replenishing a pool.
#[derive(Debug)]
pub struct ExitLog {
    exits: Mutex<RingBuffer<Instant>>,
}

impl Default for ExitLog {
    fn default() -> Self {
        Self {
            exits: Mutex::new(RingBuffer::new(EXIT_LOG_CAPACITY)),
        }
    }
}

impl ExitLog {
    pub fn record(&self, at: Instant) {
        self.exits.lock().push(at);
    }

    /// Cooldown to apply before the next replenishment, if exits are
    /// arriving fast enough to look like a crash loop. With more than five
    /// logged exits, the mean exit time is computed; when `now` is within
    /// `2500ms * exit_count` of that mean the pool is respawning too fast.
    pub fn replenish_delay(&self, now: Instant) -> Option<Duration> {
        let exits = self.exits.lock();
        let count = exits.len();
        if count <= CRASH_LOOP_MIN_EXITS {
            return None;
        }

        let times = exits.to_vec();
        let earliest = *times.first()?;
        let mean_offset = times
            .iter()
            .map(|t| t.duration_since(earliest))
            .sum::<Duration>()
            / count as u32;
        let mean = earliest + mean_offset;

        let window = CRASH_LOOP_WINDOW_PER_EXIT * count as u32;
        if now.duration_since(mean) < window {
            Some(CRASH_LOOP_COOLDOWN)
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerHealth {
    cpu_percent: f32,
    mem_mb: f64,
    overload_since: Option<Instant>,
    idle_since: Option<Instant>,
}

/// One supervised process serving a node site's traffic.
pub struct Worker {
    pub id: Uuid,
    pub pid: u32,
    pub bind: BindTarget,
    pub started_at: Instant,
    state: Mutex<WorkerState>,
    health: Mutex<WorkerHealth>,
    pub fingerprints: FingerprintCache,
    signals: mpsc::Sender<WorkerSignal>,
}

impl Worker {
    pub fn new(
        pid: u32,
        bind: BindTarget,
        fingerprint_ttl: Duration,
        signals: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            bind,
            started_at: Instant::now(),
            state: Mutex::new(WorkerState::Spawning),
            health: Mutex::new(WorkerHealth::default()),
            fingerprints: FingerprintCache::new(fingerprint_ttl),
            signals,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == WorkerState::Ready
    }

    pub fn is_isolated(&self) -> bool {
        *self.state.lock() == WorkerState::Isolated
    }

    /// True while the worker may receive traffic (ready and not isolated).
    pub fn is_serving(&self) -> bool {
        self.is_ready()
    }

    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Spawning {
            *state = WorkerState::Ready;
        }
    }

    /// Exclude from new traffic; the worker drains and self-terminates once
    /// its fingerprint cache is empty.
    pub fn isolate(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Ready {
            *state = WorkerState::Isolated;
        }
    }

    pub fn mark_exited(&self) {
        *self.state.lock() = WorkerState::Exited;
    }

    pub fn cpu_percent(&self) -> f32 {
        self.health.lock().cpu_percent
    }

    pub fn mem_mb(&self) -> f64 {
        self.health.lock().mem_mb
    }

    /// Record a health probe reading, tracking how long the worker has been
    /// continuously overloaded or continuously idle. Both timers reset when
    /// CPU crosses back over the respective threshold.
    pub fn update_health(&self, cpu_percent: f32, mem_mb: f64, overload_cpu: f32, now: Instant) {
        let mut health = self.health.lock();
        health.cpu_percent = cpu_percent;
        health.mem_mb = mem_mb;

        if cpu_percent > overload_cpu {
            health.overload_since.get_or_insert(now);
        } else {
            health.overload_since = None;
        }

        if cpu_percent == 0.0 {
            health.idle_since.get_or_insert(now);
        } else {
            health.idle_since = None;
        }
    }

    /// Forget the running overload episode; called after the pool has
    /// already responded to it by spawning an extra worker.
    pub fn reset_overload_timer(&self) {
        self.health.lock().overload_since = None;
    }

    pub fn overloaded_for(&self, now: Instant) -> Option<Duration> {
        self.health
            .lock()
            .overload_since
            .map(|since| now.duration_since(since))
    }

    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.health
            .lock()
            .idle_since
            .map(|since| now.duration_since(since))
    }

    /// Ask the process to exit (SIGTERM); the pool escalates to SIGKILL
    /// after the grace period.
    pub fn request_terminate(&self) {
        let _ = self.signals.try_send(WorkerSignal::Terminate);
    }

    pub fn request_kill(&self) {
        let _ = self.signals.try_send(WorkerSignal::Kill);
    }
}
