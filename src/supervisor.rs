//! Per-site worker pool: spawning, readiness gating, health policies,
//! sticky load balancing, and crash-loop aware replenishment.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use anyhow::Context;

use crate::config::PoolDefaults;
use crate::dispatcher::BindAllocator;
use crate::site::BackendRecord;
use crate::stats::{Activity, ActivityKind};
use crate::worker::{
    BindTarget, ExitLog, ProcessSpawner, SpawnSpec, Worker, WorkerEvent, WorkerState,
};

/// Overload handling never grows a pool past this many workers, even when
/// the configured maximum allows more.
const OVERLOAD_POOL_CEILING: usize = 5;

/// How long `get_address` waits for a spawning worker's readiness signal.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Effective pool settings for one site: global defaults overlaid with the
/// site record's node settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub runtime: String,
    pub minimum: usize,
    /// 0 means unlimited
    pub maximum: usize,
    pub wait_for_ready: bool,
    pub use_socket: bool,
    pub fingerprint_ttl: Duration,
    pub overload_cpu: f32,
    pub overload_after: Duration,
    pub idle_after: Duration,
    pub busy_cpu: f32,
    pub probe_interval: Duration,
    pub grace_period: Duration,
}

impl PoolSettings {
    /// None for backends that have no worker pool.
    pub fn resolve(defaults: &PoolDefaults, backend: &BackendRecord) -> Option<Self> {
        let BackendRecord::Node {
            script,
            args,
            env,
            minimum_processes,
            maximum_processes,
            wait_for_ready,
            use_socket,
            runtime,
        } = backend
        else {
            return None;
        };

        Some(Self {
            script: PathBuf::from(script),
            args: args.clone(),
            env: env.clone(),
            runtime: runtime.clone().unwrap_or_else(|| defaults.runtime.clone()),
            minimum: minimum_processes.unwrap_or(defaults.minimum_processes),
            maximum: maximum_processes.unwrap_or(defaults.maximum_processes),
            wait_for_ready: wait_for_ready.unwrap_or(defaults.wait_for_ready),
            use_socket: *use_socket,
            fingerprint_ttl: defaults.fingerprint_ttl(),
            overload_cpu: defaults.overload_cpu_percent,
            overload_after: defaults.overload_after(),
            idle_after: defaults.idle_after(),
            busy_cpu: defaults.busy_cpu_percent,
            probe_interval: defaults.probe_interval(),
            grace_period: defaults.shutdown_grace_period(),
        })
    }
}

/// Point-in-time pool metrics for the stats collector.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolSnapshot {
    pub running: usize,
    pub ready: usize,
    pub avg_cpu_percent: f32,
    pub total_mem_mb: f64,
}

/// Per-worker details for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub pid: u32,
    pub state: &'static str,
    pub cpu_percent: f32,
    pub mem_mb: f64,
    pub uptime_secs: u64,
    pub address: String,
}

/// Supervised worker pool for one node site.
pub struct SitePool {
    pub site_id: String,
    pub site_name: String,
    settings: RwLock<PoolSettings>,
    workers: RwLock<Vec<Arc<Worker>>>,
    /// Starts currently in flight, counted alongside running workers by
    /// minimum-pool enforcement
    requested: AtomicUsize,
    spawner: Arc<dyn ProcessSpawner>,
    allocator: Arc<BindAllocator>,
    /// Coalesces concurrent `get_address` callers while no worker is ready
    first_worker_gate: tokio::sync::Mutex<()>,
    /// Serializes minimum-pool enforcement passes
    enforce_lock: tokio::sync::Mutex<()>,
    ready_notify: Notify,
    pub exit_log: ExitLog,
    activities: mpsc::UnboundedSender<Activity>,
    shutting_down: AtomicBool,
}

impl SitePool {
    pub fn new(
        site_id: impl Into<String>,
        site_name: impl Into<String>,
        settings: PoolSettings,
        spawner: Arc<dyn ProcessSpawner>,
        allocator: Arc<BindAllocator>,
        activities: mpsc::UnboundedSender<Activity>,
    ) -> Arc<Self> {
        Arc::new(Self {
            site_id: site_id.into(),
            site_name: site_name.into(),
            settings: RwLock::new(settings),
            workers: RwLock::new(Vec::new()),
            requested: AtomicUsize::new(0),
            spawner,
            allocator,
            first_worker_gate: tokio::sync::Mutex::new(()),
            enforce_lock: tokio::sync::Mutex::new(()),
            ready_notify: Notify::new(),
            exit_log: ExitLog::default(),
            activities,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings.read().clone()
    }

    /// Swap in new settings from a config-sync update. Worker counts adjust
    /// on the next enforcement pass or health tick.
    pub fn apply_settings(&self, settings: PoolSettings) {
        *self.settings.write() = settings;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Live worker count, spawning workers included.
    pub fn running_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn ready_workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.is_ready())
            .cloned()
            .collect()
    }

    /// Workers still taking new traffic (not isolated, not exited).
    pub fn active_count(&self) -> usize {
        self.workers
            .read()
            .iter()
            .filter(|w| matches!(w.state(), WorkerState::Spawning | WorkerState::Ready))
            .count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let workers = self.workers.read();
        let running = workers.len();
        let ready = workers.iter().filter(|w| w.is_ready()).count();
        let avg_cpu_percent = if running == 0 {
            0.0
        } else {
            workers.iter().map(|w| w.cpu_percent()).sum::<f32>() / running as f32
        };
        let total_mem_mb = workers.iter().map(|w| w.mem_mb()).sum();
        PoolSnapshot {
            running,
            ready,
            avg_cpu_percent,
            total_mem_mb,
        }
    }

    pub fn worker_summaries(&self) -> Vec<WorkerSummary> {
        self.workers
            .read()
            .iter()
            .map(|w| WorkerSummary {
                pid: w.pid,
                state: match w.state() {
                    WorkerState::Spawning => "spawning",
                    WorkerState::Ready => "ready",
                    WorkerState::Isolated => "isolated",
                    WorkerState::Exited => "exited",
                },
                cpu_percent: w.cpu_percent(),
                mem_mb: w.mem_mb(),
                uptime_secs: w.started_at.elapsed().as_secs(),
                address: w.bind.backend_address(),
            })
            .collect()
    }

    fn emit(&self, kind: ActivityKind, detail: impl Into<String>) {
        let _ = self.activities.send(Activity::new(
            &self.site_id,
            &self.site_name,
            kind,
            detail,
        ));
    }

    /// Launch one worker. Returns once the process is spawned; readiness is
    /// signalled separately through the control channel.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<Arc<Worker>> {
        anyhow::ensure!(
            !self.is_shutting_down(),
            "pool for {} is shutting down",
            self.site_name
        );
        let settings = self.settings();
        let have = self.running_count() + self.requested.load(Ordering::SeqCst);
        if settings.maximum != 0 && have >= settings.maximum {
            anyhow::bail!(
                "pool for {} already at maximum of {} workers",
                self.site_name,
                settings.maximum
            );
        }

        self.requested.fetch_add(1, Ordering::SeqCst);
        let result = self.start_inner(&settings);
        self.requested.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(worker) => {
                info!(
                    site = %self.site_name,
                    pid = worker.pid,
                    address = %worker.bind.backend_address(),
                    "worker started"
                );
                self.emit(
                    ActivityKind::WorkerStarted,
                    format!("pid {} on {}", worker.pid, worker.bind.backend_address()),
                );
            }
            Err(err) => {
                warn!(site = %self.site_name, error = %err, "worker start failed");
            }
        }
        result
    }

    fn start_inner(self: &Arc<Self>, settings: &PoolSettings) -> anyhow::Result<Arc<Worker>> {
        let bind = if settings.use_socket {
            BindTarget::Socket(self.allocator.socket_file(&self.site_id)?)
        } else {
            BindTarget::Port(self.allocator.allocate_port()?)
        };

        let cwd = settings
            .script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut args = vec![
            settings.script.display().to_string(),
            format!("--port={}", bind.as_arg()),
            "--proxied".to_string(),
        ];
        args.extend(settings.args.iter().cloned());

        let spec = SpawnSpec {
            command: settings.runtime.clone(),
            args,
            env: settings.env.clone(),
            cwd,
        };

        let handle = match self.spawner.spawn(&spec) {
            Ok(handle) => handle,
            Err(err) => {
                self.release_bind(&bind);
                return Err(err)
                    .with_context(|| format!("failed to spawn worker for {}", self.site_name));
            }
        };

        let worker = Arc::new(Worker::new(
            handle.pid,
            bind,
            settings.fingerprint_ttl,
            handle.signals,
        ));
        if !settings.wait_for_ready {
            worker.mark_ready();
        }
        self.workers.write().push(worker.clone());
        if worker.is_ready() {
            self.ready_notify.notify_waiters();
        }

        tokio::spawn(run_worker(self.clone(), worker.clone(), handle.events));
        Ok(worker)
    }

    fn release_bind(&self, bind: &BindTarget) {
        match bind {
            BindTarget::Port(port) => self.allocator.release_port(*port),
            BindTarget::Socket(path) => {
                if let Err(err) = std::fs::remove_file(path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        debug!(path = %path.display(), error = %err, "socket file cleanup failed");
                    }
                }
            }
        }
    }

    fn remove_worker(&self, worker: &Arc<Worker>) {
        self.workers.write().retain(|w| w.id != worker.id);
        self.release_bind(&worker.bind);
    }

    async fn wait_until_ready(&self, worker: &Arc<Worker>) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            let notified = self.ready_notify.notified();
            match worker.state() {
                WorkerState::Ready | WorkerState::Isolated => return Ok(()),
                WorkerState::Exited => anyhow::bail!(
                    "worker for {} exited before becoming ready",
                    self.site_name
                ),
                WorkerState::Spawning => {}
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                anyhow::bail!("timed out waiting for a ready worker for {}", self.site_name);
            }
        }
    }

    /// Resolve a backend address for one request.
    ///
    /// Selection order: sticky fingerprint match, then a shuffled pick of a
    /// non-busy worker, then the first worker regardless of load. With no
    /// ready worker, concurrent callers coalesce behind a single first-worker
    /// start and all resolve once it is ready.
    pub async fn get_address(self: &Arc<Self>, fp: Option<u64>) -> anyhow::Result<String> {
        if self.ready_workers().is_empty() {
            let _gate = self.first_worker_gate.lock().await;
            if self.ready_workers().is_empty() {
                let pending = self
                    .workers
                    .read()
                    .iter()
                    .find(|w| w.state() == WorkerState::Spawning)
                    .cloned();
                let worker = match pending {
                    Some(worker) => worker,
                    None => self.start()?,
                };
                self.wait_until_ready(&worker).await?;
            }
        }

        let ready = self.ready_workers();
        anyhow::ensure!(
            !ready.is_empty(),
            "no ready worker available for {}",
            self.site_name
        );

        let chosen = if ready.len() == 1 {
            ready[0].clone()
        } else if let Some(sticky) = fp.and_then(|fp| {
            ready.iter().find(|w| w.fingerprints.touch(fp)).cloned()
        }) {
            sticky
        } else {
            let busy_cpu = self.settings.read().busy_cpu;
            let mut shuffled = ready.clone();
            shuffled.shuffle(&mut rand::thread_rng());
            shuffled
                .iter()
                .find(|w| w.cpu_percent() <= busy_cpu)
                .unwrap_or(&shuffled[0])
                .clone()
        };

        if let Some(fp) = fp {
            if !chosen.fingerprints.touch(fp) {
                chosen.fingerprints.insert(fp);
            }
        }
        Ok(chosen.bind.backend_address())
    }

    /// Close the gap between the live worker count and the configured
    /// minimum. Passes are serialized; a start failure leaves the gap for
    /// the next pass instead of retrying in a loop.
    pub async fn enforce_minimum(self: &Arc<Self>) {
        let _guard = self.enforce_lock.lock().await;
        if self.is_shutting_down() {
            return;
        }
        let minimum = self.settings.read().minimum;
        loop {
            let have = self.running_count() + self.requested.load(Ordering::SeqCst);
            if have >= minimum {
                return;
            }
            let result = if have == 0 {
                // The first worker goes through get_address so concurrent
                // requests coalesce onto it.
                self.get_address(None).await.map(|_| ())
            } else {
                self.start().map(|_| ())
            };
            if let Err(err) = result {
                warn!(
                    site = %self.site_name,
                    error = %err,
                    "minimum-pool enforcement could not start a worker"
                );
                return;
            }
        }
    }

    /// One health-probe pass: refresh CPU/RSS readings and apply the
    /// overload, idle, and isolated-drain policies.
    pub fn probe_health(self: &Arc<Self>, system: &mut System) {
        let workers: Vec<Arc<Worker>> = self.workers.read().clone();
        if workers.is_empty() {
            return;
        }

        let pids: Vec<Pid> = workers.iter().map(|w| Pid::from_u32(w.pid)).collect();
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        let now = Instant::now();
        let settings = self.settings();
        let mut overloaded: Option<Arc<Worker>> = None;
        let mut idle: Option<Arc<Worker>> = None;

        for worker in &workers {
            if let Some(process) = system.process(Pid::from_u32(worker.pid)) {
                let cpu = process.cpu_usage();
                let mem_mb = process.memory() as f64 / (1024.0 * 1024.0);
                worker.update_health(cpu, mem_mb, settings.overload_cpu, now);
            }
            worker.fingerprints.evict_expired();

            if worker.is_isolated() {
                // Drained isolated workers self-terminate.
                if worker.fingerprints.is_empty() {
                    info!(site = %self.site_name, pid = worker.pid, "isolated worker drained");
                    worker.request_terminate();
                }
                continue;
            }

            if overloaded.is_none()
                && worker
                    .overloaded_for(now)
                    .is_some_and(|d| d > settings.overload_after)
            {
                overloaded = Some(worker.clone());
            }
            if idle.is_none()
                && worker
                    .idle_for(now)
                    .is_some_and(|d| d > settings.idle_after)
            {
                idle = Some(worker.clone());
            }
        }

        if let Some(worker) = overloaded {
            worker.reset_overload_timer();
            let ceiling = if settings.maximum == 0 {
                OVERLOAD_POOL_CEILING
            } else {
                OVERLOAD_POOL_CEILING.min(settings.maximum)
            };
            if self.running_count() < ceiling {
                info!(
                    site = %self.site_name,
                    pid = worker.pid,
                    "sustained overload, starting an extra worker"
                );
                if let Err(err) = self.start() {
                    warn!(site = %self.site_name, error = %err, "overload spawn failed");
                }
            } else {
                warn!(
                    site = %self.site_name,
                    running = self.running_count(),
                    "sustained overload but pool is at capacity"
                );
            }
        }

        if let Some(worker) = idle {
            if self.active_count() > settings.minimum {
                info!(
                    site = %self.site_name,
                    pid = worker.pid,
                    "reclaiming idle surplus worker"
                );
                worker.request_terminate();
            }
        }
    }

    /// Periodic health monitor; runs until the pool shuts down.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(pool.settings().probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.is_shutting_down() {
                    break;
                }
                pool.probe_health(&mut system);
            }
        })
    }

    /// Graceful teardown: SIGTERM everyone, wait out the grace period, then
    /// SIGKILL whatever is still alive.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<Arc<Worker>> = self.workers.read().clone();
        if workers.is_empty() {
            return;
        }
        info!(site = %self.site_name, count = workers.len(), "stopping workers");
        for worker in &workers {
            worker.request_terminate();
        }
        let grace = self.settings.read().grace_period;
        tokio::time::sleep(grace).await;
        for worker in self.workers.read().iter() {
            if worker.state() != WorkerState::Exited {
                warn!(site = %self.site_name, pid = worker.pid, "worker ignored SIGTERM, killing");
                worker.request_kill();
            }
        }
    }
}

/// Per-worker event loop: readiness and error control messages, then exit
/// handling with crash-loop aware replenishment.
async fn run_worker(
    pool: Arc<SitePool>,
    worker: Arc<Worker>,
    mut events: mpsc::Receiver<WorkerEvent>,
) {
    let mut addr_in_use = false;

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Control(msg) => {
                if msg.is_ready() {
                    debug!(site = %pool.site_name, pid = worker.pid, "worker ready");
                    worker.mark_ready();
                    pool.ready_notify.notify_waiters();
                } else if msg.is_addr_in_use() && !worker.is_ready() {
                    warn!(
                        site = %pool.site_name,
                        pid = worker.pid,
                        "worker bind target already in use, will retry"
                    );
                    addr_in_use = true;
                }
            }
            WorkerEvent::Exited { code } => {
                let crashed = code != Some(0);
                info!(site = %pool.site_name, pid = worker.pid, ?code, "worker exited");
                worker.mark_exited();
                pool.ready_notify.notify_waiters();
                pool.remove_worker(&worker);
                pool.exit_log.record(Instant::now());
                pool.emit(
                    if crashed {
                        ActivityKind::WorkerCrashed
                    } else {
                        ActivityKind::WorkerStopped
                    },
                    format!("pid {} exit code {:?}", worker.pid, code),
                );

                if pool.is_shutting_down() {
                    return;
                }

                if addr_in_use {
                    // Immediate retry with a fresh bind target.
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        if let Err(err) = pool.start() {
                            warn!(site = %pool.site_name, error = %err, "bind retry failed");
                        }
                    });
                } else {
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        if let Some(delay) = pool.exit_log.replenish_delay(Instant::now()) {
                            warn!(
                                site = %pool.site_name,
                                delay_ms = delay.as_millis() as u64,
                                "workers exiting rapidly, delaying replenishment"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        pool.enforce_minimum().await;
                    });
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ProcessHandle, WorkerSignal};
    use parking_lot::Mutex;
    use std::path::Path;

    #[derive(Default)]
    struct MockSpawner {
        count: AtomicUsize,
        event_senders: Mutex<Vec<mpsc::Sender<WorkerEvent>>>,
        signal_receivers: Mutex<Vec<mpsc::Receiver<WorkerSignal>>>,
    }

    impl MockSpawner {
        fn spawn_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        async fn exit_worker(&self, index: usize, code: i32) {
            let sender = self.event_senders.lock()[index].clone();
            sender
                .send(WorkerEvent::Exited { code: Some(code) })
                .await
                .unwrap();
        }

        fn received_terminate(&self, index: usize) -> bool {
            matches!(
                self.signal_receivers.lock()[index].try_recv(),
                Ok(WorkerSignal::Terminate)
            )
        }
    }

    impl ProcessSpawner for MockSpawner {
        fn spawn(&self, _spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            let (event_tx, event_rx) = mpsc::channel(8);
            let (signal_tx, signal_rx) = mpsc::channel(8);
            self.event_senders.lock().push(event_tx);
            self.signal_receivers.lock().push(signal_rx);
            Ok(ProcessHandle {
                pid: 1000 + n as u32,
                events: event_rx,
                signals: signal_tx,
            })
        }
    }

    fn test_settings(minimum: usize, maximum: usize) -> PoolSettings {
        PoolSettings {
            script: PathBuf::from("app/server.js"),
            args: Vec::new(),
            env: HashMap::new(),
            runtime: "node".into(),
            minimum,
            maximum,
            wait_for_ready: false,
            use_socket: true,
            fingerprint_ttl: Duration::from_secs(3600),
            overload_cpu: 50.0,
            overload_after: Duration::from_secs(15),
            idle_after: Duration::from_secs(180),
            busy_cpu: 92.0,
            probe_interval: Duration::from_millis(4000),
            grace_period: Duration::from_millis(100),
        }
    }

    fn test_pool(
        spawner: Arc<MockSpawner>,
        socket_dir: &Path,
        minimum: usize,
        maximum: usize,
    ) -> Arc<SitePool> {
        let allocator = Arc::new(BindAllocator::new(42000, Vec::new(), socket_dir));
        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while activity_rx.recv().await.is_some() {} });
        SitePool::new(
            "site-1",
            "api",
            test_settings(minimum, maximum),
            spawner,
            allocator,
            activity_tx,
        )
    }

    #[tokio::test]
    async fn test_enforce_minimum_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 3, 0);

        pool.enforce_minimum().await;
        pool.enforce_minimum().await;

        assert_eq!(spawner.spawn_count(), 3);
        assert_eq!(pool.running_count(), 3);
    }

    #[tokio::test]
    async fn test_sticky_fingerprint_routing() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 3, 0);
        pool.enforce_minimum().await;

        let workers = pool.ready_workers();
        assert_eq!(workers.len(), 3);

        let fp = crate::worker::fingerprint("10.9.9.9", "test-agent", "sv-SE");
        workers[1].fingerprints.insert(fp);
        let expected = workers[1].bind.backend_address();

        for _ in 0..10 {
            let addr = pool.get_address(Some(fp)).await.unwrap();
            assert_eq!(addr, expected);
        }
    }

    #[tokio::test]
    async fn test_isolated_worker_receives_no_new_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 2, 0);
        pool.enforce_minimum().await;

        let workers = pool.ready_workers();
        workers[0].isolate();
        let isolated_addr = workers[0].bind.backend_address();

        for _ in 0..10 {
            let fp = rand::random::<u64>();
            let addr = pool.get_address(Some(fp)).await.unwrap();
            assert_ne!(addr, isolated_addr);
        }
    }

    #[tokio::test]
    async fn test_isolated_worker_terminates_once_drained() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 2, 0);
        pool.enforce_minimum().await;

        let workers = pool.ready_workers();
        let fp = crate::worker::fingerprint("10.0.0.1", "agent", "en");
        workers[0].fingerprints.insert(fp);
        workers[0].isolate();
        workers[1].isolate();

        let mut system = System::new();
        pool.probe_health(&mut system);

        // A sticky client still maps to the first worker, so it keeps
        // draining; the second has nothing left and is told to exit.
        assert!(!spawner.received_terminate(0));
        assert!(spawner.received_terminate(1));
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_coalesce_on_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 1, 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.get_address(None).await.unwrap()
            }));
        }
        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap());
        }

        assert_eq!(spawner.spawn_count(), 1);
        assert!(addresses.iter().all(|a| *a == addresses[0]));
    }

    #[tokio::test]
    async fn test_start_respects_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 1, 2);

        pool.start().unwrap();
        pool.start().unwrap();
        assert!(pool.start().is_err());
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_triggers_replenishment() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(MockSpawner::default());
        let pool = test_pool(spawner.clone(), dir.path(), 1, 0);
        pool.enforce_minimum().await;
        assert_eq!(pool.running_count(), 1);

        spawner.exit_worker(0, 1).await;
        // Let the exit handler and replenishment task run.
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(pool.running_count(), 1);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[test]
    fn test_pool_settings_resolve_overrides_defaults() {
        let defaults = PoolDefaults::default();
        let backend = BackendRecord::Node {
            script: "srv/app.js".into(),
            args: vec!["--flag".into()],
            env: HashMap::new(),
            minimum_processes: Some(4),
            maximum_processes: None,
            wait_for_ready: Some(false),
            use_socket: true,
            runtime: None,
        };
        let settings = PoolSettings::resolve(&defaults, &backend).unwrap();
        assert_eq!(settings.minimum, 4);
        assert_eq!(settings.maximum, defaults.maximum_processes);
        assert!(!settings.wait_for_ready);
        assert!(settings.use_socket);
        assert_eq!(settings.runtime, "node");

        let proxy = BackendRecord::Proxy {
            target: "http://127.0.0.1:1".into(),
        };
        assert!(PoolSettings::resolve(&defaults, &proxy).is_none());
    }
}
