use crate::domain::sessions::Session;
use crate::ports::clock::Clock;
use crate::ports::sessions::SessionSource;
use crate::telemetry::BridgeMetrics;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Idle,
    Polling,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub state: CacheState,
    pub count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}

type ScanResult = Result<Arc<Vec<Session>>, Arc<String>>;
type InFlightScan = Shared<BoxFuture<'static, ScanResult>>;

struct Inner {
    state: CacheState,
    sessions: Arc<Vec<Session>>,
    last_refresh: Option<DateTime<Utc>>,
    last_access: Instant,
    poller: Option<JoinHandle<()>>,
    in_flight: Option<InFlightScan>,
}

impl Inner {
    fn go_idle(&mut self) {
        self.state = CacheState::Idle;
        self.sessions = Arc::new(Vec::new());
        self.last_refresh = None;
        self.in_flight = None;
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Session list that is only kept warm while someone is asking for it.
///
/// The first read after an idle period scans synchronously and starts a
/// background poller; once nobody has read for `idle_timeout` the poller
/// stops and the list is dropped.
pub struct EngagementCache {
    source: Arc<dyn SessionSource>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    metrics: Option<Arc<BridgeMetrics>>,
    inner: Mutex<Inner>,
}

impl EngagementCache {
    pub fn new(
        source: Arc<dyn SessionSource>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Arc<Self> {
        let last_access = clock.instant();
        Arc::new(Self {
            source,
            clock,
            config,
            metrics,
            inner: Mutex::new(Inner {
                state: CacheState::Idle,
                sessions: Arc::new(Vec::new()),
                last_refresh: None,
                last_access,
                poller: None,
                in_flight: None,
            }),
        })
    }

    /// Current sessions; `force` bypasses the cached list and rescans first.
    pub async fn get(self: &Arc<Self>, force: bool) -> Vec<Session> {
        let needs_sync = self.touch();
        if force || needs_sync {
            self.refresh().await;
        }
        let inner = self.inner.lock().expect("engagement cache poisoned");
        inner.sessions.as_ref().clone()
    }

    /// Resolves by exact id, then folder name, then an uncached lookup.
    pub async fn get_one(self: &Arc<Self>, id: &str, force: bool) -> Option<Session> {
        let sessions = self.get(force).await;
        if let Some(session) = sessions.iter().find(|session| session.id == id) {
            return Some(session.clone());
        }
        if let Some(session) = sessions.iter().find(|session| session.folder_name == id) {
            return Some(session.clone());
        }
        match self.source.find(id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(%id, error = %format!("{err:#}"), "direct session lookup failed");
                None
            }
        }
    }

    pub fn status(&self) -> CacheStatus {
        let mut inner = self.inner.lock().expect("engagement cache poisoned");
        self.expire_if_idle(&mut inner);
        CacheStatus {
            state: inner.state,
            count: inner.sessions.len(),
            last_refresh: inner.last_refresh,
        }
    }

    /// One poller step. Returns false once the cache has gone idle.
    pub async fn tick(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock().expect("engagement cache poisoned");
            if inner.state == CacheState::Idle {
                return false;
            }
            if self.expire_if_idle(&mut inner) {
                return false;
            }
        }
        self.refresh().await;
        true
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("engagement cache poisoned");
        if inner.state == CacheState::Polling {
            info!("stopping session cache poller");
        }
        inner.go_idle();
    }

    fn expire_if_idle(&self, inner: &mut Inner) -> bool {
        if inner.state != CacheState::Polling {
            return false;
        }
        let idle_for = self.clock.instant().saturating_duration_since(inner.last_access);
        if idle_for < self.config.idle_timeout {
            return false;
        }
        info!(idle_secs = idle_for.as_secs(), "session cache disengaged");
        inner.go_idle();
        true
    }

    /// Marks activity; true when the caller must refresh before reading.
    fn touch(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().expect("engagement cache poisoned");
        self.expire_if_idle(&mut inner);
        inner.last_access = self.clock.instant();
        if inner.state == CacheState::Idle {
            inner.state = CacheState::Polling;
            inner.poller = Some(self.spawn_poller());
            info!("session cache engaged");
            return true;
        }
        inner.last_refresh.is_none()
    }

    fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.poll_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if !cache.tick().await {
                    debug!("session cache poller exiting");
                    break;
                }
            }
        })
    }

    /// Single-flight: concurrent callers await the scan already running.
    async fn refresh(&self) {
        let scan = {
            let mut inner = self.inner.lock().expect("engagement cache poisoned");
            match &inner.in_flight {
                Some(scan) => scan.clone(),
                None => {
                    let source = Arc::clone(&self.source);
                    let scan = async move {
                        source
                            .scan()
                            .await
                            .map(Arc::new)
                            .map_err(|err| Arc::new(format!("{err:#}")))
                    }
                    .boxed()
                    .shared();
                    inner.in_flight = Some(scan.clone());
                    scan
                }
            }
        };

        let started = std::time::Instant::now();
        let result = scan.clone().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut inner = self.inner.lock().expect("engagement cache poisoned");
        let owns_result = inner
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&scan));
        if !owns_result {
            return;
        }
        inner.in_flight = None;
        match result {
            Ok(sessions) => {
                if inner.state == CacheState::Polling {
                    debug!(count = sessions.len(), elapsed_ms, "session cache refreshed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_refresh(elapsed_ms, sessions.len());
                    }
                    inner.sessions = sessions;
                    inner.last_refresh = Some(self.clock.now());
                }
            }
            Err(err) => {
                warn!(error = %err, "session scan failed; keeping previous list");
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_refresh_failure("scan");
                }
            }
        }
    }
}

impl Drop for EngagementCache {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if let Some(poller) = inner.poller.take() {
                poller.abort();
            }
        }
    }
}
