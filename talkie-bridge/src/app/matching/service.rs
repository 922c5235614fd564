use crate::app::sessions::EngagementCache;
use crate::domain::matching::{MatchReport, TerminalFingerprint};
use crate::domain::sessions::Session;
use crate::matcher::FuzzyMatcher;
use crate::ports::clock::Clock;
use crate::ports::matching::{ConfirmedMappingRepository, TerminalSource};
use crate::telemetry::BridgeMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_REPORT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchServiceError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type MatchServiceResult<T> = Result<T, MatchServiceError>;

struct CachedReport {
    built_at: Instant,
    report: Arc<MatchReport>,
}

/// Gathers terminals, sessions and confirmed mappings, then scores them.
pub struct MatchService {
    cache: Arc<EngagementCache>,
    terminals: Arc<dyn TerminalSource>,
    mappings: Arc<dyn ConfirmedMappingRepository>,
    matcher: FuzzyMatcher,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<BridgeMetrics>>,
    report_ttl: Duration,
    last: Mutex<Option<CachedReport>>,
}

impl MatchService {
    pub fn new(
        cache: Arc<EngagementCache>,
        terminals: Arc<dyn TerminalSource>,
        mappings: Arc<dyn ConfirmedMappingRepository>,
        matcher: FuzzyMatcher,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            cache,
            terminals,
            mappings,
            matcher,
            clock,
            metrics,
            report_ttl: DEFAULT_REPORT_TTL,
            last: Mutex::new(None),
        }
    }

    /// Latest report, reusing a recent one unless `fresh` is set.
    pub async fn report(&self, fresh: bool) -> Arc<MatchReport> {
        if !fresh {
            let last = self.last.lock().await;
            if let Some(cached) = last.as_ref() {
                if self.clock.instant().saturating_duration_since(cached.built_at) < self.report_ttl {
                    let report = Arc::clone(&cached.report);
                    drop(last);
                    // a reused report still counts as engagement
                    self.cache.get(false).await;
                    return report;
                }
            }
        }
        self.build(false).await
    }

    /// Forces a deep session sync before matching.
    pub async fn scan(&self) -> Arc<MatchReport> {
        self.build(true).await
    }

    /// Pins a terminal to a session; later scans score it at 100.
    pub async fn confirm(
        &self,
        fingerprint: &str,
        session_id: &str,
    ) -> MatchServiceResult<(TerminalFingerprint, Session)> {
        let fingerprint =
            TerminalFingerprint::parse(fingerprint).map_err(MatchServiceError::Invalid)?;
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(MatchServiceError::Invalid("sessionId is required".into()));
        }
        let session = self
            .cache
            .get_one(session_id, false)
            .await
            .ok_or_else(|| MatchServiceError::NotFound(session_id.to_string()))?;

        self.mappings
            .confirm(fingerprint.clone(), session.id.clone())
            .await
            .map_err(|err| MatchServiceError::Internal(format!("{err:#}")))?;
        self.last.lock().await.take();
        info!(%fingerprint, session = %session.id, "terminal mapping confirmed");
        Ok((fingerprint, session))
    }

    async fn build(&self, deep_sync: bool) -> Arc<MatchReport> {
        let started = std::time::Instant::now();
        let (terminals, sessions) =
            tokio::join!(self.terminals.list_terminals(), self.cache.get(deep_sync));
        let overrides = match self.mappings.all().await {
            Ok(overrides) => overrides,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "confirmed mappings unavailable");
                BTreeMap::new()
            }
        };

        let outcome = self.matcher.match_terminals(&terminals, &sessions, &overrides);
        let report = Arc::new(MatchReport {
            matches: outcome.matches,
            unmatched: outcome.unmatched,
            generated_at: self.clock.now(),
        });

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            terminals = terminals.len(),
            sessions = sessions.len(),
            matched = report.matches.len(),
            elapsed_ms,
            "terminal match complete"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_match_scan(elapsed_ms, report.matches.len(), report.unmatched.len());
        }

        *self.last.lock().await = Some(CachedReport {
            built_at: self.clock.instant(),
            report: Arc::clone(&report),
        });
        report
    }
}
