use super::verifier::{TranscriptVerifier, VerifyConfig};
use crate::app::sessions::EngagementCache;
use crate::domain::delivery::{
    DeliveryMode, DeliveryOutcome, DeliveryPayload, ModeReason, VerificationResult,
};
use crate::domain::sessions::Session;
use crate::ports::delivery::{
    ForwardRequest, HeadlessError, HeadlessInvoker, HeadlessRequest, ScreenLockProbe,
    UiAutomationPort, UiForwardError,
};
use crate::telemetry::BridgeMetrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);
const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub health_timeout: Duration,
    pub forward_timeout: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
    pub verify: VerifyConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            max_retries: DEFAULT_MAX_RETRIES,
            verify: VerifyConfig::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("audio messages need the ui path, which is unavailable ({0})")]
    AudioRequiresUi(ModeReason),
    #[error("ui automation still unreachable after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    #[error(transparent)]
    Ui(UiForwardError),
    #[error("headless delivery failed: {0}")]
    ExternalProcess(String),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::AudioRequiresUi(_) => "audio_requires_ui",
            DeliveryError::Transient { .. } => "ui_unreachable",
            DeliveryError::Ui(UiForwardError::TimedOut(_)) => "ui_timeout",
            DeliveryError::Ui(_) => "ui_failed",
            DeliveryError::ExternalProcess(_) => "headless_failed",
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Hands out one fair lock per session so deliveries queue in arrival order.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn slot(&self, session_id: &str) -> SessionSlot<'_> {
        let mut locks = self.locks.lock().expect("session locks poisoned");
        let handle = Arc::clone(locks.entry(session_id.to_string()).or_default());
        SessionSlot {
            locks: self,
            session_id: session_id.to_string(),
            handle,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().expect("session locks poisoned").len()
    }
}

/// A claim on a session's queue. Dropping the last claim removes the entry,
/// including when the delivery future is cancelled mid-flight.
struct SessionSlot<'a> {
    locks: &'a SessionLocks,
    session_id: String,
    handle: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.locks.lock() else {
            return;
        };
        // one reference in the map, one here
        let last = locks.get(&self.session_id).is_some_and(|lock| {
            Arc::ptr_eq(lock, &self.handle) && Arc::strong_count(lock) == 2
        });
        if last {
            locks.remove(&self.session_id);
        }
    }
}

/// Routes a message to a session through whichever path can take it right now.
pub struct DeliveryRouter {
    cache: Arc<EngagementCache>,
    screen_lock: Arc<dyn ScreenLockProbe>,
    ui: Arc<dyn UiAutomationPort>,
    headless: Arc<dyn HeadlessInvoker>,
    verifier: TranscriptVerifier,
    config: DeliveryConfig,
    metrics: Option<Arc<BridgeMetrics>>,
    session_locks: SessionLocks,
}

impl DeliveryRouter {
    pub fn new(
        cache: Arc<EngagementCache>,
        screen_lock: Arc<dyn ScreenLockProbe>,
        ui: Arc<dyn UiAutomationPort>,
        headless: Arc<dyn HeadlessInvoker>,
        config: DeliveryConfig,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            cache,
            screen_lock,
            ui,
            headless,
            verifier: TranscriptVerifier::new(config.verify),
            config,
            metrics,
            session_locks: SessionLocks::default(),
        }
    }

    pub async fn detect_mode(&self) -> ModeReason {
        match self.screen_lock.is_locked().await {
            Ok(true) => return ModeReason::Locked,
            Ok(false) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "screen lock probe failed; assuming unlocked");
            }
        }
        if self.ui.healthy(self.config.health_timeout).await {
            ModeReason::Unlocked
        } else {
            ModeReason::UiUnavailable
        }
    }

    pub async fn deliver(
        &self,
        session_id: &str,
        payload: DeliveryPayload,
    ) -> DeliveryResult<DeliveryOutcome> {
        let session = self
            .cache
            .get_one(session_id, false)
            .await
            .ok_or_else(|| DeliveryError::NotFound(session_id.to_string()))?;

        let slot = self.session_locks.slot(&session.id);
        let _turn = slot.handle.lock().await;
        self.deliver_locked(&session, payload).await
    }

    async fn deliver_locked(
        &self,
        session: &Session,
        payload: DeliveryPayload,
    ) -> DeliveryResult<DeliveryOutcome> {
        let started = std::time::Instant::now();
        let reason = self.detect_mode().await;
        let mode = reason.mode();
        debug!(session = %session.id, %mode, %reason, "delivery mode selected");

        let dispatched = match mode {
            DeliveryMode::Ui => self.dispatch_ui(session, &payload).await,
            DeliveryMode::Headless => self.dispatch_headless(session, &payload, reason).await,
        };
        let response = match dispatched {
            Ok(response) => response,
            Err(err) => {
                warn!(session = %session.id, %mode, error = %err, "delivery failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_delivery_failure(mode.as_str(), err.code());
                }
                return Err(err);
            }
        };

        let verification = if mode == DeliveryMode::Ui && payload.needs_verification() {
            Some(self.verify(session, &payload.text).await)
        } else {
            None
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(mode.as_str(), reason.as_str(), elapsed_ms);
        }
        info!(
            session = %session.id,
            %mode,
            %reason,
            verified = verification.map(|v| v.verified),
            elapsed_ms,
            "message delivered"
        );
        Ok(DeliveryOutcome {
            session_id: session.id.clone(),
            mode,
            reason,
            verification,
            response,
        })
    }

    async fn dispatch_ui(
        &self,
        session: &Session,
        payload: &DeliveryPayload,
    ) -> DeliveryResult<Option<String>> {
        let request = ForwardRequest {
            session_id: session.id.clone(),
            project_path: session.project_path.clone(),
            text: payload.text.clone(),
            audio: payload.audio.clone(),
            submit: true,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.ui.forward(&request, self.config.forward_timeout).await {
                Ok(()) => return Ok(None),
                Err(err) if err.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_base * 2u32.pow(attempt - 1);
                    warn!(
                        session = %session.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ui automation unreachable; retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_delivery_retry(attempt);
                    }
                    time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(DeliveryError::Transient {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(DeliveryError::Ui(err)),
            }
        }
    }

    async fn dispatch_headless(
        &self,
        session: &Session,
        payload: &DeliveryPayload,
        reason: ModeReason,
    ) -> DeliveryResult<Option<String>> {
        if payload.has_audio() {
            return Err(DeliveryError::AudioRequiresUi(reason));
        }
        if payload.is_submit_only() {
            debug!(session = %session.id, "nothing to submit headlessly");
            return Ok(None);
        }
        let request = HeadlessRequest {
            session_id: session.id.clone(),
            cwd: session.project_dir().map(|dir| dir.to_path_buf()),
            text: payload.text.clone(),
        };
        match self.headless.invoke(&request).await {
            Ok(reply) => Ok(Some(reply.text)),
            Err(HeadlessError::NonZeroExit { code, stderr }) => Err(DeliveryError::ExternalProcess(
                format!("agent cli exited with {code:?}: {stderr}"),
            )),
            Err(HeadlessError::Command(message)) => Err(DeliveryError::ExternalProcess(message)),
        }
    }

    async fn verify(&self, session: &Session, text: &str) -> VerificationResult {
        let result = self.verifier.verify(&session.transcript_path, text).await;
        if !result.verified {
            debug!(session = %session.id, attempts = result.attempts, "delivery not seen in transcript");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_verification(result.verified, result.attempts);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::sessions::CacheConfig;
    use crate::ports::clock::SystemClock;
    use crate::ports::delivery::HeadlessReply;
    use crate::ports::sessions::SessionSource;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct OneSession(Session);

    #[async_trait]
    impl SessionSource for OneSession {
        async fn scan(&self) -> anyhow::Result<Vec<Session>> {
            Ok(vec![self.0.clone()])
        }

        async fn find(&self, id: &str) -> anyhow::Result<Option<Session>> {
            Ok(self.0.answers_to(id).then(|| self.0.clone()))
        }
    }

    struct FixedLock(anyhow::Result<bool>);

    #[async_trait]
    impl ScreenLockProbe for FixedLock {
        async fn is_locked(&self) -> anyhow::Result<bool> {
            match &self.0 {
                Ok(locked) => Ok(*locked),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    #[derive(Default)]
    struct ScriptedUi {
        healthy: bool,
        failures: Mutex<Vec<UiForwardError>>,
        calls: Mutex<Vec<Instant>>,
        hold: Duration,
        active: AtomicUsize,
        overlapped: AtomicBool,
        forwarded: Mutex<Vec<String>>,
    }

    impl ScriptedUi {
        fn healthy() -> Self {
            Self {
                healthy: true,
                ..Self::default()
            }
        }

        fn failing(failures: Vec<UiForwardError>) -> Self {
            Self {
                healthy: true,
                failures: Mutex::new(failures),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UiAutomationPort for ScriptedUi {
        async fn healthy(&self, _timeout: Duration) -> bool {
            self.healthy
        }

        async fn forward(
            &self,
            request: &ForwardRequest,
            _timeout: Duration,
        ) -> Result<(), UiForwardError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if !self.hold.is_zero() {
                time::sleep(self.hold).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.forwarded.lock().unwrap().push(request.text.clone());
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    #[derive(Default)]
    struct RecordingHeadless {
        requests: Mutex<Vec<HeadlessRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl HeadlessInvoker for RecordingHeadless {
        async fn invoke(&self, request: &HeadlessRequest) -> Result<HeadlessReply, HeadlessError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(HeadlessError::NonZeroExit {
                    code: Some(1),
                    stderr: "no conversation found".into(),
                });
            }
            Ok(HeadlessReply {
                text: format!("echo: {}", request.text),
            })
        }
    }

    fn session(transcript: PathBuf) -> Session {
        Session::new(
            "0b5c1f0e-4a43-4c5b-9d54-0f6b8a3b2d11",
            "-Users-arach-dev-talkie",
            "/Users/arach/dev/talkie",
            transcript,
            Utc::now(),
        )
    }

    fn router_with(
        session: Session,
        locked: anyhow::Result<bool>,
        ui: Arc<ScriptedUi>,
        headless: Arc<RecordingHeadless>,
    ) -> DeliveryRouter {
        let cache = EngagementCache::new(
            Arc::new(OneSession(session)),
            Arc::new(SystemClock),
            CacheConfig {
                poll_interval: Duration::from_secs(3600),
                ..CacheConfig::default()
            },
            None,
        );
        DeliveryRouter::new(
            cache,
            Arc::new(FixedLock(locked)),
            ui,
            headless,
            DeliveryConfig {
                verify: VerifyConfig {
                    window: Duration::from_millis(200),
                    interval: Duration::from_millis(50),
                    ..VerifyConfig::default()
                },
                ..DeliveryConfig::default()
            },
            None,
        )
    }

    fn connect_error() -> UiForwardError {
        UiForwardError::Connect("connection refused".into())
    }

    #[tokio::test]
    async fn locked_screen_goes_headless() {
        let ui = Arc::new(ScriptedUi::healthy());
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(session("/tmp/none.jsonl".into()), Ok(true), ui.clone(), headless.clone());

        let outcome = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text("run the tests"))
            .await
            .unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Headless);
        assert_eq!(outcome.reason, ModeReason::Locked);
        assert_eq!(outcome.response.as_deref(), Some("echo: run the tests"));
        assert_eq!(outcome.verification, None);
        assert!(ui.calls().is_empty());

        let requests = headless.requests.lock().unwrap();
        assert_eq!(requests[0].session_id, "0b5c1f0e-4a43-4c5b-9d54-0f6b8a3b2d11");
        assert_eq!(requests[0].cwd, Some(PathBuf::from("/Users/arach/dev/talkie")));
    }

    #[tokio::test]
    async fn unhealthy_ui_goes_headless() {
        let ui = Arc::new(ScriptedUi::default());
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(session("/tmp/none.jsonl".into()), Ok(false), ui, headless);
        assert_eq!(router.detect_mode().await, ModeReason::UiUnavailable);
    }

    #[tokio::test]
    async fn lock_probe_failure_counts_as_unlocked() {
        let ui = Arc::new(ScriptedUi::healthy());
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Err(anyhow::anyhow!("ioreg missing")),
            ui,
            headless,
        );
        assert_eq!(router.detect_mode().await, ModeReason::Unlocked);
    }

    #[tokio::test]
    async fn healthy_ui_delivers_and_verifies() {
        let temp = TempDir::new().unwrap();
        let transcript = temp.path().join("s.jsonl");
        std::fs::write(
            &transcript,
            "{\"type\":\"user\",\"message\":{\"content\":\"Ship It\"}}\n",
        )
        .unwrap();
        let ui = Arc::new(ScriptedUi::healthy());
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(session(transcript), Ok(false), ui.clone(), headless.clone());

        let outcome = router
            .deliver("0b5c1f0e-4a43-4c5b-9d54-0f6b8a3b2d11", DeliveryPayload::text("ship it"))
            .await
            .unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Ui);
        assert_eq!(outcome.reason, ModeReason::Unlocked);
        let verification = outcome.verification.unwrap();
        assert!(verification.verified);
        assert_eq!(verification.attempts, 1);
        assert_eq!(ui.calls().len(), 1);
        assert!(headless.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unseen_message_is_still_a_success() {
        let ui = Arc::new(ScriptedUi::healthy());
        let router = router_with(
            session("/tmp/talkie-bridge-missing.jsonl".into()),
            Ok(false),
            ui,
            Arc::new(RecordingHeadless::default()),
        );
        let outcome = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text("hello"))
            .await
            .unwrap();
        assert!(!outcome.verification.unwrap().verified);
    }

    #[tokio::test]
    async fn empty_text_is_submitted_but_never_verified() {
        let ui = Arc::new(ScriptedUi::healthy());
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        );
        let outcome = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text("   "))
            .await
            .unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Ui);
        assert_eq!(outcome.verification, None);
        assert_eq!(ui.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failures_retry_with_backoff() {
        let ui = Arc::new(ScriptedUi::failing(vec![connect_error(), connect_error()]));
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        );
        let started = Instant::now();
        let outcome = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text(""))
            .await
            .unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Ui);

        let calls = ui.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_millis(500));
        assert!(calls[2] - calls[1] >= Duration::from_millis(1000));
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_is_transient() {
        let ui = Arc::new(ScriptedUi::failing(vec![
            connect_error(),
            connect_error(),
            connect_error(),
        ]));
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        );
        let err = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transient { attempts: 3, .. }));
        assert_eq!(err.code(), "ui_unreachable");
        assert_eq!(ui.calls().len(), 3);
    }

    #[tokio::test]
    async fn timeouts_are_never_retried() {
        let ui = Arc::new(ScriptedUi::failing(vec![UiForwardError::TimedOut(
            Duration::from_secs(30),
        )]));
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        );
        let err = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ui_timeout");
        assert_eq!(ui.calls().len(), 1);
    }

    #[tokio::test]
    async fn headless_failures_are_not_retried() {
        let headless = Arc::new(RecordingHeadless {
            fail: true,
            ..RecordingHeadless::default()
        });
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(true),
            Arc::new(ScriptedUi::healthy()),
            headless.clone(),
        );
        let err = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ExternalProcess(_)));
        assert_eq!(headless.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audio_needs_the_ui() {
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(true),
            Arc::new(ScriptedUi::healthy()),
            headless.clone(),
        );
        let payload = DeliveryPayload::from_parts(None, Some("AAAA".into()), None);
        let err = router.deliver("-Users-arach-dev-talkie", payload).await.unwrap_err();
        assert_eq!(err, DeliveryError::AudioRequiresUi(ModeReason::Locked));
        assert!(headless.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_only_headless_is_a_no_op() {
        let headless = Arc::new(RecordingHeadless::default());
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(true),
            Arc::new(ScriptedUi::healthy()),
            headless.clone(),
        );
        let outcome = router
            .deliver("-Users-arach-dev-talkie", DeliveryPayload::text(""))
            .await
            .unwrap();
        assert_eq!(outcome.response, None);
        assert!(headless.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let router = router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            Arc::new(ScriptedUi::healthy()),
            Arc::new(RecordingHeadless::default()),
        );
        let err = router
            .deliver("ghost", DeliveryPayload::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::NotFound("ghost".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn same_session_deliveries_are_serialized_in_order() {
        let ui = Arc::new(ScriptedUi {
            healthy: true,
            hold: Duration::from_millis(100),
            ..ScriptedUi::default()
        });
        let router = Arc::new(router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        ));
        // warm the cache so both deliveries resolve without rescanning
        router.cache.get(false).await;

        let mut tasks = Vec::new();
        for text in ["first", "second", "third"] {
            let router = Arc::clone(&router);
            tasks.push(tokio::spawn(async move {
                let payload = DeliveryPayload::from_parts(Some(text.into()), Some("AAAA".into()), None);
                router.deliver("-Users-arach-dev-talkie", payload).await
            }));
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(!ui.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            *ui.forwarded.lock().unwrap(),
            vec!["first".to_string(), "second".into(), "third".into()]
        );
        assert_eq!(router.session_locks.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deliveries_release_their_session_entry() {
        let ui = Arc::new(ScriptedUi {
            healthy: true,
            hold: Duration::from_secs(10),
            ..ScriptedUi::default()
        });
        let router = Arc::new(router_with(
            session("/tmp/none.jsonl".into()),
            Ok(false),
            ui.clone(),
            Arc::new(RecordingHeadless::default()),
        ));
        router.cache.get(false).await;

        let queued = tokio::spawn({
            let router = Arc::clone(&router);
            async move {
                time::timeout(
                    Duration::from_millis(500),
                    router.deliver("-Users-arach-dev-talkie", DeliveryPayload::text("second")),
                )
                .await
            }
        });
        let first = time::timeout(
            Duration::from_secs(1),
            router.deliver("-Users-arach-dev-talkie", DeliveryPayload::text("first")),
        )
        .await;
        assert!(first.is_err());
        assert!(queued.await.unwrap().is_err());
        assert_eq!(ui.calls().len(), 1);
        assert_eq!(router.session_locks.len(), 0);
    }
}
