use crate::crypto::{CryptoStore, DerivedKeySet};
use crate::domain::devices::{
    Device, DeviceDomainEvent, DeviceEventEnvelope, DeviceId, DevicePublicKey, DeviceStatus,
};
use crate::ports::clock::Clock;
use crate::ports::devices::DeviceRepository;
use crate::telemetry::BridgeMetrics;
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// `lastSeenAt` is written back at most this often.
pub const TOUCH_INTERVAL_MINUTES: i64 = 60;
pub const DEFAULT_DEVICE_TTL_DAYS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// New devices are approved as soon as they ask.
    AutoApprove,
    /// New devices wait for an operator.
    Manual,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("invalid pairing request: {0}")]
    Invalid(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device {id} is already {status}")]
    Conflict { id: String, status: DeviceStatus },
    #[error("device {0} is not approved")]
    NotApproved(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PairingResult<T> = Result<T, PairingError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    Approved,
    PendingApproval,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounts {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
}

pub struct PairingService<R: DeviceRepository + ?Sized> {
    repository: Arc<R>,
    crypto: Arc<CryptoStore>,
    clock: Arc<dyn Clock>,
    policy: ApprovalPolicy,
    metrics: Option<Arc<BridgeMetrics>>,
    /// Held across every load-modify-save of the registry.
    writes: Mutex<()>,
}

impl<R: DeviceRepository + ?Sized> PairingService<R> {
    pub fn new(
        repository: Arc<R>,
        crypto: Arc<CryptoStore>,
        clock: Arc<dyn Clock>,
        policy: ApprovalPolicy,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            repository,
            crypto,
            clock,
            policy,
            metrics,
            writes: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    pub fn host_public_key(&self) -> &DevicePublicKey {
        self.crypto.public_key()
    }

    /// Idempotent for devices that are already approved with the same key.
    pub async fn request_pairing(
        &self,
        device_id: &str,
        public_key: &str,
        name: &str,
    ) -> PairingResult<(PairOutcome, Device)> {
        let id = DeviceId::try_new(device_id).map_err(PairingError::Invalid)?;
        let public_key = DevicePublicKey::parse(public_key).map_err(PairingError::Invalid)?;
        let _writes = self.writes.lock().await;
        let now = self.clock.now();

        let existing = self.load(&id).await?;
        let (mut device, event, previously_rejected) = match existing {
            Some(device) if device.is_approved() => {
                if device.public_key() == &public_key {
                    debug!(device = %id, "pairing repeated for approved device");
                    return Ok((PairOutcome::Approved, device));
                }
                return Err(PairingError::Conflict {
                    id: id.to_string(),
                    status: DeviceStatus::Approved,
                });
            }
            Some(mut device) => {
                let rejected = device.status() == DeviceStatus::Rejected;
                let event = device.rerequest(name, public_key, now);
                (device, event, rejected)
            }
            None => {
                let (device, event) = Device::request(id.clone(), name, public_key, now);
                (device, event, false)
            }
        };
        self.record(&event);

        // A device the operator turned away never gets waved through again.
        if self.policy == ApprovalPolicy::AutoApprove && !previously_rejected {
            let event = device.approve(now).map_err(|err| PairingError::Internal(err.to_string()))?;
            self.record(&event);
        }

        let device = self.persist(device).await?;
        let outcome = if device.is_approved() {
            PairOutcome::Approved
        } else {
            PairOutcome::PendingApproval
        };
        info!(device = %device.id(), name = device.name(), ?outcome, "pairing request handled");
        Ok((outcome, device))
    }

    /// Approving an approved device is a no-op.
    pub async fn approve(&self, device_id: &str) -> PairingResult<Device> {
        let _writes = self.writes.lock().await;
        let mut device = self.require(device_id).await?;
        match device.status() {
            DeviceStatus::Approved => Ok(device),
            DeviceStatus::Rejected => Err(PairingError::Conflict {
                id: device.id().to_string(),
                status: DeviceStatus::Rejected,
            }),
            DeviceStatus::Pending => {
                let event = device
                    .approve(self.clock.now())
                    .map_err(|err| PairingError::Internal(err.to_string()))?;
                self.record(&event);
                self.persist(device).await
            }
        }
    }

    /// Rejecting a rejected device is a no-op.
    pub async fn reject(&self, device_id: &str) -> PairingResult<Device> {
        let _writes = self.writes.lock().await;
        let mut device = self.require(device_id).await?;
        match device.status() {
            DeviceStatus::Rejected => Ok(device),
            DeviceStatus::Approved => Err(PairingError::Conflict {
                id: device.id().to_string(),
                status: DeviceStatus::Approved,
            }),
            DeviceStatus::Pending => {
                let event = device
                    .reject()
                    .map_err(|err| PairingError::Internal(err.to_string()))?;
                self.record(&event);
                self.persist(device).await
            }
        }
    }

    pub async fn revoke(&self, device_id: &str) -> PairingResult<()> {
        let id = DeviceId::try_new(device_id).map_err(PairingError::Invalid)?;
        let _writes = self.writes.lock().await;
        let removed = self
            .repository
            .delete(&id)
            .await
            .map_err(|err| PairingError::Internal(format!("{err:#}")))?;
        if !removed {
            return Err(PairingError::NotFound(id.to_string()));
        }
        self.record(&DeviceEventEnvelope::new(id, DeviceDomainEvent::Revoked));
        Ok(())
    }

    pub async fn pending(&self) -> PairingResult<Vec<Device>> {
        Ok(self
            .devices()
            .await?
            .into_iter()
            .filter(|device| device.status() == DeviceStatus::Pending)
            .collect())
    }

    pub async fn devices(&self) -> PairingResult<Vec<Device>> {
        self.repository
            .list()
            .await
            .map_err(|err| PairingError::Internal(format!("{err:#}")))
    }

    pub async fn counts(&self) -> PairingResult<DeviceCounts> {
        let mut counts = DeviceCounts::default();
        for device in self.devices().await? {
            match device.status() {
                DeviceStatus::Pending => counts.pending += 1,
                DeviceStatus::Approved => counts.approved += 1,
                DeviceStatus::Rejected => counts.rejected += 1,
            }
        }
        Ok(counts)
    }

    /// Keys for an approved device; anything else is refused.
    pub async fn authorize(&self, id: &DeviceId) -> PairingResult<(Device, DerivedKeySet)> {
        let device = self
            .load(id)
            .await?
            .ok_or_else(|| PairingError::NotFound(id.to_string()))?;
        if !device.is_approved() {
            return Err(PairingError::NotApproved(id.to_string()));
        }
        let keys = self
            .crypto
            .derive_keys(device.public_key())
            .map_err(|err| PairingError::Internal(err.to_string()))?;
        Ok((device, keys))
    }

    /// Records activity, writing through only when the stored stamp is stale.
    pub async fn touch(&self, id: &DeviceId) -> PairingResult<bool> {
        let _writes = self.writes.lock().await;
        let Some(mut device) = self.load(id).await? else {
            return Ok(false);
        };
        if !device.is_approved() {
            return Ok(false);
        }
        let now = self.clock.now();
        let fresh = device
            .last_seen_at()
            .is_some_and(|seen| now.signed_duration_since(seen) < Duration::minutes(TOUCH_INTERVAL_MINUTES));
        if fresh {
            return Ok(false);
        }
        device.touch(now);
        self.persist(device).await?;
        Ok(true)
    }

    /// Drops devices with no activity within `ttl`. Returns how many went.
    pub async fn prune_stale(&self, ttl: Duration) -> PairingResult<usize> {
        let _writes = self.writes.lock().await;
        let now = self.clock.now();
        let mut pruned = 0;
        for device in self.devices().await? {
            if !device.is_stale(now, ttl) {
                continue;
            }
            let removed = self
                .repository
                .delete(device.id())
                .await
                .map_err(|err| PairingError::Internal(format!("{err:#}")))?;
            if removed {
                pruned += 1;
                self.record(&DeviceEventEnvelope::new(
                    device.id().clone(),
                    DeviceDomainEvent::Pruned,
                ));
            }
        }
        if pruned > 0 {
            info!(pruned, ttl_days = ttl.num_days(), "pruned stale devices");
        }
        Ok(pruned)
    }

    async fn require(&self, device_id: &str) -> PairingResult<Device> {
        let id = DeviceId::try_new(device_id).map_err(PairingError::Invalid)?;
        self.load(&id)
            .await?
            .ok_or_else(|| PairingError::NotFound(id.to_string()))
    }

    async fn load(&self, id: &DeviceId) -> PairingResult<Option<Device>> {
        self.repository
            .get(id)
            .await
            .map_err(|err| PairingError::Internal(format!("{err:#}")))
    }

    async fn persist(&self, device: Device) -> PairingResult<Device> {
        self.repository.save(device).await.map_err(|err| {
            warn!(error = %format!("{err:#}"), "failed to persist device registry");
            PairingError::Internal(format!("{err:#}"))
        })
    }

    fn record(&self, envelope: &DeviceEventEnvelope) {
        debug!(device = %envelope.device_id, event = envelope.event.label(), "device event");
        if let Some(metrics) = &self.metrics {
            metrics.record_pairing_event(envelope.event.label());
        }
    }
}
