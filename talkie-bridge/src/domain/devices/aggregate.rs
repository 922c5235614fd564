use super::events::{DeviceDomainEvent, DeviceEventEnvelope};
use super::value_object::{normalize_device_name, DeviceId, DevicePublicKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Rejected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionError {
    /// The device is not in a state that allows the requested transition.
    NotPending(DeviceStatus),
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::NotPending(status) => {
                write!(f, "device is {status}, expected pending")
            }
        }
    }
}

/// A paired (or pairing) mobile endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    id: DeviceId,
    name: String,
    public_key: DevicePublicKey,
    status: DeviceStatus,
    requested_at: DateTime<Utc>,
    paired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn request(
        id: DeviceId,
        name: &str,
        public_key: DevicePublicKey,
        now: DateTime<Utc>,
    ) -> (Self, DeviceEventEnvelope) {
        let name = normalize_device_name(name, &id);
        let device = Self {
            id: id.clone(),
            name: name.clone(),
            public_key,
            status: DeviceStatus::Pending,
            requested_at: now,
            paired_at: None,
            last_seen_at: None,
        };
        let event = DeviceEventEnvelope::new(id, DeviceDomainEvent::PairingRequested { name });
        (device, event)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &DevicePublicKey {
        &self.public_key
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn paired_at(&self) -> Option<DateTime<Utc>> {
        self.paired_at
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at
    }

    pub fn is_approved(&self) -> bool {
        self.status == DeviceStatus::Approved
    }

    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<DeviceEventEnvelope, TransitionError> {
        if self.status != DeviceStatus::Pending {
            return Err(TransitionError::NotPending(self.status));
        }
        self.status = DeviceStatus::Approved;
        self.paired_at = Some(now);
        self.last_seen_at = Some(now);
        Ok(DeviceEventEnvelope::new(
            self.id.clone(),
            DeviceDomainEvent::StatusChanged {
                status: DeviceStatus::Approved,
            },
        ))
    }

    pub fn reject(&mut self) -> Result<DeviceEventEnvelope, TransitionError> {
        if self.status != DeviceStatus::Pending {
            return Err(TransitionError::NotPending(self.status));
        }
        self.status = DeviceStatus::Rejected;
        Ok(DeviceEventEnvelope::new(
            self.id.clone(),
            DeviceDomainEvent::StatusChanged {
                status: DeviceStatus::Rejected,
            },
        ))
    }

    /// Re-opens a request from a device that is not approved, refreshing its key.
    pub fn rerequest(
        &mut self,
        name: &str,
        public_key: DevicePublicKey,
        now: DateTime<Utc>,
    ) -> DeviceEventEnvelope {
        self.name = normalize_device_name(name, &self.id);
        self.public_key = public_key;
        self.status = DeviceStatus::Pending;
        self.requested_at = now;
        self.paired_at = None;
        DeviceEventEnvelope::new(
            self.id.clone(),
            DeviceDomainEvent::PairingRequested {
                name: self.name.clone(),
            },
        )
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = Some(now);
    }

    /// Most recent moment the device showed any sign of life.
    pub fn last_activity(&self) -> DateTime<Utc> {
        [Some(self.requested_at), self.paired_at, self.last_seen_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.requested_at)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_activity()) > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;
    use rand_core::OsRng;

    fn mk_device(now: DateTime<Utc>) -> Device {
        let key = DevicePublicKey::from_public_key(&SecretKey::random(&mut OsRng).public_key());
        let (device, event) =
            Device::request(DeviceId::try_new("phone").unwrap(), "Phone", key, now);
        assert!(matches!(
            event.event,
            DeviceDomainEvent::PairingRequested { .. }
        ));
        device
    }

    #[test]
    fn approve_requires_pending() {
        let now = Utc::now();
        let mut device = mk_device(now);
        device.approve(now).unwrap();
        assert!(device.is_approved());
        assert_eq!(device.paired_at(), Some(now));
        assert_eq!(
            device.approve(now),
            Err(TransitionError::NotPending(DeviceStatus::Approved))
        );
        assert!(device.reject().is_err());
    }

    #[test]
    fn rerequest_resets_rejected_device() {
        let now = Utc::now();
        let mut device = mk_device(now);
        device.reject().unwrap();
        assert_eq!(device.status(), DeviceStatus::Rejected);
        let key = DevicePublicKey::from_public_key(&SecretKey::random(&mut OsRng).public_key());
        device.rerequest("Renamed", key.clone(), now);
        assert_eq!(device.status(), DeviceStatus::Pending);
        assert_eq!(device.public_key(), &key);
        assert_eq!(device.name(), "Renamed");
    }

    #[test]
    fn staleness_uses_latest_activity() {
        let now = Utc::now();
        let mut device = mk_device(now - Duration::days(40));
        assert!(device.is_stale(now, Duration::days(30)));
        device.touch(now - Duration::days(1));
        assert!(!device.is_stale(now, Duration::days(30)));
    }
}
