use super::aggregate::DeviceStatus;
use super::value_object::DeviceId;
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceDomainEvent {
    PairingRequested { name: String },
    StatusChanged { status: DeviceStatus },
    Revoked,
    Pruned,
}

impl DeviceDomainEvent {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceDomainEvent::PairingRequested { .. } => "requested",
            DeviceDomainEvent::StatusChanged { status } => status.as_str(),
            DeviceDomainEvent::Revoked => "revoked",
            DeviceDomainEvent::Pruned => "pruned",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEventEnvelope {
    pub device_id: DeviceId,
    pub occurred_at: DateTime<Utc>,
    pub event: DeviceDomainEvent,
}

impl DeviceEventEnvelope {
    pub fn new(device_id: DeviceId, event: DeviceDomainEvent) -> Self {
        Self {
            device_id,
            occurred_at: Utc::now(),
            event,
        }
    }
}
