pub mod aggregate;
pub mod events;
pub mod value_object;

pub use aggregate::{Device, DeviceStatus, TransitionError};
pub use events::{DeviceDomainEvent, DeviceEventEnvelope};
pub use value_object::{DeviceId, DevicePublicKey};
