pub mod service;

pub use service::{
    ApprovalPolicy, DeviceCounts, PairOutcome, PairingError, PairingService,
    DEFAULT_DEVICE_TTL_DAYS,
};
