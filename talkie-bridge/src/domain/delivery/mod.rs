pub mod value_object;

pub use value_object::{
    AudioClip, DeliveryMode, DeliveryOutcome, DeliveryPayload, ModeReason, VerificationResult,
};
