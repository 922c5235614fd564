pub mod router;
pub mod verifier;

pub use router::{DeliveryConfig, DeliveryError, DeliveryResult, DeliveryRouter};
pub use verifier::{TranscriptVerifier, VerifyConfig};
