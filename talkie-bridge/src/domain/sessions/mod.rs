pub mod aggregate;

pub use aggregate::{Session, LIVENESS_WINDOW_MINUTES};
