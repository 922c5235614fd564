pub mod service;

pub use service::{MatchService, MatchServiceError, MatchServiceResult};
