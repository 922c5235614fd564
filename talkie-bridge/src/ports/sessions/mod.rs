pub mod source;

pub use source::{AgentProcessProbe, SessionSource};
