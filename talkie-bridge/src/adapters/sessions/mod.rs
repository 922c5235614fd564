pub mod agent_probe;
pub mod fs_store;

pub use agent_probe::{PgrepAgentProbe, StaticAgentProbe};
pub use fs_store::FsSessionStore;
