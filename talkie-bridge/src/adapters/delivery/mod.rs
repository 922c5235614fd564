pub mod claude_cli;
pub mod screen_lock;
pub mod ui_http;

pub use claude_cli::ClaudeCliInvoker;
pub use screen_lock::{IoregScreenLockProbe, NeverLocked};
pub use ui_http::HttpUiAutomationClient;
