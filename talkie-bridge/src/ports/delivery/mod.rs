pub mod headless_port;
pub mod screen_lock;
pub mod ui_port;

pub use headless_port::{HeadlessError, HeadlessInvoker, HeadlessReply, HeadlessRequest};
pub use screen_lock::ScreenLockProbe;
pub use ui_port::{ForwardRequest, UiAutomationPort, UiForwardError};
