//! Response capture: polls agent response files and the clipboard, and fans
//! every new response out to registered handlers.

pub mod classify;
pub mod error;
pub mod handler;
pub mod service;
pub mod source;

pub use classify::looks_like_agent_response;
pub use error::CaptureError;
pub use handler::{dispatch, DispatchOutcome, JsonlArchiveHandler, LogHandler, ResponseHandler};
pub use service::{ResponseCaptureService, CLIPBOARD_AGENT_ID};
pub use source::{system_clipboard, ClipboardFactory, ClipboardSource};
