mod clipboard;
mod file;

pub use clipboard::{system_clipboard, ClipboardFactory, ClipboardSource, ClipboardWatch};
#[cfg(feature = "clipboard")]
pub use clipboard::SystemClipboard;
pub use file::{
    acknowledge, agent_id_for, claim, discover_response_files, modified_time, ClaimedResponse,
    WatchedFile,
};

#[cfg(test)]
pub(crate) use clipboard::testing;
