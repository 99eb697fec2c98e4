use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which sources the capture service polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    File,
    Clipboard,
    Ocr,
    Hybrid,
}

impl CaptureStrategy {
    pub fn watches_files(self) -> bool {
        matches!(self, Self::File | Self::Hybrid)
    }

    pub fn watches_clipboard(self) -> bool {
        matches!(self, Self::Clipboard | Self::Hybrid)
    }

    pub fn wants_ocr(self) -> bool {
        matches!(self, Self::Ocr | Self::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Clipboard => "clipboard",
            Self::Ocr => "ocr",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screen region used by OCR capture, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrParams {
    #[serde(default = "default_ocr_language")]
    pub language: String,
    #[serde(default = "default_ocr_interval_ms")]
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<ScreenRegion>,
}

impl Default for OcrParams {
    fn default() -> Self {
        Self {
            language: default_ocr_language(),
            interval_ms: default_ocr_interval_ms(),
            region: None,
        }
    }
}

fn default_ocr_language() -> String {
    "eng".into()
}

fn default_ocr_interval_ms() -> u64 {
    2000
}

/// Capture strategy and source locations. Owned by the service that is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_strategy")]
    pub strategy: CaptureStrategy,
    #[serde(default = "default_watch_root")]
    pub watch_root: PathBuf,
    #[serde(default = "default_response_filename")]
    pub response_filename: String,
    #[serde(default = "default_clipboard_poll_interval_ms")]
    pub clipboard_poll_interval_ms: u64,
    #[serde(default)]
    pub ocr: OcrParams,
}

impl CaptureConfig {
    pub fn new(watch_root: impl Into<PathBuf>) -> Self {
        Self {
            watch_root: watch_root.into(),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: CaptureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_response_filename(mut self, name: impl Into<String>) -> Self {
        self.response_filename = name.into();
        self
    }

    pub fn with_clipboard_poll_interval_ms(mut self, ms: u64) -> Self {
        self.clipboard_poll_interval_ms = ms;
        self
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            watch_root: default_watch_root(),
            response_filename: default_response_filename(),
            clipboard_poll_interval_ms: default_clipboard_poll_interval_ms(),
            ocr: OcrParams::default(),
        }
    }
}

fn default_strategy() -> CaptureStrategy {
    CaptureStrategy::File
}

fn default_watch_root() -> PathBuf {
    PathBuf::from("agent_workspaces")
}

fn default_response_filename() -> String {
    "response.txt".into()
}

fn default_clipboard_poll_interval_ms() -> u64 {
    500
}

/// Where a captured response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    File,
    Clipboard,
    Ocr,
    Manual,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Clipboard => "clipboard",
            Self::Ocr => "ocr",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "clipboard" => Ok(Self::Clipboard),
            "ocr" => Ok(Self::Ocr),
            "manual" => Ok(Self::Manual),
            other => Err(CoreError::Parse(format!(
                "unknown response source '{other}' (expected file, clipboard, ocr or manual)"
            ))),
        }
    }
}

/// A single captured unit of agent output. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub agent_id: String,
    pub content: String,
    pub source: ResponseSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl CapturedResponse {
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>, source: ResponseSource) -> Self {
        Self {
            agent_id: agent_id.into(),
            content: content.into(),
            source,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Capture time as fractional seconds since the Unix epoch.
    pub fn epoch_seconds(&self) -> f64 {
        self.timestamp.timestamp_millis() as f64 / 1000.0
    }
}

/// Lifecycle of the capture service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Idle,
    Monitoring,
    Capturing,
    Error,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Monitoring => "monitoring",
            Self::Capturing => "capturing",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view returned by `get_status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureStatusReport {
    pub status: CaptureStatus,
    pub monitoring: bool,
    pub watched_files: usize,
    pub handlers: usize,
    pub strategy: CaptureStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_source_selection() {
        assert!(CaptureStrategy::File.watches_files());
        assert!(!CaptureStrategy::File.watches_clipboard());
        assert!(CaptureStrategy::Hybrid.watches_files());
        assert!(CaptureStrategy::Hybrid.watches_clipboard());
        assert!(!CaptureStrategy::Clipboard.watches_files());
        assert!(CaptureStrategy::Ocr.wants_ocr());
    }

    #[test]
    fn test_response_source_parse() {
        assert_eq!("manual".parse::<ResponseSource>().unwrap(), ResponseSource::Manual);
        assert_eq!(" Clipboard ".parse::<ResponseSource>().unwrap(), ResponseSource::Clipboard);
        assert!("carrier-pigeon".parse::<ResponseSource>().is_err());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{"strategy":"hybrid","watch_root":"/tmp/agents"}"#).unwrap();
        assert_eq!(config.strategy, CaptureStrategy::Hybrid);
        assert_eq!(config.response_filename, "response.txt");
        assert_eq!(config.clipboard_poll_interval_ms, 500);
        assert_eq!(config.ocr.language, "eng");
    }

    #[test]
    fn test_captured_response_metadata_and_epoch() {
        let response = CapturedResponse::new("Agent-1", "done", ResponseSource::File)
            .with_metadata("path", "/tmp/Agent-1/response.txt");
        assert_eq!(response.metadata["path"], "/tmp/Agent-1/response.txt");
        assert!(response.epoch_seconds() > 1_600_000_000.0);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["source"], "file");
    }
}
