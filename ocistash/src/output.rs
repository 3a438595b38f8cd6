//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use ocistash_core::{Descriptor, DescriptorExt};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error chain directly.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for the `add` commands.
#[derive(Debug, Serialize)]
pub struct AddOutput {
    pub success: bool,
    pub result_code: u8,
    pub kind: String,
    pub reference: String,
    pub digest: String,
    pub media_type: String,
    pub size: u64,
}

/// One stored reference.
#[derive(Debug, Clone, Serialize)]
pub struct RefInfo {
    pub name: String,
    pub digest: String,
    pub media_type: String,
    /// Empty when the manifest carries no config.
    pub config_media_type: String,
    pub size: u64,
}

impl RefInfo {
    pub fn new(name: String, desc: &Descriptor, config_media_type: String) -> Self {
        Self {
            name,
            digest: desc.digest().clone(),
            media_type: desc.media_type_str(),
            config_media_type,
            size: desc.content_size(),
        }
    }
}

/// Output for `ls` command.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub refs: Vec<RefInfo>,
}

/// Output for `info` command.
#[derive(Debug, Serialize)]
pub struct InfoOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub reference: RefInfo,
    pub layers: Vec<Descriptor>,
}

/// A reference copied by `copy`.
#[derive(Debug, Clone, Serialize)]
pub struct CopiedRef {
    pub from: String,
    pub to: String,
}

/// Output for `copy` command.
#[derive(Debug, Serialize)]
pub struct CopyOutput {
    pub success: bool,
    pub result_code: u8,
    pub target: String,
    pub copied: Vec<CopiedRef>,
}

/// Output for `pull` command.
#[derive(Debug, Serialize)]
pub struct PullOutput {
    pub success: bool,
    pub result_code: u8,
    pub remote: String,
    pub reference: String,
    pub digest: String,
    pub size: u64,
}

/// Output for `extract` command.
#[derive(Debug, Serialize)]
pub struct ExtractOutput {
    pub success: bool,
    pub result_code: u8,
    pub reference: String,
    pub files: Vec<String>,
}

/// Output for `flush` command.
#[derive(Debug, Serialize)]
pub struct FlushOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
}

/// Output for `gc` command.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub blobs_deleted: usize,
    pub bytes_freed: u64,
}
