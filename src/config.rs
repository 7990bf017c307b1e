//! Configuration loading and types for blobio.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every section is optional; missing values fall back to
//! the defaults below. Loaded files are validated with `garde`.

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::message::MessageFlags;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Config {
    /// Structured message codec settings.
    #[serde(default)]
    #[garde(dive)]
    pub codec: CodecConfig,

    /// Seekable channel settings.
    #[serde(default)]
    #[garde(dive)]
    pub channel: ChannelConfig,

    /// Legacy stream settings.
    #[serde(default)]
    #[garde(dive)]
    pub stream: StreamConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    #[garde(dive)]
    pub observability: ObservabilityConfig,
}

/// Which checksum the encoder writes and the decoder expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    #[default]
    Crc64,
    None,
}

impl ChecksumMode {
    pub fn flags(self) -> MessageFlags {
        match self {
            ChecksumMode::Crc64 => MessageFlags::STORAGE_CRC64,
            ChecksumMode::None => MessageFlags::NONE,
        }
    }
}

/// Structured message codec configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CodecConfig {
    /// Maximum content bytes per segment.
    #[serde(default = "default_segment_size")]
    #[garde(range(min = 1))]
    pub segment_size: u64,

    #[serde(default)]
    #[garde(skip)]
    pub checksum: ChecksumMode,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            checksum: ChecksumMode::default(),
        }
    }
}

/// Seekable channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChannelConfig {
    /// Size of the channel's internal buffer in bytes.
    #[serde(default = "default_chunk_size")]
    #[garde(range(min = 1))]
    pub chunk_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Legacy stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StreamConfig {
    /// Bytes fetched per range request by the input stream.
    #[serde(default = "default_chunk_size")]
    #[garde(range(min = 1))]
    pub chunk_size: usize,

    /// Bytes buffered by the output stream before each upload.
    #[serde(default = "default_chunk_size")]
    #[garde(range(min = 1))]
    pub write_threshold: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            write_threshold: default_chunk_size(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(length(min = 1))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default)]
    #[garde(skip)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder for the codec counters.
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_segment_size() -> u64 {
    4 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Load, parse, and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.codec.segment_size, 4 * 1024 * 1024);
        assert_eq!(config.codec.checksum, ChecksumMode::Crc64);
        assert_eq!(config.channel.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.stream.write_threshold, 4 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.observability.metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.codec.segment_size, default_segment_size());
        assert_eq!(config.stream.chunk_size, default_chunk_size());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
codec:
  segment_size: 512
  checksum: none
logging:
  format: json
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.codec.segment_size, 512);
        assert_eq!(config.codec.checksum.flags(), MessageFlags::NONE);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.channel.chunk_size, default_chunk_size());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(parse_config("codec: { segment_size: 0 }").is_err());
        assert!(parse_config("channel: { chunk_size: 0 }").is_err());
        assert!(parse_config("stream: { write_threshold: 0 }").is_err());
    }

    #[test]
    fn test_unknown_checksum_rejected() {
        assert!(parse_config("codec: { checksum: md5 }").is_err());
    }

    #[test]
    fn test_crc64_flags() {
        assert_eq!(ChecksumMode::Crc64.flags(), MessageFlags::STORAGE_CRC64);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stream:\n  chunk_size: 64\n  write_threshold: 32").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stream.chunk_size, 64);
        assert_eq!(config.stream.write_threshold, 32);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config("/nonexistent/blobio.yaml").is_err());
    }
}
