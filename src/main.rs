//! blobio -- structured message encode/decode tool.
//!
//! Files are read and written through seekable storage channels, so the
//! command line exercises the same buffered paths as a remote transfer.

use std::io;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use blobio::channel::{FileResource, StorageSeekableByteChannel};
use blobio::config::{Config, LogFormat};
use blobio::message::{MessageFlags, StructuredMessageDecoder, StructuredMessageEncoder};

/// Command-line arguments for blobio.
#[derive(Parser, Debug)]
#[command(
    name = "blobio",
    version,
    about = "Structured message codec for blob transfers"
)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr before exiting.
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wrap a file's content in a structured message.
    Encode {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Verify a structured message and write out its content.
    Decode {
        input: PathBuf,
        output: PathBuf,
        /// Content length the message was encoded with.
        #[arg(long)]
        content_length: u64,
        #[command(flatten)]
        codec: CodecArgs,
    },
    /// Verify a structured message and print a JSON summary.
    Inspect {
        input: PathBuf,
        /// Content length the message was encoded with.
        #[arg(long)]
        content_length: u64,
        #[command(flatten)]
        codec: CodecArgs,
    },
}

#[derive(Args, Debug)]
struct CodecArgs {
    /// Override the configured segment size.
    #[arg(long)]
    segment_size: Option<u64>,

    /// Do not write or expect CRC64 checksums.
    #[arg(long)]
    no_crc: bool,
}

impl CodecArgs {
    fn resolve(&self, config: &Config) -> (u64, MessageFlags) {
        let segment_size = self.segment_size.unwrap_or(config.codec.segment_size);
        let flags = if self.no_crc {
            MessageFlags::NONE
        } else {
            config.codec.checksum.flags()
        };
        (segment_size, flags)
    }
}

/// Summary printed by `inspect`.
#[derive(Serialize)]
struct InspectReport {
    message_length: u64,
    content_length: u64,
    segment_count: u16,
    segment_crc64s: Vec<SegmentReport>,
    message_crc64: Option<String>,
}

#[derive(Serialize)]
struct SegmentReport {
    segment: u16,
    crc64: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => blobio::config::load_config(path)?,
        None => Config::default(),
    };
    init_logging(&config);

    if config.observability.metrics || cli.print_metrics {
        blobio::metrics::init_metrics()?;
        blobio::metrics::describe_metrics();
    }

    match &cli.command {
        Command::Encode {
            input,
            output,
            codec,
        } => {
            let (segment_size, flags) = codec.resolve(&config);
            encode(&config, input, output, segment_size, flags)?;
        }
        Command::Decode {
            input,
            output,
            content_length,
            codec,
        } => {
            let (segment_size, flags) = codec.resolve(&config);
            let mut out = StorageSeekableByteChannel::open_write(
                config.channel.chunk_size,
                Box::new(FileResource::create(output)?),
            )?;
            decode(&config, input, *content_length, segment_size, flags, |chunk| {
                out.write_all(chunk)
            })?;
            out.close()?;
            info!(output = %output.display(), bytes = *content_length, "content written");
        }
        Command::Inspect {
            input,
            content_length,
            codec,
        } => {
            let (segment_size, flags) = codec.resolve(&config);
            let decoder = decode(&config, input, *content_length, segment_size, flags, |_| {
                Ok(())
            })?;
            let report = InspectReport {
                message_length: decoder.message_length(),
                content_length: *content_length,
                segment_count: decoder.layout().num_segments(),
                segment_crc64s: decoder
                    .segment_crc64s()
                    .iter()
                    .map(|(&segment, crc)| SegmentReport {
                        segment,
                        crc64: hex::encode(crc.to_le_bytes()),
                    })
                    .collect(),
                message_crc64: decoder.message_crc64().map(|crc| hex::encode(crc.to_le_bytes())),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if cli.print_metrics {
        if let Some(text) = blobio::metrics::render() {
            eprint!("{text}");
        }
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn encode(
    config: &Config,
    input: &Path,
    output: &Path,
    segment_size: u64,
    flags: MessageFlags,
) -> anyhow::Result<()> {
    let source = FileResource::open(input)?;
    let mut reader =
        StorageSeekableByteChannel::open_read(config.channel.chunk_size, Box::new(source))?;
    let content_length = reader.size()?;

    let mut encoder = StructuredMessageEncoder::new(&mut reader, content_length, segment_size, flags)?;
    let mut out = StorageSeekableByteChannel::open_write(
        config.channel.chunk_size,
        Box::new(FileResource::create(output)?),
    )?;
    let copied = io::copy(&mut encoder, &mut out)?;
    out.close()?;

    info!(
        input = %input.display(),
        output = %output.display(),
        content_length,
        message_length = copied,
        segments = encoder.layout().num_segments(),
        "message encoded"
    );
    Ok(())
}

/// Stream `input` through a decoder, handing each decoded chunk to `sink`.
fn decode<F>(
    config: &Config,
    input: &Path,
    content_length: u64,
    segment_size: u64,
    flags: MessageFlags,
    mut sink: F,
) -> anyhow::Result<StructuredMessageDecoder>
where
    F: FnMut(&[u8]) -> blobio::Result<()>,
{
    let mut reader = StorageSeekableByteChannel::open_read(
        config.channel.chunk_size,
        Box::new(FileResource::open(input)?),
    )?;
    let mut decoder = StructuredMessageDecoder::new(content_length, segment_size, flags)?;
    let mut wire = vec![0u8; config.channel.chunk_size.min(1 << 20)];
    let mut content = BytesMut::new();
    loop {
        let n = reader.read(&mut wire)?;
        if n == 0 {
            break;
        }
        decoder.decode_into(&wire[..n], &mut content)?;
        sink(&content[..])?;
        content.clear();
    }
    decoder.finish()?;
    info!(
        input = %input.display(),
        content_length,
        segments = decoder.layout().num_segments(),
        "message verified"
    );
    Ok(decoder)
}
