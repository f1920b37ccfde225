//! wavefetch CLI: fetch a remote audio stream as decoder-ready bytes
//!
//! Writes the shaped stream (ICY metadata stripped, MP4 `moov` moved to the
//! front) to a file or stdout and reports source events on stderr.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wavefetch::config::network::CONNECTIVITY_INTERVAL_SECS;
use wavefetch::{
    reachability_target, RemoteAudioSource, SourceConfig, SourceError, SourceEvent, SourceReader,
};

#[derive(Parser)]
#[command(
    name = "wavefetch",
    about = "Fetch a remote audio stream as decoder-ready bytes",
    version
)]
struct Cli {
    /// Stream or file URL
    url: String,

    /// Write the stream to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Start at this byte offset
    #[arg(long, value_name = "OFFSET", default_value_t = 0)]
    seek: u64,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Stream MP4 files as they are, without moving `moov` to the front
    #[arg(long)]
    no_mp4_optimize: bool,

    /// Give up when the server sends nothing for this many seconds
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    timeout: u64,

    /// Check reachability against HOST:PORT (default: the stream's server)
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "no_connectivity_check")]
    connectivity_target: Option<String>,

    /// Assume the network is always up; retry failures on backoff alone
    #[arg(long)]
    no_connectivity_check: bool,

    /// Stop after writing this many bytes (live streams never end)
    #[arg(long, value_name = "BYTES")]
    max_bytes: Option<u64>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// What the writer thread hands back
struct Transfer {
    out: Box<dyn Write + Send>,
    written: u64,
    result: io::Result<()>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout may be carrying the stream.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wavefetch=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    let mut out: Box<dyn Write + Send> = match cli.output {
        Some(ref path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let mut optimize = !cli.no_mp4_optimize;

    loop {
        let source = RemoteAudioSource::new(cli.url.as_str(), build_config(&cli, optimize))?;
        if cli.seek > 0 {
            source.seek(cli.seek)?;
        } else {
            source.play()?;
        }

        let (done_tx, done_rx) = bounded(1);
        let writer = spawn_writer(source.reader(), out, cli.max_bytes, done_tx)?;
        let failure = watch(&source, &done_rx, cli.json);
        source.close();
        let transfer = writer
            .join()
            .map_err(|_| io::Error::other("writer thread panicked"))?;
        out = transfer.out;

        match failure {
            // Nothing written yet: the file can still be streamed as is.
            Some(SourceError::Prepare(e)) if optimize && transfer.written == 0 => {
                warn!(error = %e, "cannot restructure MP4, streaming it unmodified");
                optimize = false;
            }
            Some(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            None => {
                transfer.result?;
                info!(bytes = transfer.written, "done");
                return Ok(());
            }
        }
    }
}

fn build_config(cli: &Cli, optimize: bool) -> SourceConfig {
    let mut config = SourceConfig::new()
        .with_read_timeout(Duration::from_secs(cli.timeout))
        .with_mp4_optimization(optimize);
    for (name, value) in &cli.headers {
        config = config.with_header(name.as_str(), value.as_str());
    }
    if !cli.no_connectivity_check {
        let target = cli
            .connectivity_target
            .clone()
            .or_else(|| reachability_target(&cli.url));
        if let Some(target) = target {
            config = config.with_connectivity_check(
                target,
                Duration::from_secs(CONNECTIVITY_INTERVAL_SECS),
            );
        }
    }
    config
}

fn spawn_writer(
    mut reader: SourceReader,
    mut out: Box<dyn Write + Send>,
    limit: Option<u64>,
    done: Sender<()>,
) -> io::Result<JoinHandle<Transfer>> {
    thread::Builder::new()
        .name("writer".to_string())
        .spawn(move || {
            let mut written = 0;
            let result = copy_stream(&mut reader, &mut out, limit, &mut written);
            let _ = done.send(());
            Transfer {
                out,
                written,
                result,
            }
        })
}

fn copy_stream(
    reader: &mut impl Read,
    out: &mut impl Write,
    limit: Option<u64>,
    written: &mut u64,
) -> io::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let want = match limit {
            Some(limit) => limit.saturating_sub(*written).min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        if want == 0 {
            break;
        }
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        *written += n as u64;
    }
    out.flush()
}

/// Report events until the writer finishes; returns a terminal error.
fn watch(source: &RemoteAudioSource, done: &Receiver<()>, json: bool) -> Option<SourceError> {
    loop {
        select! {
            recv(source.events()) -> event => {
                let Ok(event) = event else {
                    return None;
                };
                report(&event, json);
                if let SourceEvent::Error(e) = event {
                    return Some(e);
                }
            }
            recv(done) -> _ => return None,
        }
    }
}

fn report(event: &SourceEvent, json: bool) {
    if json {
        let line = match event {
            SourceEvent::Ready(stream) => json!({ "event": "ready", "stream": stream }),
            SourceEvent::Metadata(block) => json!({
                "event": "metadata",
                "now_playing": block.now_playing(),
                "fields": block,
            }),
            SourceEvent::WaitingForNetwork => json!({ "event": "waiting_for_network" }),
            SourceEvent::Retrying { attempt, delay } => json!({
                "event": "retrying",
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
            }),
            SourceEvent::EndOfStream => json!({ "event": "end_of_stream" }),
            SourceEvent::Error(e) => json!({ "event": "error", "message": e.to_string() }),
        };
        eprintln!("{line}");
        return;
    }

    match event {
        SourceEvent::Ready(stream) => {
            let length = stream
                .length
                .map_or_else(|| "unknown length".to_string(), |n| format!("{n} bytes"));
            eprintln!(
                "Streaming {:?}, {}{}{}",
                stream.audio_type,
                length,
                if stream.seekable { ", seekable" } else { "" },
                if stream.restructured {
                    ", moov relocated"
                } else {
                    ""
                },
            );
            if let Some(ref name) = stream.station_name {
                eprintln!("Station: {name}");
            }
        }
        SourceEvent::Metadata(block) => {
            if let Some(now) = block.now_playing() {
                match (now.artist, now.title) {
                    (Some(artist), Some(title)) => eprintln!("Now playing: {artist} - {title}"),
                    (None, Some(title)) | (Some(title), None) => eprintln!("Now playing: {title}"),
                    (None, None) => {}
                }
            }
        }
        SourceEvent::WaitingForNetwork => eprintln!("Offline, waiting for network..."),
        SourceEvent::Retrying { attempt, delay } => {
            eprintln!("Connection lost, retry {attempt} in {}s", delay.as_secs_f32())
        }
        SourceEvent::EndOfStream => eprintln!("End of stream"),
        SourceEvent::Error(e) => eprintln!("Stream error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_argument_splits_on_first_colon() {
        assert_eq!(
            parse_header("Authorization: Bearer a:b").unwrap(),
            ("Authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn copy_honours_byte_limit() {
        let data = vec![7u8; 200_000];
        let mut out = Vec::new();
        let mut written = 0;
        copy_stream(&mut data.as_slice(), &mut out, Some(100_001), &mut written).unwrap();
        assert_eq!(written, 100_001);
        assert_eq!(out.len(), 100_001);
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "wavefetch",
            "http://radio.test/a.mp3",
            "-H",
            "X-Token: 1",
            "--seek",
            "500",
            "--json",
            "--no-mp4-optimize",
        ]);
        assert_eq!(cli.headers, vec![("X-Token".to_string(), "1".to_string())]);
        assert_eq!(cli.seek, 500);
        assert!(cli.json && cli.no_mp4_optimize);
        assert_eq!(cli.timeout, 60);
        let config = build_config(&cli, false);
        assert!(!config.optimize_mp4);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn connectivity_defaults_to_stream_server() {
        let cli = Cli::parse_from(["wavefetch", "http://radio.test:8000/live"]);
        let config = build_config(&cli, true);
        assert_eq!(config.connectivity_target.as_deref(), Some("radio.test:8000"));

        let cli = Cli::parse_from([
            "wavefetch",
            "http://radio.test/live",
            "--connectivity-target",
            "1.1.1.1:443",
        ]);
        assert_eq!(
            build_config(&cli, true).connectivity_target.as_deref(),
            Some("1.1.1.1:443")
        );

        let cli = Cli::parse_from(["wavefetch", "http://radio.test/live", "--no-connectivity-check"]);
        assert!(build_config(&cli, true).connectivity_target.is_none());
    }
}
