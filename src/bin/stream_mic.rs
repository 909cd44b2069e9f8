//! Stream microphone (or WAV file) audio to a recognition endpoint.
//!
//! ```text
//! stream-mic --endpoint ws://192.168.10.24/ [--device NAME] [--wav FILE]
//! ```
//!
//! Runs until Ctrl-C; utterance boundaries are forwarded as `stopRecognize`
//! control frames. Set `RUST_LOG=debug` to watch the segmentation.

use std::path::PathBuf;

use voxwire::{Session, SessionConfig, SourceFactory, WavSource};

fn main() {
    if let Err(e) = run() {
        eprintln!("stream-mic failed: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct Args {
    endpoint: String,
    device: Option<String>,
    wav: Option<PathBuf>,
    threshold: Option<i32>,
}

fn parse_args() -> Result<Args, String> {
    let mut endpoint: Option<String> = None;
    let mut device: Option<String> = None;
    let mut wav: Option<PathBuf> = None;
    let mut threshold: Option<i32> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--endpoint" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --endpoint".into());
                };
                endpoint = Some(v);
            }
            "--device" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --device".into());
                };
                device = Some(v);
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                wav = Some(PathBuf::from(v));
            }
            "--threshold" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --threshold".into());
                };
                threshold = Some(v.parse().map_err(|_| "invalid --threshold value")?);
            }
            "--help" | "-h" => {
                println!(
                    "usage: stream-mic --endpoint ws://HOST[:PORT]/ \
                     [--device NAME] [--wav FILE] [--threshold N]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        endpoint: endpoint.ok_or("--endpoint is required")?,
        device,
        wav,
        threshold,
    })
}

fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let mut config = SessionConfig::new(args.endpoint.clone());
    if let Some(threshold) = args.threshold {
        config.recorder.amplitude_threshold = threshold;
    }

    let factory: SourceFactory = match args.wav {
        Some(path) => {
            let source = WavSource::from_path(&path).map_err(|e| e.to_string())?;
            // A WAV source only speaks its native rate.
            config.recorder.sample_rate_candidates = vec![source.sample_rate()];
            Box::new(move || Box::new(source))
        }
        None => mic_factory(args.device)?,
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let session = Session::start(config, factory, runtime.handle().clone())
        .map_err(|e| e.to_string())?;

    println!(
        "streaming at {} Hz to {} — press Ctrl-C to stop",
        session.sample_rate(),
        args.endpoint
    );
    runtime
        .block_on(tokio::signal::ctrl_c())
        .map_err(|e| e.to_string())?;

    session.stop();
    Ok(())
}

#[cfg(feature = "audio-cpal")]
fn mic_factory(device: Option<String>) -> Result<SourceFactory, String> {
    use voxwire::CpalSource;
    Ok(Box::new(move || {
        Box::new(CpalSource::with_preference(device))
    }))
}

#[cfg(not(feature = "audio-cpal"))]
fn mic_factory(_device: Option<String>) -> Result<SourceFactory, String> {
    Err("compiled without the audio-cpal feature; use --wav".into())
}
