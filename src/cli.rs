use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::config::{load_settings, ClientConfig, Settings};
use crate::events::{EventReceiver, SessionEvent};
use crate::speech::{Provider, SpeechService};
use crate::streaming::{AudioPump, PumpConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "live-transcribe",
    about = "Stream a raw PCM recording through the transcription service"
)]
pub struct CliArgs {
    /// Raw 16-bit little-endian mono PCM at 16 kHz
    pub input: PathBuf,

    /// Preferred provider: primary-streaming, secondary-local or none
    #[arg(long)]
    pub provider: Option<Provider>,

    /// Session topic (defaults to a timestamped label)
    #[arg(long)]
    pub topic: Option<String>,

    /// Settings file (JSON); DISCUSSION_API is used when absent
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Meeting id sent with task creation
    #[arg(long)]
    pub meeting_id: Option<String>,

    /// Send audio at capture speed instead of as fast as possible
    #[arg(long)]
    pub realtime: bool,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    pub debug: bool,
}

fn settings_for(args: &CliArgs) -> Settings {
    let mut settings = match &args.config {
        Some(path) => load_settings(path),
        None => Settings {
            client: ClientConfig::from_env(),
            ..Default::default()
        },
    };

    if args.provider.is_some() {
        settings.service.preferred_provider = args.provider;
    }
    settings
}

pub async fn run(args: CliArgs) -> Result<(), String> {
    let settings = settings_for(&args);
    let grace = settings.client.stop_grace();
    let meeting_id = args
        .meeting_id
        .clone()
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4().simple()));

    log::info!(
        "Streaming {:?} to {} as {}",
        args.input,
        settings.client.base_url,
        meeting_id
    );

    let (service, events) = SpeechService::spawn(meeting_id, settings, None)
        .map_err(|e| format!("Failed to create speech service: {}", e))?;
    let printer = tokio::spawn(print_events(events));

    let provider = service.initialize().await;
    println!("Provider: {}", provider.display_name());

    if !service.start(args.topic.as_deref()).await {
        service.stop().await;
        return Err("No transcription provider could be started".to_string());
    }

    let pump_config = PumpConfig::default();
    let (tx, rx) = mpsc::channel(16);
    let reader = tokio::spawn(read_pcm(
        args.input.clone(),
        pump_config.bytes_per_chunk(),
        args.realtime.then(|| Duration::from_millis(pump_config.chunk_duration_ms as u64)),
        tx,
    ));

    let chunks = AudioPump::new(rx, pump_config).run(&service).await;
    let read = reader
        .await
        .map_err(|e| format!("Reader task failed: {}", e))?;

    service.stop().await;
    // Results still arrive during the stop grace period
    tokio::time::sleep(grace + Duration::from_millis(200)).await;
    drop(service);

    let segments = printer.await.unwrap_or(0);
    read?;
    log::info!("Done: {} chunks sent, {} segments received", chunks, segments);
    Ok(())
}

async fn read_pcm(
    path: PathBuf,
    chunk_bytes: usize,
    pace: Option<Duration>,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), String> {
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| format!("Failed to open {}: {}", display(&path), e))?;
    let mut ticker = pace.map(tokio::time::interval);

    loop {
        let mut buf = vec![0u8; chunk_bytes];
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| format!("Failed to read {}: {}", display(&path), e))?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);

        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        if tx.send(buf).await.is_err() {
            return Ok(());
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Print events until the service goes away. Returns the segment count.
async fn print_events(mut events: EventReceiver) -> usize {
    let mut segments = 0;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Segment(segment) => {
                segments += 1;
                println!(
                    "[{:>7.1}s] {}",
                    segment.start_ms as f64 / 1000.0,
                    segment.text
                );
            }
            SessionEvent::Interim { text, .. } => log::debug!("... {}", text),
            SessionEvent::Error(message) => eprintln!("error: {}", message),
            SessionEvent::Status(status) => log::info!("Status: {}", status),
            SessionEvent::ProviderChanged(provider) => {
                log::info!("Provider: {}", provider.display_name())
            }
            SessionEvent::Started
            | SessionEvent::SegmentBegin
            | SessionEvent::InterimCleared
            | SessionEvent::Completed => {
                log::debug!("{:?}", event)
            }
        }
    }

    segments
}
