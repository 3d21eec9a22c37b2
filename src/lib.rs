//! Realtime transcription client with provider fallback.
//!
//! [`RealtimeClient`] drives one session against the backend's streaming
//! service. [`SpeechService`] sits on top, choosing between that service, an
//! on-device recognizer and no transcription at all, and falling back when
//! the primary provider fails.

pub mod backend;
pub mod cli;
pub mod config;
pub mod events;
pub mod speech;
pub mod state_machine;
pub mod streaming;

pub use backend::{BackendClient, BackendError};
pub use config::{ClientConfig, ServiceConfig, Settings};
pub use events::{EventReceiver, SessionEvent};
pub use speech::{check_speech_support, Provider, SpeechService, SpeechSupport};
pub use state_machine::SessionStatus;
pub use streaming::{RealtimeClient, Session, TranscriptSegment};

use clap::Parser;

/// Entry point for the `live-transcribe` binary.
pub fn run() {
    let args = cli::CliArgs::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();

    // Both rustls backends end up in the tree; pick one for the live channel
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(cli::run(args)) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
