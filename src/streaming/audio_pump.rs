//! Audio capture bridge
//!
//! Re-chunks raw PCM arriving over a channel into fixed-duration buffers and
//! hands them to a sink.
//!
//! # Architecture
//!
//! ```text
//! Producer (file reader, capture thread)     Tokio Runtime
//! ┌────────────────────┐                    ┌────────────────────┐
//! │ tx.send(bytes)     │──────channel────▶  │ AudioPump::run()   │
//! └────────────────────┘                    │   ├─ accumulate     │
//!                                           │   ├─ chunk (100ms)  │
//!                                           │   └─ sink.send_audio│
//!                                           └────────────────────┘
//! ```

use tokio::sync::mpsc;

/// Anything that accepts audio buffers without blocking.
pub trait AudioSink {
    fn send_audio(&self, buffer: Vec<u8>);
}

impl AudioSink for super::RealtimeClient {
    fn send_audio(&self, buffer: Vec<u8>) {
        super::RealtimeClient::send_audio(self, buffer);
    }
}

/// Chunking parameters for 16-bit mono PCM
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub sample_rate: u32,
    /// Chunk duration in milliseconds (100ms matches the capture cadence)
    pub chunk_duration_ms: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_duration_ms: 100,
        }
    }
}

impl PumpConfig {
    /// Bytes per chunk (2 bytes per sample)
    pub fn bytes_per_chunk(&self) -> usize {
        (self.sample_rate as usize * self.chunk_duration_ms as usize / 1000 * 2).max(2)
    }
}

/// Moves bytes from a channel into a sink in chunk-sized buffers.
pub struct AudioPump {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    bytes_per_chunk: usize,
    chunks_sent: u64,
}

impl AudioPump {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, config: PumpConfig) -> Self {
        let bytes_per_chunk = config.bytes_per_chunk();
        log::info!(
            "AudioPump: initialized ({}Hz, {}ms chunks = {} bytes)",
            config.sample_rate,
            config.chunk_duration_ms,
            bytes_per_chunk
        );

        Self {
            rx,
            buffer: Vec::with_capacity(bytes_per_chunk * 2),
            bytes_per_chunk,
            chunks_sent: 0,
        }
    }

    /// Run until the producer closes the channel.
    ///
    /// The final partial chunk is flushed. Returns the number of chunks sent.
    pub async fn run<S: AudioSink + ?Sized>(mut self, sink: &S) -> u64 {
        while let Some(bytes) = self.rx.recv().await {
            self.buffer.extend_from_slice(&bytes);
            while self.buffer.len() >= self.bytes_per_chunk {
                self.send_chunk(sink);
            }
        }

        if !self.buffer.is_empty() {
            log::debug!(
                "AudioPump: sending final partial chunk ({} bytes)",
                self.buffer.len()
            );
            self.send_chunk(sink);
        }

        log::info!("AudioPump: input closed, {} chunks sent", self.chunks_sent);
        self.chunks_sent
    }

    fn send_chunk<S: AudioSink + ?Sized>(&mut self, sink: &S) {
        let size = self.buffer.len().min(self.bytes_per_chunk);
        let chunk: Vec<u8> = self.buffer.drain(..size).collect();
        sink.send_audio(chunk);

        self.chunks_sent += 1;
        // Every 50 chunks = ~5 seconds
        if self.chunks_sent % 50 == 0 {
            log::debug!("AudioPump: sent {} chunks", self.chunks_sent);
        }
    }
}
