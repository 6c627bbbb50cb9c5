//! Per-stream receive loop: packet → decode → interleaved LE bytes → playback sink.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::play::PlaybackSink;
use super::stream_decoder::StreamDecoder;

/// Longest frame duration a stream may carry. Scratch buffers are sized for it.
pub const MAX_FRAME_DURATION_MS: u32 = 60;

/// RTP header size without CSRCs or extensions.
const PLAIN_HEADER_LEN: usize = 12;

/// One media packet handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct MediaPacket {
    pub sequence_number: u16,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    /// Offset of the payload in the raw packet (header length).
    pub payload_offset: usize,
    pub payload: Bytes,
}

impl MediaPacket {
    fn log_anomalies(&self) {
        if self.padding {
            log::debug!("seq {}: padding set", self.sequence_number);
        }
        if self.extension {
            log::debug!("seq {}: extension set", self.sequence_number);
        }
        if self.marker {
            log::debug!("seq {}: marker set", self.sequence_number);
        }
        if self.payload_offset != PLAIN_HEADER_LEN {
            log::debug!(
                "seq {}: payload offset {}",
                self.sequence_number,
                self.payload_offset
            );
        }
    }

    fn diagnostics(&self) -> String {
        format!(
            "seq={} payload={}({}) padding={} extension={} marker={}",
            self.sequence_number,
            self.payload.len(),
            self.payload_offset,
            self.padding,
            self.extension,
            self.marker
        )
    }
}

/// Blocking source of packets. `None` means the stream has ended.
pub trait PacketSource {
    fn next_packet(&mut self) -> Option<MediaPacket>;
}

impl PacketSource for mpsc::Receiver<MediaPacket> {
    fn next_packet(&mut self) -> Option<MediaPacket> {
        self.blocking_recv()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("destination holds {available} bytes, {required} required")]
pub struct ConversionError {
    pub required: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to provision stream: {0:#}")]
    Setup(anyhow::Error),

    #[error("decoded {samples} samples x {channels} channels exceeds scratch capacity {capacity}")]
    FrameTooLarge {
        samples: usize,
        channels: usize,
        capacity: usize,
    },

    #[error("pcm conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("playback write failed: {0:#}")]
    Sink(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub played: u64,
    pub dropped: u64,
}

/// Interleaved sample capacity for one frame of `frame_ms` milliseconds.
pub fn frame_capacity(sample_rate: u32, channels: usize, frame_ms: u32) -> usize {
    let per_channel = (u64::from(frame_ms) * u64::from(sample_rate) + 500) / 1000;
    per_channel as usize * channels
}

/// Write `src` as little-endian bytes into `dst`, returning the number of bytes written.
///
/// Fails without touching `dst` when it cannot hold the whole conversion.
pub fn pcm_to_le_bytes(src: &[i16], dst: &mut [u8]) -> Result<usize, ConversionError> {
    let required = src.len() * 2;
    if dst.len() < required {
        return Err(ConversionError {
            required,
            available: dst.len(),
        });
    }
    for (sample, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&sample.to_le_bytes());
    }
    Ok(required)
}

/// Fixed-capacity buffers for one inbound stream.
pub struct StreamContext {
    channels: usize,
    pcm: Box<[i16]>,
    bytes: Box<[u8]>,
}

impl StreamContext {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let capacity = frame_capacity(sample_rate, channels, MAX_FRAME_DURATION_MS);
        log::info!(
            "stream buffers: rate={} ch={} frame={}ms pcm={} bytes={}",
            sample_rate,
            channels,
            MAX_FRAME_DURATION_MS,
            capacity,
            capacity * 2
        );
        Self {
            channels,
            pcm: vec![0i16; capacity].into_boxed_slice(),
            bytes: vec![0u8; capacity * 2].into_boxed_slice(),
        }
    }

    pub fn pcm_capacity(&self) -> usize {
        self.pcm.len()
    }

    pub fn byte_capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Run the stream until the source closes.
    ///
    /// Decode failures drop the packet and continue. Oversized frames, conversion
    /// failures and sink errors stop the stream.
    pub fn run<S, D, P>(
        &mut self,
        source: &mut S,
        decoder: &mut D,
        sink: &mut P,
    ) -> Result<StreamStats, StreamError>
    where
        S: PacketSource + ?Sized,
        D: StreamDecoder + ?Sized,
        P: PlaybackSink + ?Sized,
    {
        let mut stats = StreamStats::default();

        while let Some(packet) = source.next_packet() {
            packet.log_anomalies();

            let per_channel = match decoder.decode(&packet.payload, &mut self.pcm) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("Decode err: {:#} ({})", e, packet.diagnostics());
                    stats.dropped += 1;
                    continue;
                }
            };

            let samples = per_channel * self.channels;
            if samples > self.pcm.len() {
                return Err(StreamError::FrameTooLarge {
                    samples: per_channel,
                    channels: self.channels,
                    capacity: self.pcm.len(),
                });
            }

            let written = pcm_to_le_bytes(&self.pcm[..samples], &mut self.bytes).map_err(|e| {
                log::error!(
                    "pcm conversion failed: {} ({} pcm16={})",
                    e,
                    packet.diagnostics(),
                    per_channel
                );
                e
            })?;

            sink.write(&self.bytes[..written]).map_err(StreamError::Sink)?;
            stats.played += 1;
        }

        sink.close().map_err(StreamError::Sink)?;
        log::info!(
            "stream ended: played={} dropped={}",
            stats.played,
            stats.dropped
        );
        Ok(stats)
    }
}
