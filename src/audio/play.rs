use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::opus_codec::OpusDecoder;
use super::pipeline::{MediaPacket, StreamContext, StreamError, StreamStats};
use crate::config::Config;

/// 熔断器：底层持续跟不上写入速度时放弃本次写入
const MAX_RECOVERY_RETRIES: u32 = 3;

/// Destination for decoded, interleaved S16LE audio.
pub trait PlaybackSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush queued audio and release the device.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Playback settings shared by every stream.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA playback device name (e.g. "default", "plughw:0,0")
    pub playback_device: String,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl AudioConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            playback_device: config.playback_device.to_string(),
            playback_period_size: config.playback_period_size,
        }
    }
}

/// Format negotiated for one inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub ssrc: u32,
    pub sample_rate: u32,
    pub channels: usize,
}

pub struct AlsaPlayback {
    pcm: PCM,
    frame_bytes: usize,
}

impl AlsaPlayback {
    pub fn open(
        device: &str,
        sample_rate: u32,
        channels: usize,
        period_size: Option<usize>,
    ) -> Result<Self> {
        let (pcm, params) =
            alsa_device::open_playback(device, sample_rate, channels as u32, period_size)?;
        check_negotiated(device, sample_rate, channels, &params)?;
        log::debug!(
            "playback sink ready: {}Hz, {} frames per period",
            params.sample_rate,
            params.period_size
        );
        Ok(Self {
            pcm,
            frame_bytes: channels * 2,
        })
    }
}

// 设备必须按流的格式运行，否则声音会变速或错位
fn check_negotiated(
    device: &str,
    sample_rate: u32,
    channels: usize,
    params: &AlsaParams,
) -> Result<()> {
    if params.channels as usize != channels {
        bail!(
            "device '{}' opened with {} channels, stream needs {}",
            device,
            params.channels,
            channels
        );
    }
    if params.sample_rate != sample_rate {
        bail!(
            "device '{}' runs at {}Hz, stream needs {}Hz",
            device,
            params.sample_rate,
            sample_rate
        );
    }
    Ok(())
}

impl PlaybackSink for AlsaPlayback {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        // Write with retry loop to handle short writes and XRUN recovery
        let total_frames = bytes.len() / self.frame_bytes;
        let io = self.pcm.io_bytes();
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * self.frame_bytes;
            match io.writei(&bytes[offset..total_frames * self.frame_bytes]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if retry_count > MAX_RECOVERY_RETRIES {
                        bail!(
                            "ALSA write failed after {} recoveries, {} frames unwritten: {}",
                            MAX_RECOVERY_RETRIES,
                            total_frames - frames_written,
                            e
                        );
                    }
                    self.pcm
                        .prepare()
                        .context("Failed to recover PCM playback")?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.pcm.drain().context("Failed to drain PCM playback")?;
        Ok(())
    }
}

/// Start a dedicated playback thread for one inbound stream.
///
/// The thread opens the device and decoder, plays packets from `packets` until the
/// sender side is dropped, then reports the outcome through `on_end`.
pub fn spawn_stream<F>(
    params: StreamParams,
    config: AudioConfig,
    mut packets: mpsc::Receiver<MediaPacket>,
    on_end: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(Result<StreamStats, StreamError>) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("audio-play-{:08x}", params.ssrc))
        .spawn(move || {
            let result = play_stream(&params, &config, &mut packets);
            if let Err(e) = &result {
                log::error!("Playback thread error (ssrc={}): {}", params.ssrc, e);
            }
            on_end(result);
        })
}

fn play_stream(
    params: &StreamParams,
    config: &AudioConfig,
    packets: &mut mpsc::Receiver<MediaPacket>,
) -> Result<StreamStats, StreamError> {
    let period_size_opt = if config.playback_period_size > 0 {
        Some(config.playback_period_size)
    } else {
        None
    };
    let mut sink = AlsaPlayback::open(
        &config.playback_device,
        params.sample_rate,
        params.channels,
        period_size_opt,
    )
    .map_err(StreamError::Setup)?;

    let mut decoder =
        OpusDecoder::new(params.sample_rate, params.channels).map_err(StreamError::Setup)?;
    let mut ctx = StreamContext::new(params.sample_rate, params.channels);

    log::info!(
        "Playback started: ssrc={}, rate={}, ch={}, frame capacity={} samples / {} bytes",
        params.ssrc,
        decoder.sample_rate(),
        decoder.channels(),
        ctx.pcm_capacity(),
        ctx.byte_capacity(),
    );

    ctx.run(packets, &mut decoder, &mut sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated(sample_rate: u32, channels: u32) -> AlsaParams {
        AlsaParams {
            sample_rate,
            channels,
            period_size: 1024,
        }
    }

    #[test]
    fn device_matching_stream_format_is_accepted() {
        check_negotiated("default", 48000, 2, &negotiated(48000, 2)).unwrap();
    }

    #[test]
    fn device_rate_mismatch_is_rejected() {
        let err = check_negotiated("default", 48000, 2, &negotiated(44100, 2)).unwrap_err();
        assert!(err.to_string().contains("44100Hz"));
    }

    #[test]
    fn device_channel_mismatch_is_rejected() {
        let err = check_negotiated("default", 48000, 2, &negotiated(48000, 1)).unwrap_err();
        assert!(err.to_string().contains("1 channels"));
    }
}
