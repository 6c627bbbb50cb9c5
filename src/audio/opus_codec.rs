//! Opus decoder for negotiated inbound streams.

use anyhow::{Result, bail};

use super::stream_decoder::StreamDecoder;

pub struct OpusDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
    channels: usize,
}

impl OpusDecoder {
    /// Create a decoder for the stream's negotiated format.
    ///
    /// * `sample_rate` - Opus clock rate (8000, 12000, 16000, 24000 or 48000)
    /// * `channels`    - 1 for mono, 2 for stereo
    pub fn new(sample_rate: u32, channels: usize) -> Result<Self> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => bail!("Opus supports 1 or 2 channels, stream negotiated {}", n),
        };

        let decoder = opus::Decoder::new(sample_rate, opus_channels)?;
        log::debug!("Opus decoder ready: {}Hz/{}ch", sample_rate, channels);

        Ok(Self {
            decoder,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, payload: &[u8], out: &mut [i16]) -> Result<usize> {
        Ok(self.decoder.decode(payload, out, false)?)
    }
}
