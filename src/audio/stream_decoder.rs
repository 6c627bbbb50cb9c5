//! Generic stream decoder trait for the receive pipeline.

use anyhow::Result;

/// A decoder that turns one compressed audio payload into interleaved i16 PCM.
///
/// Implementations write into the caller's buffer and return the number of samples
/// decoded **per channel**; the caller multiplies by its channel count.
pub trait StreamDecoder: Send {
    fn decode(&mut self, payload: &[u8], out: &mut [i16]) -> Result<usize>;
}
