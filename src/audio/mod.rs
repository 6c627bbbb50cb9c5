//! audio - Receive-side audio: Opus decoding and ALSA playback
//!
//! Every negotiated inbound stream gets its own playback thread with fixed-size
//! scratch buffers. Packets arrive over a channel fed by the transport.

mod alsa_device;
mod opus_codec;
mod pipeline;
mod play;
pub mod stream_decoder;

pub use pipeline::{MediaPacket, StreamError, StreamStats};
pub use play::{AudioConfig, StreamParams, spawn_stream};
