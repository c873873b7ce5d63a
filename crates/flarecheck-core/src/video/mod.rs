pub mod decoder;
pub mod frame;

use anyhow::Result;

use frame::Frame;

/// An ordered producer of decoded frames.
pub trait FrameSource {
    /// Nominal frame rate reported by the source, or 0.0 when unknown.
    fn fps(&self) -> f64;

    /// Return the next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}
