use image::RgbImage;

/// A single decoded video frame with metadata.
pub struct Frame {
    /// The frame's image data.
    pub image: RgbImage,
    /// Frame index from the start of the source (0-based).
    pub frame_number: u32,
    /// Nominal playback position, derived from the frame index and frame rate.
    pub timestamp_seconds: f64,
}
