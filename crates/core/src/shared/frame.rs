use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::ArrayView3;

/// A single camera frame: contiguous pixel bytes in row-major order.
///
/// `channels` is 3 for RGB captures and 1 for luminance-only captures.
/// `timestamp_ms` is the capture time in milliseconds since robot boot and
/// is carried unchanged onto every detection produced from this frame.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    timestamp_ms: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, timestamp_ms: u64) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            timestamp_ms,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// True when the frame carries RGB data.
    pub fn has_color(&self) -> bool {
        self.channels == 3
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Returns a copy resized to `width` × `height` with linear interpolation.
    ///
    /// `None` if the frame has an unsupported channel count or its buffer
    /// does not match its dimensions.
    pub fn resized(&self, width: u32, height: u32) -> Option<Frame> {
        if width == 0 || height == 0 {
            return None;
        }
        if width == self.width && height == self.height {
            return Some(self.clone());
        }
        let data = match self.channels {
            3 => {
                let img = RgbImage::from_raw(self.width, self.height, self.data.clone())?;
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
            1 => {
                let img = GrayImage::from_raw(self.width, self.height, self.data.clone())?;
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
            _ => return None,
        };
        Some(Frame::new(
            data,
            width,
            height,
            self.channels,
            self.timestamp_ms,
        ))
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}
