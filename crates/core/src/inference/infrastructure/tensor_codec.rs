//! Pre- and post-processing shared by the in-process backends.
//!
//! Builds NCHW input blobs from frames and decodes raw network outputs into
//! [`Detection`]s, applying the score floor, top-K limit and label lookup.

use ndarray::Array4;

use crate::inference::domain::backend_error::BackendError;
use crate::shared::config::{Mode, Normalization};
use crate::shared::detection::{Detection, Location, NormalizedPoint, PixelRect};
use crate::shared::frame::Frame;
use crate::shared::label_table::LabelTable;

use super::onnx_session::RawOutput;

/// Values per row of an SSD `DetectionOutput` tensor:
/// `[image_id, label, score, x1, y1, x2, y2]`.
pub const SSD_ROW_LEN: usize = 7;

/// Build a `[1, 3, H, W]` float blob with `(pixel - mean[c]) / std`.
///
/// Luminance-only frames are replicated across the three channels.
pub fn build_input_blob(frame: &Frame, norm: &Normalization) -> Array4<f32> {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let last_channel = frame.channels().max(1) as usize - 1;
    let src = frame.as_ndarray();

    let mut blob = Array4::<f32>::zeros((1, 3, h, w));
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let px = src[[y, x, c.min(last_channel)]] as f32;
                blob[[0, c, y, x]] = (px - norm.mean[c]) / norm.std;
            }
        }
    }
    blob
}

/// Shared decoding parameters for one inference result.
#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub min_score: f32,
    pub top_k: usize,
    /// Processing resolution the normalized coordinates refer to.
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
}

/// Decode an SSD-style detection tensor.
///
/// Keeps rows scoring at or above `min_score`, in output order, up to
/// `top_k`. Rows whose box has no area at the processing resolution are
/// skipped and do not count towards `top_k`.
pub fn decode_ssd_detections(
    data: &[f32],
    params: &DecodeParams,
    labels: &LabelTable,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in data.chunks_exact(SSD_ROW_LEN) {
        if detections.len() >= params.top_k {
            break;
        }
        let score = row[2];
        if score.is_nan() || score < params.min_score {
            continue;
        }
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        let Some(rect) = PixelRect::from_normalized_corners(
            clamp(row[3]),
            clamp(row[4]),
            clamp(row[5]),
            clamp(row[6]),
            params.width,
            params.height,
        ) else {
            continue;
        };
        detections.push(Detection::new(
            params.timestamp_ms,
            score.min(1.0),
            labels.get(row[1] as i64),
            Location::Rect(rect),
        ));
    }
    detections
}

/// Pick the single highest-scoring class, if it clears `min_score`.
pub fn select_top_label(
    scores: &[f32],
    min_score: f32,
    labels: &LabelTable,
    timestamp_ms: u64,
) -> Option<Detection> {
    let (index, &score) = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if score < min_score {
        return None;
    }
    Some(Detection::new(
        timestamp_ms,
        score.min(1.0),
        labels.get(index as i64),
        Location::Point(NormalizedPoint::WHOLE_IMAGE),
    ))
}

/// Turns a raw network output into detections for one mode.
#[derive(Clone, Debug)]
pub struct OutputDecoder {
    pub mode: Mode,
    pub min_score: f32,
    pub top_k: usize,
    pub labels: LabelTable,
}

impl OutputDecoder {
    /// Decode `output` for `frame`, whose size is the processing resolution.
    pub fn decode(&self, output: &RawOutput, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
        match self.mode {
            Mode::Detection => {
                if output.data.len() % SSD_ROW_LEN != 0 {
                    return Err(BackendError::UnexpectedOutput(format!(
                        "detection output shape {:?} is not a multiple of {SSD_ROW_LEN} values",
                        output.shape
                    )));
                }
                let params = DecodeParams {
                    min_score: self.min_score,
                    top_k: self.top_k,
                    width: frame.width(),
                    height: frame.height(),
                    timestamp_ms: frame.timestamp_ms(),
                };
                Ok(decode_ssd_detections(&output.data, &params, &self.labels))
            }
            Mode::Classification => {
                if output.data.is_empty() {
                    return Err(BackendError::UnexpectedOutput(format!(
                        "classification output shape {:?} holds no scores",
                        output.shape
                    )));
                }
                Ok(
                    select_top_label(&output.data, self.min_score, &self.labels, frame.timestamp_ms())
                        .into_iter()
                        .collect(),
                )
            }
        }
    }
}
