/// Label reported when a backend's class index has no entry in the label table.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// Axis-aligned rectangle in pixel coordinates.
///
/// Right and bottom edges are exclusive. Width and height are always
/// strictly positive; construct through [`PixelRect::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

impl PixelRect {
    /// Returns `None` for zero- or negative-area rectangles.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Builds a rectangle from fractional corners of a `width` × `height` image.
    pub fn from_normalized_corners(
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        let w = width as f32;
        let h = height as f32;
        Self::new(
            (xmin * w).round() as i32,
            (ymin * h).round() as i32,
            ((xmax - xmin) * w).round() as i32,
            ((ymax - ymin) * h).round() as i32,
        )
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Scales every component per axis, rounding to nearest.
    pub fn scaled(&self, scale: ScaleFactors) -> Option<Self> {
        Self::new(
            (self.x as f64 * scale.x).round() as i32,
            (self.y as f64 * scale.y).round() as i32,
            (self.width as f64 * scale.x).round() as i32,
            (self.height as f64 * scale.y).round() as i32,
        )
    }
}

/// Resolution-independent location: a point inside the image plus the
/// fraction of the image area the detection covers, all in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
    pub area_fraction: f32,
}

impl NormalizedPoint {
    /// The whole image, as reported by classifiers.
    pub const WHOLE_IMAGE: NormalizedPoint = NormalizedPoint {
        x: 0.5,
        y: 0.5,
        area_fraction: 1.0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Location {
    Rect(PixelRect),
    Point(NormalizedPoint),
}

/// Per-axis factors mapping processing-resolution coordinates back to the
/// original frame: `original / processing`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleFactors {
    pub x: f64,
    pub y: f64,
}

impl ScaleFactors {
    pub const IDENTITY: ScaleFactors = ScaleFactors { x: 1.0, y: 1.0 };

    pub fn between(original: (u32, u32), processing: (u32, u32)) -> Self {
        Self {
            x: original.0 as f64 / processing.0 as f64,
            y: original.1 as f64 / processing.1 as f64,
        }
    }
}

/// One recognised object or region.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub timestamp_ms: u64,
    pub score: f32,
    pub label: String,
    pub location: Location,
}

impl Detection {
    pub fn new(timestamp_ms: u64, score: f32, label: impl Into<String>, location: Location) -> Self {
        Self {
            timestamp_ms,
            score,
            label: label.into(),
            location,
        }
    }

    /// Maps the location into another coordinate space.
    ///
    /// Normalized points are returned unchanged. `None` when a rectangle
    /// collapses to zero area.
    pub fn rescaled(&self, scale: ScaleFactors) -> Option<Detection> {
        let location = match self.location {
            Location::Rect(rect) => Location::Rect(rect.scaled(scale)?),
            point @ Location::Point(_) => point,
        };
        Some(Detection {
            location,
            ..self.clone()
        })
    }
}

/// Rescales a batch, dropping detections that collapse to zero area.
pub fn rescale_all(detections: &[Detection], scale: ScaleFactors) -> Vec<Detection> {
    detections
        .iter()
        .filter_map(|d| d.rescaled(scale))
        .collect()
}
