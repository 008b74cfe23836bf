/// File-handoff artifact names, relative to a runner's cache directory.
pub const HANDOFF_TEMP_IMAGE: &str = "temp.png";
pub const HANDOFF_REQUEST_IMAGE: &str = "objectDetectionImage.png";
pub const HANDOFF_TIMESTAMP: &str = "timestamp.txt";
pub const HANDOFF_RESULTS: &str = "objectDetectionResults.json";

/// Extension that selects the ONNX protobuf model format.
pub const ONNX_EXTENSION: &str = "onnx";

/// Extension of ONNX Runtime's flatbuffer model format companion file.
pub const ORT_EXTENSION: &str = "ort";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];
