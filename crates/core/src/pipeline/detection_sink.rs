use crate::shared::detection::Detection;

/// Port through which collected detections leave the perception stage.
///
/// Infrastructure provides concrete sinks (blackboard, stdout, test
/// collectors). Called once per collected batch, possibly with an empty
/// slice when the backend saw nothing or failed.
pub trait DetectionSink: Send {
    fn publish(&mut self, detections: &[Detection]);
}

