pub mod detect_objects_use_case;
pub mod detection_sink;
