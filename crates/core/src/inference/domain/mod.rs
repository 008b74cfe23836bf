pub mod backend_error;
pub mod inference_backend;
