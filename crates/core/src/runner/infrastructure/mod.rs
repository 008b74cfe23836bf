pub mod async_inference_runner;
pub mod inference_worker;
