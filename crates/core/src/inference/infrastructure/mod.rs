pub mod backend_factory;
pub mod compiled_backend;
pub mod file_handoff;
pub mod messenger_backend;
pub mod onnx_backend;
pub mod onnx_session;
pub mod tensor_codec;
