pub mod config;
pub mod constants;
pub mod detection;
pub mod frame;
pub mod label_table;
pub mod throttled_log;
