pub mod classifier;
pub mod coerce;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod frame_parser;
pub mod module_info;
pub mod records;
