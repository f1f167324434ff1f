pub mod interaction;
pub mod log;
pub mod types;
pub mod utils;
