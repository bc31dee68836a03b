pub mod console;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod scan_loop;
pub mod sink;
pub mod source;
pub mod verify;

pub use error::ScanError;
