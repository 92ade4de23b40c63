pub mod decoder;
pub mod requests;

pub use decoder::WorkerBasedDecoder;
pub use requests::*;
