pub mod field;
pub mod payload;

pub use field::*;
pub use payload::*;
