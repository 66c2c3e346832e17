pub mod protocol;
pub mod rows;

pub use protocol::*;
pub use rows::*;
