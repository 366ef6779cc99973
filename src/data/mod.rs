//! Frame types, data intake and plane storage.
pub mod frame;
pub mod intake;
pub mod writer;
