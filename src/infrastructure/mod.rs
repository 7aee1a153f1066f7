pub mod cache;
pub mod messaging;
