pub mod model;
pub mod repositories;

pub use model::{Online, PushMsg, PushMsgType};
pub use repositories::PushPublisher;
