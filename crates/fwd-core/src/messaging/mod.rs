//! Controller-bot messaging (replies, keyboards, admin broadcasts).

pub mod port;
pub mod throttled;
pub mod types;
