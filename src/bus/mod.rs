// Bus domain: filtered pub/sub between producers and consumers.

pub mod dispatch;
pub mod event;
