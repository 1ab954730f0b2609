//! Consumers of module results: the throttled UI feed and the telemetry
//! table.

pub mod fps;
pub mod telemetry;
pub mod ui;
