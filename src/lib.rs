//! tinyproxy-check - periodic health/metric check for tinyproxy.
//!
//! Queries the tinyproxy stats vhost, decodes its JSON counters and reports
//! them as gauges, monotonic counts, service checks and events.

pub mod config;
pub mod probe;
pub mod report;
pub mod scheduler;
