//! In-memory recording sink.

use std::sync::{Mutex, PoisonError};

use super::{Emission, Event, MetricSink, ServiceCheckStatus};

/// Keeps every emission in order of arrival.
#[derive(Default)]
pub struct MemorySink {
    emissions: Mutex<Vec<Emission>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.emissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status, tags and message of every recorded service check.
    pub fn service_checks(&self) -> Vec<(ServiceCheckStatus, Vec<String>, Option<String>)> {
        self.emissions()
            .into_iter()
            .filter_map(|e| match e {
                Emission::ServiceCheck {
                    status,
                    tags,
                    message,
                    ..
                } => Some((status, tags, message)),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.emissions()
            .into_iter()
            .filter_map(|e| match e {
                Emission::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Gauges and monotonic counts, in emission order.
    pub fn metrics(&self) -> Vec<Emission> {
        self.emissions()
            .into_iter()
            .filter(|e| matches!(e, Emission::Gauge { .. } | Emission::MonotonicCount { .. }))
            .collect()
    }

    pub fn clear(&self) {
        self.emissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricSink for MemorySink {
    fn emit(&self, emission: Emission) {
        self.emissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(emission);
    }
}
