//! Sink writing one JSON object per line.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use super::{Emission, MetricSink};

/// Serializes every emission as a JSON line on the wrapped writer.
///
/// Write failures are logged and dropped so a broken pipe never fails a check.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(writer: &mut W, emission: &Emission) -> io::Result<()> {
        serde_json::to_writer(&mut *writer, emission)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl<W: Write + Send> MetricSink for JsonLinesSink<W> {
    fn emit(&self, emission: Emission) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = Self::write_line(&mut writer, &emission) {
            tracing::error!("Failed to write emission: {}", e);
        }
    }
}
