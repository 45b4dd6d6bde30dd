//! Decoding of the tinyproxy stats page.

use serde_json::{Map, Value};

/// Integer fields every stats response must carry.
pub const STAT_FIELDS: [&str; 5] = ["opens", "reqs", "badconns", "deniedconns", "refusedconns"];

/// The decoded stats mapping, before numeric coercion.
#[derive(Debug, Clone)]
pub struct StatsDocument {
    fields: Map<String, Value>,
}

/// Numeric observations extracted from one stats response.
///
/// The version is read separately through [`StatsDocument::version`] so it
/// can tag a report even when coercion fails.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsPayload {
    pub opens: i64,
    pub reqs: i64,
    pub badconns: i64,
    pub deniedconns: i64,
    pub refusedconns: i64,
}

impl StatsDocument {
    /// Decode a response body. Anything other than a JSON object is rejected.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let fields = serde_json::from_str::<Map<String, Value>>(body)?;
        Ok(Self { fields })
    }

    /// The reported version, if the field is present and truthy.
    pub fn version(&self) -> Option<String> {
        match self.fields.get("version")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
            Value::Bool(true) => Some("true".to_string()),
            _ => None,
        }
    }

    /// Coerce every stat field to an integer.
    ///
    /// Returns the name of the first field, in [`STAT_FIELDS`] order, that is
    /// missing or not an integer.
    pub fn into_payload(self) -> Result<StatsPayload, &'static str> {
        let mut values = [0i64; STAT_FIELDS.len()];
        for (value, name) in values.iter_mut().zip(STAT_FIELDS) {
            *value = self.fields.get(name).and_then(coerce_integer).ok_or(name)?;
        }

        let [opens, reqs, badconns, deniedconns, refusedconns] = values;
        Ok(StatsPayload {
            opens,
            reqs,
            badconns,
            deniedconns,
            refusedconns,
        })
    }
}

/// Integer conversion: floats truncate toward zero, strings must hold a
/// base-10 integer, booleans count as 0/1.
fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}
