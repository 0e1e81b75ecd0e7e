//! Points and their InfluxDB line protocol encoding.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl FieldValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::String(v) => serde_json::Value::from(v.as_str()),
            FieldValue::Boolean(v) => serde_json::Value::from(*v),
        }
    }
}

/// One timestamped, tagged, multi-field record for a measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: Option<DateTime<Utc>>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Encodes the point with nanosecond precision. Empty tag values are dropped,
    /// the store rejects them. Line breaks in the measurement, tags or field keys
    /// cannot be escaped and fail the encoding.
    pub fn to_line_protocol(&self) -> Result<String> {
        check_single_line(&self.measurement)?;
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            check_single_line(key)?;
            check_single_line(value)?;
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                check_single_line(key)?;
                let encoded = match value {
                    FieldValue::Float(v) => encode_float(*v),
                    FieldValue::Integer(v) => format!("{}i", v),
                    FieldValue::Boolean(v) => v.to_string(),
                    FieldValue::String(v) => format!("\"{}\"", escape(v, &['"', '\\'])),
                };
                Ok(format!("{}={}", escape(key, &[',', '=', ' ']), encoded))
            })
            .collect::<Result<_>>()?;
        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(nanos) = self.time.and_then(|t| t.timestamp_nanos_opt()) {
            let _ = write!(line, " {}", nanos);
        }

        Ok(line)
    }
}

fn check_single_line(input: &str) -> Result<()> {
    if input.contains(['\n', '\r']) {
        return Err(Error::Validation(format!(
            "{:?} cannot be written as line protocol",
            input
        )));
    }
    Ok(())
}

fn encode_float(v: f64) -> String {
    // Whole numbers print without a decimal point, which the store also reads as float.
    if v.is_finite() {
        format!("{}", v)
    } else {
        "0".to_string()
    }
}

fn escape(input: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_environment_point_encoding() {
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let point = Point::new("environment")
            .tag("device", "dev-1")
            .tag("TemperatureSensor", "virtual_bme280")
            .field("Temperature", 21.0)
            .field("Lat", 52.5)
            .time(time);

        assert_eq!(
            point.to_line_protocol().unwrap(),
            "environment,TemperatureSensor=virtual_bme280,device=dev-1 Lat=52.5,Temperature=21 1700000000000000000"
        );
    }

    #[test]
    fn test_escaping() {
        let point = Point::new("device auth")
            .tag("deviceId", "a b,c=d")
            .field("token", "say \"hi\" \\o/");

        assert_eq!(
            point.to_line_protocol().unwrap(),
            r#"device\ auth,deviceId=a\ b\,c\=d token="say \"hi\" \\o/""#
        );
    }

    #[test]
    fn test_integer_and_bool_fields() {
        let point = Point::new("m").field("count", 3i64).field("ok", true);
        assert_eq!(point.to_line_protocol().unwrap(), "m count=3i,ok=true");
    }

    #[test]
    fn test_line_break_in_tag_is_rejected() {
        let point = Point::new("deviceauth")
            .tag("deviceId", "a\nenvironment,device=evil Temperature=1")
            .field("key", "k");

        assert!(matches!(point.to_line_protocol(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_line_break_in_field_key_is_rejected() {
        let point = Point::new("m").field("a\rb", 1.0);
        assert!(point.to_line_protocol().is_err());
    }

    #[test]
    fn test_empty_tag_dropped() {
        let point = Point::new("m").tag("device", "").field("v", 1.5);
        assert_eq!(point.to_line_protocol().unwrap(), "m v=1.5");
    }
}
