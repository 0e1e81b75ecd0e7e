//! Structured Flux queries and the annotated CSV the store answers with.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Row filter inside a `filter(fn: (r) => ...)` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, String),
    Ne(String, String),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Ne(column.into(), value.into())
    }

    fn render(&self) -> String {
        match self {
            Predicate::Eq(column, value) => {
                format!("r[{}] == {}", quote(column), quote(value))
            }
            Predicate::Ne(column, value) => {
                format!("r[{}] != {}", quote(column), quote(value))
            }
        }
    }

    pub fn matches(&self, record: &FluxRecord) -> bool {
        match self {
            Predicate::Eq(column, value) => record.get_str(column) == Some(value.as_str()),
            Predicate::Ne(column, value) => record.get_str(column) != Some(value.as_str()),
        }
    }
}

/// `from |> range |> filter |> last` pipeline over a single bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxQuery {
    pub bucket: String,
    /// Flux range start: `0` or a negative duration such as `-1h`.
    pub start: String,
    pub predicates: Vec<Predicate>,
    pub last: bool,
}

impl FluxQuery {
    pub fn from_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            start: "0".to_string(),
            predicates: Vec::new(),
            last: false,
        }
    }

    pub fn range(mut self, start: impl Into<String>) -> Self {
        self.start = start.into();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn last(mut self) -> Self {
        self.last = true;
        self
    }

    pub fn to_flux(&self) -> String {
        let mut flux = format!(
            "from(bucket: {}) |> range(start: {})",
            quote(&self.bucket),
            self.start
        );
        if !self.predicates.is_empty() {
            let body: Vec<String> = self.predicates.iter().map(Predicate::render).collect();
            flux.push_str(&format!(
                " |> filter(fn: (r) => {})",
                body.join(" and ")
            ));
        }
        if self.last {
            flux.push_str(" |> last()");
        }
        flux
    }
}

/// Checks a range start so it can be spliced into a query unquoted.
pub fn validate_range_start(start: &str) -> Result<()> {
    if start == "0" {
        return Ok(());
    }
    let Some(rest) = start.strip_prefix('-') else {
        return Err(Error::Validation(format!(
            "range start `{}` must be 0 or a negative duration like -1h",
            start
        )));
    };
    if parse_duration_seconds(rest).is_some() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "range start `{}` is not a duration",
            start
        )))
    }
}

/// Seconds in a single-unit duration literal (`30s`, `15m`, `1h`, `7d`, `2w`).
pub fn parse_duration_seconds(literal: &str) -> Option<i64> {
    let split = literal.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = literal.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    amount.checked_mul(factor)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// One row of a query result, keyed by column name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FluxRecord {
    pub values: Map<String, Value>,
}

impl FluxRecord {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(Value::as_str)
    }

    pub fn field(&self) -> Option<&str> {
        self.get_str("_field")
    }

    pub fn value(&self) -> Option<&Value> {
        self.get("_value")
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.get_str("_time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn value_string(&self) -> Option<String> {
        match self.value()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn value_f64(&self) -> Option<f64> {
        match self.value()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Parses annotated CSV into records. Values are typed from the `#datatype`
/// annotation when present; blank lines separate tables with their own header.
pub fn parse_annotated_csv(body: &str) -> Result<Vec<FluxRecord>> {
    let mut records = Vec::new();
    let mut datatypes: Vec<String> = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            header = None;
            datatypes.clear();
            continue;
        }

        let cells = split_csv_line(line)?;
        if let Some(first) = cells.first() {
            if first == "#datatype" {
                datatypes = cells;
                continue;
            }
            if first.starts_with('#') {
                continue;
            }
        }

        let Some(columns) = &header else {
            if cells.first().map(String::as_str) == Some("error") {
                return Err(Error::Parse(format!("query failed: {}", line)));
            }
            header = Some(cells);
            continue;
        };

        let mut values = Map::new();
        for (i, (column, cell)) in columns.iter().zip(cells.iter()).enumerate() {
            if column.is_empty() {
                continue;
            }
            let datatype = datatypes.get(i).map(String::as_str).unwrap_or("string");
            values.insert(column.clone(), typed_value(datatype, cell));
        }
        records.push(FluxRecord { values });
    }

    Ok(records)
}

fn typed_value(datatype: &str, cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    let parsed = match datatype {
        "double" => cell
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "long" => cell.parse::<i64>().ok().map(Value::from),
        "unsignedLong" => cell.parse::<u64>().ok().map(Value::from),
        "boolean" => cell.parse::<bool>().ok().map(Value::from),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::from(cell))
}

/// Encodes records as CSV with a `#datatype` annotation row and a header.
/// Columns are the union of all record keys, in first-seen order.
pub fn encode_annotated_csv(records: &[FluxRecord]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.values.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let datatype = |column: &str| -> &'static str {
        if column == "_time" {
            return "dateTime:RFC3339";
        }
        match records.iter().find_map(|r| r.get(column).filter(|v| !v.is_null())) {
            Some(Value::Number(n)) if n.is_i64() => "long",
            Some(Value::Number(n)) if n.is_u64() => "unsignedLong",
            Some(Value::Number(_)) => "double",
            Some(Value::Bool(_)) => "boolean",
            _ => "string",
        }
    };

    let mut out = String::new();
    let mut annotation = vec!["#datatype".to_string()];
    annotation.extend(columns.iter().map(|c| datatype(c).to_string()));
    out.push_str(&annotation.join(","));
    out.push('\n');

    let mut header = vec![String::new()];
    header.extend(columns.iter().map(|c| escape_csv(c)));
    out.push_str(&header.join(","));
    out.push('\n');

    for record in records {
        let mut row = vec![String::new()];
        row.extend(columns.iter().map(|c| match record.get(c) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => escape_csv(s),
            Some(other) => other.to_string(),
        }));
        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

/// Re-joins raw CSV rows with plain commas, one row per line.
pub fn join_csv_rows(body: &str) -> Result<String> {
    let mut out = String::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        let cells = split_csv_line(line)?;
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn escape_csv(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Splits one CSV line, honouring double-quoted cells with `""` escapes.
pub fn split_csv_line(line: &str) -> Result<Vec<String>> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                cell.push('"');
            }
            ('"', true) => in_quotes = false,
            ('"', false) if cell.is_empty() => in_quotes = true,
            (',', false) => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    if in_quotes {
        return Err(Error::Parse(format!("unterminated quote in CSV line: {}", line)));
    }
    cells.push(cell);
    Ok(cells)
}
