//! The schemaless ingest record.

use crate::Date;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field holding the canonical date a record is keyed by.
pub const DATE_PARSED: &str = "date_parsed";

/// One ingested CSV row: an opaque map of string-keyed fields plus the
/// derived [`DATE_PARSED`] field.
///
/// The storage layer never interprets fields other than [`DATE_PARSED`];
/// the showcase probes for its temperature marker columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Attach the canonical date this record is keyed by.
    pub fn set_date_parsed(&mut self, date: Date) {
        self.insert(DATE_PARSED, Value::String(date.to_string()));
    }

    /// The canonical date this record is keyed by, if present and valid.
    pub fn date_parsed(&self) -> Option<Date> {
        let raw = self.get(DATE_PARSED)?.as_str()?;
        Date::parse_canonical(raw).ok()
    }

    /// Interpret a field as a number.
    ///
    /// CSV ingestion stores every field as a JSON string, while restored or
    /// hand-built records may carry real JSON numbers; both are accepted.
    /// Empty strings and absent fields yield `None`.
    pub fn numeric(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn date_parsed_round_trip() {
        let mut r = Record::new();
        assert_eq!(r.date_parsed(), None);

        r.set_date_parsed(Date::parse_canonical("31-01-2012").unwrap());
        assert_eq!(r.date_parsed().unwrap().to_string(), "31-01-2012");
    }

    #[test]
    fn numeric_accepts_strings_and_numbers() {
        let r = record(&[
            ("temp_min", json!("2")),
            ("temp_max", json!(10)),
            ("blank", json!("")),
            ("text", json!("warm")),
        ]);
        assert_eq!(r.numeric("temp_min"), Some(2.0));
        assert_eq!(r.numeric("temp_max"), Some(10.0));
        assert_eq!(r.numeric("blank"), None);
        assert_eq!(r.numeric("text"), None);
        assert_eq!(r.numeric("absent"), None);
    }

    #[test]
    fn serializes_as_flat_object() {
        let r = record(&[("date_parsed", json!("01-01-2000")), ("temp_max", json!("10"))]);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"date_parsed": "01-01-2000", "temp_max": "10"})
        );
    }
}
