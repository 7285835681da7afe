use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::datasets::DatasetConfig;
use crate::error::StoreError;

// ── Timestamps ─────────────────────────────────────────────────────

/// Render a timestamp the way it is stored: RFC 3339, microseconds, `Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and the backend default
/// `YYYY-MM-DD HH:MM:SS` form written by `CURRENT_TIMESTAMP`.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::Timestamp(text.to_string()))
}

/// Serde adapter that keeps the stored timestamp format on the wire.
pub mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        super::parse_timestamp(&text).map_err(serde::de::Error::custom)
    }
}

// ── Raw records ────────────────────────────────────────────────────

/// One ingested row: the optional JSON blob plus denormalized scalars that
/// stand in for it when no blob was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub theme: Option<String>,
    pub subtheme: Option<String>,
    pub blob: Option<Value>,
}

impl RawRecord {
    /// Build a record from an ingested JSON object using the dataset's
    /// field names. The key field must be a non-empty string or a number.
    pub fn from_object(
        config: &DatasetConfig,
        object: &Map<String, Value>,
    ) -> Result<Self, String> {
        let id = match object.get(config.key_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(format!("Missing required field: {}", config.key_field)),
        };

        let text = |field: Option<&str>| -> Option<String> {
            match object.get(field?)? {
                Value::Null => None,
                Value::String(s) => Some(s.trim().to_string()),
                other => Some(other.to_string()),
            }
        };

        Ok(Self {
            id,
            title: text(Some(config.title_field)),
            category: text(config.category_field),
            theme: text(Some(config.theme_field)),
            subtheme: text(config.subtheme_field),
            blob: Some(Value::Object(object.clone())),
        })
    }

    /// The context object handed to compute functions.
    ///
    /// Uses the stored blob when present; otherwise synthesizes one from
    /// the scalar columns under the dataset's own field names.
    pub fn context(&self, config: &DatasetConfig) -> Map<String, Value> {
        match &self.blob {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert(config.key_field.to_string(), Value::String(self.id.clone()));
                map.insert("raw_data".to_string(), other.clone());
                map
            }
            None => {
                let mut map = Map::new();
                map.insert(config.key_field.to_string(), Value::String(self.id.clone()));
                map.insert(config.title_field.to_string(), opt_value(&self.title));
                map.insert(config.theme_field.to_string(), opt_value(&self.theme));
                if let Some(field) = config.category_field {
                    map.insert(field.to_string(), opt_value(&self.category));
                }
                if let Some(field) = config.subtheme_field {
                    map.insert(field.to_string(), opt_value(&self.subtheme));
                }
                map
            }
        }
    }
}

fn opt_value(v: &Option<String>) -> Value {
    v.as_ref().map_or(Value::Null, |s| Value::String(s.clone()))
}

// ── Cache entries and resolve results ──────────────────────────────

/// A stored result: opaque payload plus the time it was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    #[serde(with = "timestamp_format")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveSource {
    Cache,
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveStatus {
    #[default]
    Ok,
}

/// Outcome of a successful resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub status: ResolveStatus,
    pub source: ResolveSource,
    pub payload: Value,
    #[serde(with = "timestamp_format")]
    pub created_at: DateTime<Utc>,
}

impl Resolved {
    pub fn from_entry(source: ResolveSource, entry: CacheEntry) -> Self {
        Self {
            status: ResolveStatus::Ok,
            source,
            payload: entry.payload,
            created_at: entry.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Dataset;

    fn scalar_record() -> RawRecord {
        RawRecord {
            id: "ISS-1".into(),
            title: Some("Payment gateway timeout".into()),
            category: Some("Incident".into()),
            theme: Some("Technology".into()),
            subtheme: None,
            blob: None,
        }
    }

    #[test]
    fn context_prefers_blob() {
        let mut record = scalar_record();
        record.blob = Some(serde_json::json!({ "issue_id": "ISS-1", "owner": "ops" }));
        let ctx = record.context(Dataset::Issues.config());
        assert_eq!(ctx["owner"], "ops");
        assert!(!ctx.contains_key("issue_title"));
    }

    #[test]
    fn context_synthesized_from_scalars() {
        let ctx = scalar_record().context(Dataset::Issues.config());
        assert_eq!(ctx["issue_id"], "ISS-1");
        assert_eq!(ctx["issue_title"], "Payment gateway timeout");
        assert_eq!(ctx["issues_type"], "Incident");
        assert_eq!(ctx["risk_theme"], "Technology");
        assert_eq!(ctx["risk_subtheme"], Value::Null);
    }

    #[test]
    fn non_object_blob_is_wrapped() {
        let mut record = scalar_record();
        record.blob = Some(serde_json::json!(["a", "b"]));
        let ctx = record.context(Dataset::Issues.config());
        assert_eq!(ctx["raw_data"], serde_json::json!(["a", "b"]));
        assert_eq!(ctx["issue_id"], "ISS-1");
    }

    #[test]
    fn from_object_maps_dataset_fields() {
        let obj = serde_json::json!({
            "control_id": " CTL-9 ",
            "control_title": "Four-eyes approval",
            "key_control": true,
            "risk_theme": "Fraud",
        });
        let record =
            RawRecord::from_object(Dataset::Controls.config(), obj.as_object().unwrap()).unwrap();
        assert_eq!(record.id, "CTL-9");
        assert_eq!(record.title.as_deref(), Some("Four-eyes approval"));
        assert_eq!(record.category.as_deref(), Some("true"));
        assert_eq!(record.subtheme, None);
        assert!(record.blob.is_some());
    }

    #[test]
    fn from_object_requires_key() {
        let obj = serde_json::json!({ "control_title": "orphan" });
        let err = RawRecord::from_object(Dataset::Controls.config(), obj.as_object().unwrap())
            .unwrap_err();
        assert!(err.contains("control_id"));
    }

    #[test]
    fn timestamps_round_trip_at_micros() {
        let now = Utc::now();
        let text = format_timestamp(&now);
        assert!(text.ends_with('Z'));
        let parsed = parse_timestamp(&text).unwrap();
        assert_eq!(format_timestamp(&parsed), text);
    }

    #[test]
    fn parses_backend_default_timestamp() {
        let parsed = parse_timestamp("2024-03-01 12:30:00").unwrap();
        assert_eq!(format_timestamp(&parsed), "2024-03-01T12:30:00.000000Z");
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn resolved_serializes_lowercase() {
        let resolved = Resolved::from_entry(
            ResolveSource::Computed,
            CacheEntry {
                payload: serde_json::json!({ "k": 1 }),
                created_at: parse_timestamp("2024-03-01T12:30:00.000001Z").unwrap(),
            },
        );
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["source"], "computed");
        assert_eq!(json["created_at"], "2024-03-01T12:30:00.000001Z");
    }
}
