use serde_json::Value;

use crate::error::StoreError;

/// A backend-neutral statement parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Json(Value),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&String> for SqlValue {
    fn from(s: &String) -> Self {
        Self::Text(s.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        Self::Real(f)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a parameter list from heterogeneous values.
#[macro_export]
macro_rules! sql_params {
    () => { ::std::vec::Vec::<$crate::store::SqlValue>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::store::SqlValue::from($v)),+] };
}

/// One result row, columns in select-list order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    fn column(&self, idx: usize) -> Result<&SqlValue, StoreError> {
        self.values
            .get(idx)
            .ok_or_else(|| StoreError::Decode(format!("column {idx} out of range")))
    }

    /// Text column; numbers are rendered, NULL is `None`.
    pub fn text(&self, idx: usize) -> Result<Option<String>, StoreError> {
        match self.column(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(i) => Ok(Some(i.to_string())),
            SqlValue::Real(f) => Ok(Some(f.to_string())),
            SqlValue::Json(Value::String(s)) => Ok(Some(s.clone())),
            SqlValue::Json(v) => Ok(Some(v.to_string())),
        }
    }

    /// Non-null text column.
    pub fn required_text(&self, idx: usize) -> Result<String, StoreError> {
        self.text(idx)?
            .ok_or_else(|| StoreError::Decode(format!("column {idx} is NULL")))
    }

    pub fn integer(&self, idx: usize) -> Result<i64, StoreError> {
        match self.column(idx)? {
            SqlValue::Integer(i) => Ok(*i),
            SqlValue::Text(s) => s
                .parse()
                .map_err(|_| StoreError::Decode(format!("column {idx} is not an integer: {s}"))),
            other => Err(StoreError::Decode(format!(
                "column {idx} is not an integer: {other:?}"
            ))),
        }
    }

    /// JSON column. Text is parsed; scalars stored by the embedded backend
    /// are converted back into JSON values.
    pub fn json(&self, idx: usize) -> Result<Option<Value>, StoreError> {
        match self.column(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Json(v) => Ok(Some(v.clone())),
            SqlValue::Text(s) => Ok(Some(serde_json::from_str(s)?)),
            SqlValue::Integer(i) => Ok(Some(Value::from(*i))),
            SqlValue::Real(f) => Ok(Some(Value::from(*f))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_macro_converts() {
        let params = sql_params!["ISS-1", 3_i64, Option::<String>::None, serde_json::json!([1])];
        assert_eq!(
            params,
            vec![
                SqlValue::Text("ISS-1".into()),
                SqlValue::Integer(3),
                SqlValue::Null,
                SqlValue::Json(serde_json::json!([1])),
            ]
        );
        assert!(sql_params![].is_empty());
    }

    #[test]
    fn row_getters() {
        let row = Row::new(vec![
            SqlValue::Text("{\"a\":1}".into()),
            SqlValue::Integer(7),
            SqlValue::Null,
        ]);
        assert_eq!(row.json(0).unwrap(), Some(serde_json::json!({ "a": 1 })));
        assert_eq!(row.integer(1).unwrap(), 7);
        assert_eq!(row.text(1).unwrap().as_deref(), Some("7"));
        assert_eq!(row.text(2).unwrap(), None);
        assert!(row.required_text(2).is_err());
        assert!(row.text(3).is_err());
    }

    #[test]
    fn malformed_json_text_is_error() {
        let row = Row::new(vec![SqlValue::Text("{not json".into())]);
        assert!(matches!(row.json(0), Err(StoreError::Serialization(_))));
    }
}
