//! # JSON Conversion
//!
//! Plain JSON in and out of the CLI. Store values map onto JSON the obvious
//! way; links render as `#cluster:position` strings.

use tessera_core::{Link, Parameters, ResultRow, TesseraError, Value};

/// Render a value as JSON.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Link(Link::Stored(rid)) => serde_json::Value::String(rid.to_string()),
        Value::Link(Link::Managed(handle)) => serde_json::Value::String(handle.to_string()),
        Value::List(items) => items.iter().map(value_to_json).collect(),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| {
                let key = k.as_text().map_or_else(|| k.to_string(), str::to_string);
                (key, value_to_json(v))
            })
            .collect::<serde_json::Map<_, _>>()
            .into(),
    }
}

/// Read a value from JSON. Only integral numbers are accepted.
pub fn json_to_value(json: &serde_json::Value) -> Result<Value, TesseraError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Int(n.as_i64().ok_or_else(|| {
            TesseraError::DeserializationError(format!("{} is not a 64-bit integer", n))
        })?),
        serde_json::Value::String(s) => Value::text(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(json_to_value).collect::<Result<_, _>>()?)
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| -> Result<(Value, Value), TesseraError> {
                    Ok((Value::text(k.as_str()), json_to_value(v)?))
                })
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Parse a JSON object of parameter bindings.
pub fn parse_parameters(text: Option<&str>) -> Result<Parameters, TesseraError> {
    let Some(text) = text else {
        return Ok(Parameters::new());
    };
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| TesseraError::DeserializationError(e.to_string()))?;
    let serde_json::Value::Object(entries) = json else {
        return Err(TesseraError::DeserializationError(
            "parameters must be a JSON object".to_string(),
        ));
    };
    entries
        .iter()
        .map(|(name, v)| -> Result<(String, Value), TesseraError> {
            Ok((name.clone(), json_to_value(v)?))
        })
        .collect()
}

/// Render a materialized row.
pub fn row_to_json(row: &ResultRow) -> serde_json::Value {
    match row {
        ResultRow::Object(object) => serde_json::json!({
            "identity": object.identity.to_string(),
            "class": object.record.class,
            "state": object.state.to_string(),
            "fields": object
                .record
                .fields
                .iter()
                .map(|(name, v)| (name.clone(), value_to_json(v)))
                .collect::<serde_json::Map<_, _>>(),
        }),
        ResultRow::Projection(values) => values.iter().map(value_to_json).collect(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::RecordId;

    #[test]
    fn values_render_plainly() {
        let value = Value::List(vec![
            Value::Int(3),
            Value::text("x"),
            Value::Link(Link::Stored(RecordId::new(4, 7))),
            Value::Null,
        ]);
        assert_eq!(
            value_to_json(&value),
            serde_json::json!([3, "x", "#4:7", null])
        );
    }

    #[test]
    fn parameters_read_from_object() {
        let params = parse_parameters(Some(r#"{"min": 18, "name": "Bob", "tags": ["a"]}"#))
            .expect("params");
        assert_eq!(params["min"], Value::Int(18));
        assert_eq!(params["name"], Value::text("Bob"));
        assert_eq!(params["tags"], Value::List(vec![Value::text("a")]));
    }

    #[test]
    fn fractional_numbers_are_rejected() {
        assert!(parse_parameters(Some(r#"{"x": 1.5}"#)).is_err());
        assert!(parse_parameters(Some("[1]")).is_err());
        assert!(parse_parameters(None).expect("none").is_empty());
    }
}
