use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node status indicator. Fill and shape are free-form; rendering decides
/// what to do with values it does not know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Status {
    pub fn new(fill: impl Into<String>, shape: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.into()),
            shape: Some(shape.into()),
            text: Some(text.into()),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn clear() -> Self {
        Self::default()
    }

    pub fn is_clear(&self) -> bool {
        self.fill.is_none() && self.shape.is_none() && self.text.is_none()
    }

    /// Scalars become text-only statuses; objects are read field by field.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::text(s.clone()),
            Value::Number(n) => Self::text(n.to_string()),
            Value::Bool(b) => Self::text(b.to_string()),
            Value::Object(obj) => {
                let field = |name: &str| match obj.get(name) {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                Self {
                    fill: field("fill"),
                    shape: field("shape"),
                    text: field("text"),
                }
            }
            _ => Self::default(),
        }
    }
}

impl From<&str> for Status {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Status {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<bool> for Status {
    fn from(value: bool) -> Self {
        Self::text(value.to_string())
    }
}

impl From<i64> for Status {
    fn from(value: i64) -> Self {
        Self::text(value.to_string())
    }
}

impl From<f64> for Status {
    fn from(value: f64) -> Self {
        Self::from_value(&Value::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shorthand_becomes_text() {
        assert_eq!(Status::from("ok"), Status::text("ok"));
        assert_eq!(Status::from(42i64), Status::text("42"));
        assert_eq!(Status::from(true), Status::text("true"));
        assert_eq!(Status::from_value(&json!(1.5)), Status::text("1.5"));
    }

    #[test]
    fn structured_passes_through_unvalidated() {
        let status = Status::from_value(&json!({"fill": "purple", "shape": "star", "text": "x"}));
        assert_eq!(status, Status::new("purple", "star", "x"));
        assert_eq!(
            serde_json::to_value(Status::text("t")).unwrap(),
            json!({"text": "t"})
        );
    }
}
