//! The tagged-union attribute value carried in `@attr` events and `list`
//! responses. The wire form is always a string; the tag travels separately
//! in the `type` field.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Unsigned(u64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    /// Parse a wire string given its `type` tag (`bool|int|unsigned|double|string`).
    /// Returns `None` for an unrecognized tag or a value that fails to parse
    /// under the tag -- callers log and drop the event rather than erroring
    /// the whole connection.
    pub fn parse(type_tag: &str, raw: &str) -> Option<Self> {
        match type_tag {
            "bool" => raw.parse::<bool>().ok().map(AttributeValue::Bool),
            "int" => raw.parse::<i64>().ok().map(AttributeValue::Int),
            "unsigned" => raw.parse::<u64>().ok().map(AttributeValue::Unsigned),
            "double" => raw.parse::<f64>().ok().map(AttributeValue::Double),
            "string" => Some(AttributeValue::String(raw.to_owned())),
            _ => None,
        }
    }

    /// The `type` tag this value would be announced with on the wire.
    pub fn type_tag(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Int(_) => "int",
            AttributeValue::Unsigned(_) => "unsigned",
            AttributeValue::Double(_) => "double",
            AttributeValue::String(_) => "string",
        }
    }

    /// The wire string for the `value` field.
    pub fn as_wire_string(&self) -> String {
        match self {
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Unsigned(u) => u.to_string(),
            AttributeValue::Double(d) => d.to_string(),
            AttributeValue::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_known_type() {
        assert_eq!(AttributeValue::parse("bool", "true"), Some(AttributeValue::Bool(true)));
        assert_eq!(AttributeValue::parse("int", "-7"), Some(AttributeValue::Int(-7)));
        assert_eq!(
            AttributeValue::parse("unsigned", "42"),
            Some(AttributeValue::Unsigned(42))
        );
        assert_eq!(
            AttributeValue::parse("double", "3.5"),
            Some(AttributeValue::Double(3.5))
        );
        assert_eq!(
            AttributeValue::parse("string", "hello"),
            Some(AttributeValue::String("hello".to_owned()))
        );
    }

    #[test]
    fn unknown_type_tag_returns_none() {
        assert_eq!(AttributeValue::parse("enum", "x"), None);
    }

    #[test]
    fn malformed_value_for_type_returns_none() {
        assert_eq!(AttributeValue::parse("bool", "maybe"), None);
        assert_eq!(AttributeValue::parse("int", "nope"), None);
    }

    #[test]
    fn type_tag_round_trips() {
        let v = AttributeValue::Unsigned(5);
        assert_eq!(v.type_tag(), "unsigned");
        assert_eq!(
            AttributeValue::parse(v.type_tag(), &v.as_wire_string()),
            Some(v)
        );
    }
}
