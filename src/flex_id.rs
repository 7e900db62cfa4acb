use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A loosely typed scalar from the backend.
///
/// Ids and timestamps arrive as numbers on some servers and as strings on
/// others; flags arrive as `0`/`1`, `"1"` or booleans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FlexId {
    Number(i64),
    String(String),
    Bool(bool),
    #[default]
    Null,
}

impl FlexId {
    /// Integer value; numeric strings and booleans are converted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FlexId::Number(n) => Some(*n),
            FlexId::String(s) => s.trim().parse().ok(),
            FlexId::Bool(b) => Some(i64::from(*b)),
            FlexId::Null => None,
        }
    }

    /// Truthiness the way the backend means it: non-zero, `true`, or a
    /// non-empty string other than `"0"`.
    pub fn as_bool(&self) -> bool {
        match self {
            FlexId::Number(n) => *n != 0,
            FlexId::String(s) => !s.is_empty() && s != "0" && s != "false",
            FlexId::Bool(b) => *b,
            FlexId::Null => false,
        }
    }

    pub fn to_string_value(&self) -> Option<String> {
        match self {
            FlexId::Number(n) => Some(n.to_string()),
            FlexId::String(s) => Some(s.clone()),
            FlexId::Bool(b) => Some(b.to_string()),
            FlexId::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FlexId::Null)
    }
}

impl fmt::Display for FlexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlexId::Number(n) => write!(f, "{}", n),
            FlexId::String(s) => write!(f, "{}", s),
            FlexId::Bool(b) => write!(f, "{}", b),
            FlexId::Null => write!(f, "null"),
        }
    }
}

impl Serialize for FlexId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FlexId::Number(n) => serializer.serialize_i64(*n),
            FlexId::String(s) => serializer.serialize_str(s),
            FlexId::Bool(b) => serializer.serialize_bool(*b),
            FlexId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for FlexId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct FlexIdVisitor;

        impl<'de> Visitor<'de> for FlexIdVisitor {
            type Value = FlexId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number, string, boolean or null")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(FlexId::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(FlexId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .map(FlexId::Number)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                // servers occasionally send timestamps as `1700000000.0`
                Ok(FlexId::Number(v as i64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(FlexId::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(FlexId::String(v))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(FlexId::Null)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(FlexId::Null)
            }
        }

        deserializer.deserialize_any(FlexIdVisitor)
    }
}

/// Required integer that may be sent as a string.
pub fn deserialize_flex_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let flex = FlexId::deserialize(deserializer)?;
    flex.as_i64()
        .ok_or_else(|| D::Error::custom(format!("expected an integer, got {}", flex)))
}

/// Flag sent as `0`/`1`, boolean or string; missing or null is `false`.
pub fn deserialize_flex_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(FlexId::deserialize(deserializer)?.as_bool())
}

/// Value normalized to its string form; null becomes an empty string.
pub fn deserialize_flex_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(FlexId::deserialize(deserializer)?
        .to_string_value()
        .unwrap_or_default())
}
