//! # Value Type System
//!
//! Core SQL values: Null, Integer (64-bit), Real, Text (UTF-8), Blob.
//! Booleans are represented as integers 0/1. Comparison follows SQL
//! semantics: `NULL = NULL` is unknown in a WHERE context, while the
//! total order used for sort keys ranks storage classes
//! Null < numeric < text < blob.
//!
//! ## Usage
//!
//! ```rust
//! use quereus::value::{Value, Collation};
//!
//! let a = Value::Text("Hello".into());
//! let b = Value::Text("hello".into());
//! assert_eq!(Value::sql_eq(&a, &b, Collation::NoCase), Some(true));
//! assert_eq!(Value::sql_eq(&Value::Null, &Value::Null, Collation::Binary), None);
//! ```

mod row;
mod sort_key;

pub use row::{Row, RowMeta, UpdateRowData};
pub use sort_key::SortKey;

use crate::error::{QuereusError, Result, StatusCode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Storage classes for values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

/// Column type affinity derived from a declared type name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeAffinity {
    Integer,
    Real,
    Numeric,
    Text,
    Blob,
}

impl TypeAffinity {
    /// Derive affinity from a declared column type name.
    ///
    /// Substring rules: INT -> Integer; CHAR/CLOB/TEXT -> Text;
    /// BLOB or empty -> Blob; REAL/FLOA/DOUB -> Real; otherwise Numeric.
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            TypeAffinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            TypeAffinity::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            TypeAffinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeAffinity::Real
        } else {
            TypeAffinity::Numeric
        }
    }

    /// Whether this affinity prefers numeric representation
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            TypeAffinity::Integer | TypeAffinity::Real | TypeAffinity::Numeric
        )
    }
}

/// Text collating sequences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collation {
    /// Byte-wise comparison (the default)
    #[default]
    Binary,
    /// ASCII case-insensitive comparison
    NoCase,
    /// Binary comparison ignoring trailing spaces
    RTrim,
}

impl Collation {
    /// Resolve a collation by its SQL name
    pub fn resolve(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BINARY" => Ok(Collation::Binary),
            "NOCASE" => Ok(Collation::NoCase),
            "RTRIM" => Ok(Collation::RTrim),
            other => Err(QuereusError::not_found(format!(
                "no such collation sequence: {other}"
            ))),
        }
    }

    /// Compare two text values under this collation
    pub fn compare_text(self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.cmp(b),
            Collation::NoCase => {
                let la = a.bytes().map(|c| c.to_ascii_lowercase());
                let lb = b.bytes().map(|c| c.to_ascii_lowercase());
                la.cmp(lb)
            }
            Collation::RTrim => a.trim_end_matches(' ').cmp(b.trim_end_matches(' ')),
        }
    }
}

/// A tagged SQL value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Storage class of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Real(_) => DataType::Real,
            Value::Text(_) => DataType::Text,
            Value::Blob(_) => DataType::Blob,
        }
    }

    /// SQL `typeof()` name
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean as integer 0/1
    pub fn from_bool(b: bool) -> Self {
        Value::Integer(i64::from(b))
    }

    /// Three-valued boolean interpretation: NULL -> None, zero -> false
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i != 0),
            Value::Real(f) => Some(*f != 0.0),
            // Non-numeric text coerces to 0 in a boolean context
            Value::Text(s) => Some(s.trim().parse::<f64>().map(|f| f != 0.0).unwrap_or(false)),
            Value::Blob(_) => Some(false),
        }
    }

    /// Truthy in a WHERE context (NULL counts as false)
    pub fn is_truthy(&self) -> bool {
        self.to_bool().unwrap_or(false)
    }

    /// Numeric interpretation, if any
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Integer interpretation, if exactly representable
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Apply column affinity on storage, the way INSERT coerces values.
    ///
    /// Numeric affinities parse numeric-looking text; Text affinity renders
    /// numbers; Blob affinity stores values unchanged.
    pub fn apply_affinity(self, affinity: TypeAffinity) -> Value {
        match (affinity, self) {
            (_, Value::Null) => Value::Null,
            (TypeAffinity::Integer | TypeAffinity::Numeric, v) => match &v {
                Value::Real(f) if f.fract() == 0.0 && f.is_finite() => Value::Integer(*f as i64),
                Value::Text(s) => {
                    let t = s.trim();
                    if let Ok(i) = t.parse::<i64>() {
                        Value::Integer(i)
                    } else if let Ok(f) = t.parse::<f64>() {
                        Value::Real(f)
                    } else {
                        v
                    }
                }
                _ => v,
            },
            (TypeAffinity::Real, v) => match &v {
                Value::Integer(i) => Value::Real(*i as f64),
                Value::Text(s) => s.trim().parse::<f64>().map_or(v, Value::Real),
                _ => v,
            },
            (TypeAffinity::Text, v) => match v {
                Value::Integer(i) => Value::Text(i.to_string()),
                Value::Real(f) => Value::Text(render_real(f)),
                other => other,
            },
            (TypeAffinity::Blob, v) => v,
        }
    }

    /// CAST conversion; stricter than affinity for numeric targets
    pub fn cast_to(self, affinity: TypeAffinity) -> Value {
        match affinity {
            TypeAffinity::Integer => {
                if let Some(i) = self.as_integer() {
                    Value::Integer(i)
                } else if let Some(f) = self.as_real() {
                    Value::Integer(f as i64)
                } else if self.is_null() {
                    Value::Null
                } else {
                    Value::Integer(leading_integer(&self))
                }
            }
            TypeAffinity::Real => {
                if self.is_null() {
                    Value::Null
                } else {
                    Value::Real(self.as_real().unwrap_or(leading_integer(&self) as f64))
                }
            }
            TypeAffinity::Numeric => self.apply_affinity(TypeAffinity::Numeric),
            TypeAffinity::Text => match self {
                Value::Null => Value::Null,
                Value::Integer(i) => Value::Text(i.to_string()),
                Value::Real(f) => Value::Text(render_real(f)),
                Value::Text(s) => Value::Text(s),
                Value::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
            },
            TypeAffinity::Blob => match self {
                Value::Null => Value::Null,
                Value::Text(s) => Value::Blob(s.into_bytes()),
                Value::Blob(b) => Value::Blob(b),
                other => Value::Blob(other.to_display_string().into_bytes()),
            },
        }
    }

    /// Rendering used by CAST-to-text and the shell
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => render_real(*f),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                format!("x'{hex}'")
            }
        }
    }

    /// Total order over all values: Null < numeric < text < blob.
    ///
    /// Integers and reals compare within one numeric class. NaN orders
    /// via `total_cmp` so the result is a lawful `Ordering` for sort
    /// keys and B-tree keys.
    pub fn compare(a: &Value, b: &Value, collation: Collation) -> Ordering {
        fn class(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
                Value::Blob(_) => 3,
            }
        }

        match class(a).cmp(&class(b)) {
            Ordering::Equal => match (a, b) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
                (Value::Real(x), Value::Real(y)) => x.total_cmp(y),
                (Value::Integer(x), Value::Real(y)) => (*x as f64).total_cmp(y),
                (Value::Real(x), Value::Integer(y)) => x.total_cmp(&(*y as f64)),
                (Value::Text(x), Value::Text(y)) => collation.compare_text(x, y),
                (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
            other => other,
        }
    }

    /// NULL-propagating comparison for WHERE-context operators
    pub fn sql_cmp(a: &Value, b: &Value, collation: Collation) -> Option<Ordering> {
        if a.is_null() || b.is_null() {
            return None;
        }
        Some(Value::compare(a, b, collation))
    }

    /// SQL equality: `NULL = anything` is unknown
    pub fn sql_eq(a: &Value, b: &Value, collation: Collation) -> Option<bool> {
        Value::sql_cmp(a, b, collation).map(|ord| ord == Ordering::Equal)
    }

    /// IS / IS NOT equality: NULL IS NULL is true
    pub fn is_eq(a: &Value, b: &Value, collation: Collation) -> bool {
        match (a.is_null(), b.is_null()) {
            (true, true) => true,
            (false, false) => Value::compare(a, b, collation) == Ordering::Equal,
            _ => false,
        }
    }

    /// Fold a value for key construction so binary key comparison honors
    /// the column's collation (NOCASE lowercases, RTRIM trims).
    pub fn collate_key(&self, collation: Collation) -> Value {
        match (self, collation) {
            (Value::Text(s), Collation::NoCase) => Value::Text(s.to_ascii_lowercase()),
            (Value::Text(s), Collation::RTrim) => {
                Value::Text(s.trim_end_matches(' ').to_string())
            }
            _ => self.clone(),
        }
    }

    /// Numeric coercion for arithmetic; errors on non-numeric text
    pub fn require_numeric(&self, op: &str) -> Result<NumericValue> {
        match self {
            Value::Integer(i) => Ok(NumericValue::Integer(*i)),
            Value::Real(f) => Ok(NumericValue::Real(*f)),
            Value::Text(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Ok(NumericValue::Integer(i))
                } else if let Ok(f) = t.parse::<f64>() {
                    Ok(NumericValue::Real(f))
                } else {
                    Err(QuereusError::new(
                        StatusCode::Mismatch,
                        format!("non-numeric operand for {op}: '{s}'"),
                    ))
                }
            }
            Value::Blob(_) => Err(QuereusError::new(
                StatusCode::Mismatch,
                format!("blob operand for {op}"),
            )),
            Value::Null => Err(QuereusError::internal("require_numeric called with NULL")),
        }
    }
}

/// Integer-or-real operand for arithmetic
#[derive(Debug, Clone, Copy)]
pub enum NumericValue {
    Integer(i64),
    Real(f64),
}

/// Longest numeric prefix of a text value, 0 when there is none
fn leading_integer(v: &Value) -> i64 {
    if let Value::Text(s) = v {
        let t = s.trim();
        let end = t
            .char_indices()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
            .map(|(i, c)| i + c.len_utf8())
            .last()
            .unwrap_or(0);
        t[..end].parse::<i64>().unwrap_or(0)
    } else {
        0
    }
}

fn render_real(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::from_bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_equality_is_unknown() {
        assert_eq!(Value::sql_eq(&Value::Null, &Value::Null, Collation::Binary), None);
        assert_eq!(
            Value::sql_eq(&Value::Null, &Value::Integer(1), Collation::Binary),
            None
        );
        assert!(Value::is_eq(&Value::Null, &Value::Null, Collation::Binary));
    }

    #[test]
    fn test_numeric_cross_class_comparison() {
        assert_eq!(
            Value::compare(&Value::Integer(2), &Value::Real(2.0), Collation::Binary),
            Ordering::Equal
        );
        assert_eq!(
            Value::compare(&Value::Integer(2), &Value::Real(2.5), Collation::Binary),
            Ordering::Less
        );
    }

    #[test]
    fn test_storage_class_ranking() {
        let null = Value::Null;
        let int = Value::Integer(9);
        let text = Value::Text("a".into());
        let blob = Value::Blob(vec![0x00]);
        assert_eq!(Value::compare(&null, &int, Collation::Binary), Ordering::Less);
        assert_eq!(Value::compare(&int, &text, Collation::Binary), Ordering::Less);
        assert_eq!(Value::compare(&text, &blob, Collation::Binary), Ordering::Less);
    }

    #[test]
    fn test_nocase_collation() {
        let a = Value::Text("ABC".into());
        let b = Value::Text("abc".into());
        assert_eq!(Value::sql_eq(&a, &b, Collation::NoCase), Some(true));
        assert_eq!(Value::sql_eq(&a, &b, Collation::Binary), Some(false));
    }

    #[test]
    fn test_rtrim_collation() {
        let a = Value::Text("abc  ".into());
        let b = Value::Text("abc".into());
        assert_eq!(Value::sql_eq(&a, &b, Collation::RTrim), Some(true));
    }

    #[test]
    fn test_affinity_from_declared_type() {
        assert_eq!(TypeAffinity::from_declared_type("INTEGER"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_declared_type("BIGINT"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_declared_type("VARCHAR(20)"), TypeAffinity::Text);
        assert_eq!(TypeAffinity::from_declared_type("DOUBLE"), TypeAffinity::Real);
        assert_eq!(TypeAffinity::from_declared_type("BLOB"), TypeAffinity::Blob);
        assert_eq!(TypeAffinity::from_declared_type(""), TypeAffinity::Blob);
        assert_eq!(
            TypeAffinity::from_declared_type("DECIMAL(10,2)"),
            TypeAffinity::Numeric
        );
    }

    #[test]
    fn test_integer_affinity_parses_text() {
        let v = Value::Text("42".into()).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v, Value::Integer(42));
        let v = Value::Text("4.5".into()).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v, Value::Real(4.5));
        let v = Value::Text("abc".into()).apply_affinity(TypeAffinity::Integer);
        assert_eq!(v, Value::Text("abc".into()));
    }

    #[test]
    fn test_cast_to_integer_truncates() {
        assert_eq!(Value::Real(3.9).cast_to(TypeAffinity::Integer), Value::Integer(3));
        assert_eq!(
            Value::Text("17abc".into()).cast_to(TypeAffinity::Integer),
            Value::Integer(17)
        );
        assert_eq!(
            Value::Text("abc".into()).cast_to(TypeAffinity::Integer),
            Value::Integer(0)
        );
        assert_eq!(Value::Null.cast_to(TypeAffinity::Integer), Value::Null);
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Integer(1).is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert_eq!(Value::Null.to_bool(), None);
        assert!(Value::Real(0.5).is_truthy());
        assert!(!Value::Text("abc".into()).is_truthy());
        assert!(Value::Text("1".into()).is_truthy());
    }

    #[test]
    fn test_collate_key_folding() {
        let v = Value::Text("AbC".into());
        assert_eq!(v.collate_key(Collation::NoCase), Value::Text("abc".into()));
        assert_eq!(v.collate_key(Collation::Binary), v);
    }

    #[test]
    fn test_real_rendering() {
        assert_eq!(Value::Real(2.0).to_display_string(), "2.0");
        assert_eq!(Value::Real(2.5).to_display_string(), "2.5");
        assert_eq!(Value::Integer(7).to_display_string(), "7");
    }
}
