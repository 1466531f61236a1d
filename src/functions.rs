//! # Builtin Scalar Functions
//!
//! The scalar function library registered into every catalog at
//! startup. Hosts add their own through `Database::register_function`;
//! these follow the same [`FunctionSchema`] contract.

use crate::error::{QuereusError, Result};
use crate::schema::{FunctionSchema, SchemaManager};
use crate::value::Value;

/// Register the builtin scalar functions into a catalog
pub fn register_builtins(manager: &mut SchemaManager) {
    manager.register_function(FunctionSchema::scalar("lower", Some(1), |args| {
        Ok(match &args[0] {
            Value::Text(s) => Value::Text(s.to_lowercase()),
            Value::Null => Value::Null,
            other => Value::Text(other.to_display_string().to_lowercase()),
        })
    }));

    manager.register_function(FunctionSchema::scalar("upper", Some(1), |args| {
        Ok(match &args[0] {
            Value::Text(s) => Value::Text(s.to_uppercase()),
            Value::Null => Value::Null,
            other => Value::Text(other.to_display_string().to_uppercase()),
        })
    }));

    manager.register_function(FunctionSchema::scalar("length", Some(1), |args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            Value::Text(s) => Value::Integer(s.chars().count() as i64),
            Value::Blob(b) => Value::Integer(b.len() as i64),
            other => Value::Integer(other.to_display_string().chars().count() as i64),
        })
    }));

    manager.register_function(FunctionSchema::scalar("abs", Some(1), |args| {
        match &args[0] {
            Value::Null => Ok(Value::Null),
            Value::Integer(i) => i
                .checked_abs()
                .map(Value::Integer)
                .ok_or_else(|| {
                    QuereusError::new(
                        crate::error::StatusCode::Range,
                        "integer overflow in abs()",
                    )
                }),
            Value::Real(f) => Ok(Value::Real(f.abs())),
            other => match other.as_real() {
                Some(f) => Ok(Value::Real(f.abs())),
                None => Ok(Value::Real(0.0)),
            },
        }
    }));

    manager.register_function(FunctionSchema::scalar("coalesce", None, |args| {
        Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null))
    }));

    manager.register_function(FunctionSchema::scalar("ifnull", Some(2), |args| {
        Ok(if args[0].is_null() {
            args[1].clone()
        } else {
            args[0].clone()
        })
    }));

    manager.register_function(FunctionSchema::scalar("nullif", Some(2), |args| {
        let equal = Value::sql_eq(&args[0], &args[1], crate::value::Collation::Binary);
        Ok(if equal == Some(true) {
            Value::Null
        } else {
            args[0].clone()
        })
    }));

    manager.register_function(FunctionSchema::scalar("typeof", Some(1), |args| {
        Ok(Value::Text(args[0].type_name().to_string()))
    }));

    manager.register_function(FunctionSchema::scalar("substr", None, |args| {
        if args.len() < 2 || args.len() > 3 {
            return Err(QuereusError::misuse("substr() takes 2 or 3 arguments"));
        }
        let Value::Text(s) = &args[0] else {
            return Ok(Value::Null);
        };
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len() as i64;
        // 1-based start; negative counts from the end
        let mut start = args[1].as_integer().unwrap_or(1);
        if start < 0 {
            start = (len + start).max(0) + 1;
        }
        let start_idx = (start.max(1) - 1).min(len) as usize;
        let take = match args.get(2) {
            Some(n) => n.as_integer().unwrap_or(0).max(0) as usize,
            None => chars.len() - start_idx,
        };
        Ok(Value::Text(chars[start_idx..].iter().take(take).collect()))
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(manager: &SchemaManager, name: &str, args: &[Value]) -> Value {
        let function = manager.function(name, args.len()).expect("function");
        (function.func)(args).expect("call")
    }

    fn catalog() -> SchemaManager {
        let mut manager = SchemaManager::new();
        register_builtins(&mut manager);
        manager
    }

    #[test]
    fn test_case_functions() {
        let m = catalog();
        assert_eq!(
            call(&m, "lower", &[Value::Text("AbC".into())]),
            Value::Text("abc".into())
        );
        assert_eq!(
            call(&m, "upper", &[Value::Text("AbC".into())]),
            Value::Text("ABC".into())
        );
        assert_eq!(call(&m, "lower", &[Value::Null]), Value::Null);
    }

    #[test]
    fn test_length_counts_chars() {
        let m = catalog();
        assert_eq!(
            call(&m, "length", &[Value::Text("héllo".into())]),
            Value::Integer(5)
        );
        assert_eq!(
            call(&m, "length", &[Value::Blob(vec![1, 2, 3])]),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_coalesce_and_friends() {
        let m = catalog();
        assert_eq!(
            call(&m, "coalesce", &[Value::Null, Value::Null, Value::Integer(3)]),
            Value::Integer(3)
        );
        assert_eq!(
            call(&m, "ifnull", &[Value::Null, Value::Integer(9)]),
            Value::Integer(9)
        );
        assert_eq!(
            call(&m, "nullif", &[Value::Integer(1), Value::Integer(1)]),
            Value::Null
        );
        assert_eq!(
            call(&m, "nullif", &[Value::Integer(1), Value::Integer(2)]),
            Value::Integer(1)
        );
    }

    #[test]
    fn test_typeof() {
        let m = catalog();
        assert_eq!(call(&m, "typeof", &[Value::Null]), Value::Text("null".into()));
        assert_eq!(
            call(&m, "typeof", &[Value::Real(1.5)]),
            Value::Text("real".into())
        );
    }

    #[test]
    fn test_substr() {
        let m = catalog();
        assert_eq!(
            call(
                &m,
                "substr",
                &[Value::Text("hello".into()), Value::Integer(2), Value::Integer(3)]
            ),
            Value::Text("ell".into())
        );
        assert_eq!(
            call(&m, "substr", &[Value::Text("hello".into()), Value::Integer(-3)]),
            Value::Text("llo".into())
        );
    }

    #[test]
    fn test_abs_overflow_is_range_error() {
        let m = catalog();
        let function = m.function("abs", 1).expect("function");
        let err = (function.func)(&[Value::Integer(i64::MIN)]).expect_err("overflow");
        assert_eq!(err.code, crate::error::StatusCode::Range);
    }
}
