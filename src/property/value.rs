//! Property value type and total coercions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value held by a property: boolean flag, integer or text (program ids)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    /// Boolean coercion: non-zero numbers and non-empty text are true
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Text(s) => !s.is_empty(),
        }
    }

    /// Integer coercion: booleans map to 0/1, unparsable text to 0
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Bool(b) => i64::from(*b),
            Value::Int(n) => *n,
            Value::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a command-line literal: `true`/`false`, an integer, else text
    pub fn parse_literal(s: &str) -> Self {
        match s {
            "true" | "on" => Value::Bool(true),
            "false" | "off" => Value::Bool(false),
            _ => s
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(s.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Value::Int(n as i64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
