/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Dynamically-typed elements of key tuples

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::errors::UnorderableKeyError;

/// A single element of a key tuple: partition key, sort key, or payload.
///
/// `Value` carries two orders:
///
/// * a total order ([`Ord`]), used to group keys and to lay out sorted runs.
///   Values of different kinds are ordered by kind
///   (`OrderableNone < None < Bool < numbers < Str < Tuple`);
/// * a checked order ([`Value::try_cmp`]), which only compares values of
///   mutually orderable kinds and reports an [`UnorderableKeyError`] otherwise.
///
/// Sorting sorts with the former and verifies the result with the latter, so
/// heterogeneous keys are reported instead of silently ordered by kind.
///
/// `Int` and `Float` compare (and hash) by their exact numeric value, so
/// `Int(1) == Float(1.0)` but `Int(2^53 + 1) != Float(2^53)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum Value {
    /// Only equal to itself, and cannot be ordered against anything
    #[default]
    None,
    /// Sorts before every other value, and is orderable against anything
    OrderableNone,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::OrderableNone => 0,
            Value::None => 1,
            Value::Bool(_) => 2,
            Value::Int(_) | Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Tuple(_) => 5,
        }
    }

    /// Compares two values, failing when they are not mutually orderable.
    ///
    /// ```
    /// use tinymr::Value;
    /// use std::cmp::Ordering;
    ///
    /// assert_eq!(Value::from(1).try_cmp(&Value::from(2.5)).unwrap(), Ordering::Less);
    /// assert!(Value::from(1).try_cmp(&Value::from("1")).is_err());
    /// assert_eq!(
    ///     Value::OrderableNone.try_cmp(&Value::from("a")).unwrap(),
    ///     Ordering::Less
    /// );
    /// ```
    pub fn try_cmp(&self, other: &Value) -> Result<Ordering, UnorderableKeyError> {
        let unorderable = || UnorderableKeyError {
            left: self.clone(),
            right: other.clone(),
        };
        match (self, other) {
            (Value::OrderableNone, Value::OrderableNone) => Ok(Ordering::Equal),
            (Value::OrderableNone, _) => Ok(Ordering::Less),
            (_, Value::OrderableNone) => Ok(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b).ok_or_else(unorderable),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a)
                .map(Ordering::reverse)
                .ok_or_else(unorderable),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).ok_or_else(unorderable),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Tuple(a), Value::Tuple(b)) => {
                // Like tuples in most dynamic languages: skip equal elements,
                // then order on the first difference.
                for (x, y) in a.iter().zip(b.iter()) {
                    if x != y {
                        return x.try_cmp(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(unorderable()),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the value as a float, converting integers
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

/// 2^63, the first float above every `i64`
const I64_END: f64 = 9_223_372_036_854_775_808.0;

/// Compares an integer with a float without rounding either; `None` for NaN
fn cmp_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f >= I64_END {
        return Some(Ordering::Less);
    }
    if f < -I64_END {
        return Some(Ordering::Greater);
    }
    let integral = f.trunc();
    // exact: `integral` is a whole number in the i64 range
    let order = i.cmp(&(integral as i64)).then_with(|| {
        let fraction = f - integral;
        if fraction > 0.0 {
            Ordering::Less
        } else if fraction < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
    Some(order)
}

/// Total version of [`cmp_int_float`], placing NaN by its sign like
/// [`f64::total_cmp`]
fn total_cmp_int_float(i: i64, f: f64) -> Ordering {
    cmp_int_float(i, f).unwrap_or_else(|| 0.0f64.total_cmp(&f))
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => total_cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => total_cmp_int_float(*b, *a).reverse(),
            (Value::Float(a), Value::Float(b)) => cmp_f64(*a, *b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match self {
            Value::None | Value::OrderableNone => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => {
                // Must agree with Int for integral floats, and treat -0.0 as 0
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    (*f as i64).hash(state)
                } else {
                    f.to_bits().hash(state)
                }
            }
            Value::Str(s) => s.hash(state),
            Value::Tuple(t) => t.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::OrderableNone => write!(f, "OrderableNone"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(t) => {
                write!(f, "(")?;
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(i: $t) -> Self {
                    Value::Int(i.into())
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

impl From<Vec<Value>> for Value {
    fn from(t: Vec<Value>) -> Self {
        Value::Tuple(t)
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Value::Tuple(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for Value {
    fn from((a, b, c): (A, B, C)) -> Self {
        Value::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

/// Builds a key tuple (`Vec<Value>`) from heterogeneous expressions
///
/// ```
/// use tinymr::{keys, Value};
///
/// assert_eq!(
///     keys!["word", 1],
///     vec![Value::Str("word".to_owned()), Value::Int(1)]
/// );
/// ```
#[macro_export]
macro_rules! keys {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Value::from($value)),*]
    };
}
