use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::ast::{BinOpKind, CmpOp};
use crate::compiler::Macro;

/// A runtime value. Cloning is cheap: every heap variant is reference counted,
/// so a compiled template can hand values between frames without copying.
#[derive(Clone, Default)]
pub enum Value {
    /// The "empty" sentinel. Renders as nothing and is skipped by `??`.
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Markup that is already escaped and must not be escaped again.
    Safe(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Macro(Arc<Macro>),
}

impl Value {
    pub fn from_safe<S: Into<Arc<str>>>(markup: S) -> Self {
        Self::Safe(markup.into())
    }

    /// Builds a map value from key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(Arc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Safe(_) => "markup",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Macro(_) => "macro",
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_true(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Macro(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::List(_)
            | Self::Map(_)
            | Self::Macro(_) => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            Self::None
            | Self::Float(_)
            | Self::Str(_)
            | Self::Safe(_)
            | Self::List(_)
            | Self::Map(_)
            | Self::Macro(_) => None,
        }
    }

    #[allow(clippy::cast_precision_loss, reason = "template numbers are f64-compatible")]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::None
            | Self::Bool(_)
            | Self::Str(_)
            | Self::Safe(_)
            | Self::List(_)
            | Self::Map(_)
            | Self::Macro(_) => None,
        }
    }

    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub const fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    /// Number of items for sequences, maps and strings.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::List(items) => Some(items.len()),
            Self::Map(map) => Some(map.len()),
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Macro(_) => None,
        }
    }

    /// The items a `for` loop visits: list elements, map keys, or string
    /// characters. `none` iterates as empty.
    pub fn try_iter(&self) -> Result<Vec<Self>, String> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::List(items) => Ok(items.as_ref().clone()),
            Self::Map(map) => Ok(map.keys().map(|k| Self::from(k.as_str())).collect()),
            Self::Str(s) | Self::Safe(s) => Ok(s.chars().map(Self::from).collect()),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Macro(_) => {
                Err(format!("'{}' is not iterable", self.kind_name()))
            }
        }
    }

    /// `.name` access: map keys, or numeric list indices (`items.0`).
    pub fn get_attr(&self, name: &str) -> Option<Self> {
        match self {
            Self::Map(map) => map.get(name).cloned(),
            Self::List(items) => name.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Str(_)
            | Self::Safe(_)
            | Self::Macro(_) => None,
        }
    }

    /// `[key]` access. Negative integer indices count from the end.
    pub fn get_item(&self, key: &Self) -> Option<Self> {
        match (self, key) {
            (Self::Map(map), Self::Str(k) | Self::Safe(k)) => map.get(k.as_ref()).cloned(),
            (Self::Map(map), Self::Int(i)) => map.get(&i.to_string()).cloned(),
            (Self::List(items), Self::Int(i)) => {
                resolve_index(*i, items.len()).and_then(|i| items.get(i).cloned())
            }
            (Self::Str(s) | Self::Safe(s), Self::Int(i)) => {
                let count = s.chars().count();
                resolve_index(*i, count)
                    .and_then(|i| s.chars().nth(i))
                    .map(Self::from)
            }
            _ => None,
        }
    }

    /// Python-style slicing over lists and strings.
    pub fn slice(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<Self, String> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err("slice step cannot be zero".to_string());
        }
        match self {
            Self::List(items) => {
                let picked = slice_indices(items.len(), start, stop, step)
                    .into_iter()
                    .filter_map(|i| items.get(i).cloned())
                    .collect();
                Ok(Self::List(Arc::new(picked)))
            }
            Self::Str(s) | Self::Safe(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked: String = slice_indices(chars.len(), start, stop, step)
                    .into_iter()
                    .filter_map(|i| chars.get(i).copied())
                    .collect();
                Ok(if self.is_safe() {
                    Self::from_safe(picked)
                } else {
                    Self::from(picked)
                })
            }
            Self::None => Ok(Self::None),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Map(_) | Self::Macro(_) => {
                Err(format!("cannot slice a {}", self.kind_name()))
            }
        }
    }

    /// The text this value contributes to rendered output.
    pub fn to_output(&self) -> String {
        self.to_string()
    }

    /// Quoted representation used inside rendered lists and maps.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }

    fn write_repr(&self, out: &mut String) {
        match self {
            Self::None => out.push_str("none"),
            Self::Str(s) | Self::Safe(s) => {
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        _ => out.push(c),
                    }
                }
                out.push('\'');
            }
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                out.push(']');
            }
            Self::Map(map) => {
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    Self::from(key.as_str()).write_repr(out);
                    out.push_str(": ");
                    value.write_repr(out);
                }
                out.push('}');
            }
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Macro(_) => {
                out.push_str(&self.to_string());
            }
        }
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    } else {
        usize::try_from(index).ok().filter(|i| *i < len)
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |bound: i64, lower: i64, upper: i64| {
        let bound = if bound < 0 { bound.saturating_add(len) } else { bound };
        bound.clamp(lower, upper)
    };
    let mut indices = Vec::new();
    if step > 0 {
        let mut i = start.map_or(0, |s| clamp(s, 0, len));
        let stop = stop.map_or(len, |s| clamp(s, 0, len));
        while i < stop {
            indices.extend(usize::try_from(i).ok());
            i = i.saturating_add(step);
        }
    } else {
        let last = len.saturating_sub(1);
        let mut i = start.map_or(last, |s| clamp(s, -1, last));
        let stop = stop.map_or(-1, |s| clamp(s, -1, last));
        while i > stop {
            indices.extend(usize::try_from(i).ok());
            i = i.saturating_add(step);
        }
    }
    indices
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Self::Str(s) | Self::Safe(s) => f.write_str(s),
            Self::List(_) | Self::Map(_) => f.write_str(&self.repr()),
            Self::Macro(m) => write!(f, "<macro {}>", m.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Safe(s) => write!(f, "Safe({s:?})"),
            Self::List(items) => f.debug_list().entries(items.iter()).finish(),
            Self::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Self::Macro(m) => write!(f, "Macro({})", m.name()),
        }
    }
}

impl PartialEq for Value {
    #[allow(clippy::float_cmp, reason = "template equality follows the source language")]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Self::Str(a) | Self::Safe(a), Self::Str(b) | Self::Safe(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Macro(a), Self::Macro(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Self::Int(i64::from(value))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Self::Str(Arc::from(value.to_string()))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<Arc<str>> for Value {
    fn from(value: Arc<str>) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::List(Arc::new(value.into_iter().map(Into::into).collect()))
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

impl<V: Into<Self>> From<BTreeMap<String, V>> for Value {
    fn from(value: BTreeMap<String, V>) -> Self {
        Self::from_pairs(value)
    }
}

impl<V: Into<Self>> From<HashMap<String, V>> for Value {
    fn from(value: HashMap<String, V>) -> Self {
        Self::from_pairs(value)
    }
}

impl FromIterator<Self> for Value {
    fn from_iter<I: IntoIterator<Item = Self>>(iter: I) -> Self {
        Self::List(Arc::new(iter.into_iter().collect()))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{SerializeMap, SerializeSeq};
        match self {
            Self::None => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Str(s) | Self::Safe(s) => serializer.serialize_str(s),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Self::Macro(m) => serializer.serialize_str(&format!("<macro {}>", m.name())),
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any template value")
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::None)
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::None)
            }

            fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                serde::Deserialize::deserialize(d)
            }

            fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Int(v))
            }

            #[allow(clippy::cast_precision_loss, reason = "values beyond i64 fall back to floats")]
            fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
                Ok(i64::try_from(v).map_or(Value::Float(v as f64), Value::Int))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
                Ok(Value::Float(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Value, E> {
                Ok(Value::from(v))
            }

            fn visit_string<E>(self, v: String) -> Result<Value, E> {
                Ok(Value::from(v))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::List(Arc::new(items)))
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
                let mut out = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    out.insert(key, value);
                }
                Ok(Value::Map(Arc::new(out)))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Marker for a lookup that found nothing. Carries the expression text that
/// failed so strict-mode errors can name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undefined {
    name: Arc<str>,
}

impl Undefined {
    pub fn new<S: Into<Arc<str>>>(name: S) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of evaluating an expression: either a value or Undefined.
///
/// All optional-chaining and coalescing behaviour lives in the combinators
/// below so the compiler never has to special-case missing data.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    Undefined(Undefined),
}

impl Resolved {
    pub fn undefined<S: Into<Arc<str>>>(name: S) -> Self {
        Self::Undefined(Undefined::new(name))
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined(_))
    }

    /// `None` for Undefined, otherwise the value.
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Undefined(_) => None,
        }
    }

    /// Undefined degrades to the `none` value.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Undefined(_) => Value::None,
        }
    }

    /// Attribute access that never fails. Undefined propagates.
    pub fn attr(self, name: &str) -> Self {
        match self {
            Self::Value(v) => v
                .get_attr(name)
                .map_or_else(|| Self::undefined(name), Self::Value),
            undefined @ Self::Undefined(_) => undefined,
        }
    }

    /// Item access that never fails. Undefined propagates.
    pub fn item(self, key: &Value) -> Self {
        match self {
            Self::Value(v) => v
                .get_item(key)
                .map_or_else(|| Self::undefined(key.repr()), Self::Value),
            undefined @ Self::Undefined(_) => undefined,
        }
    }

    /// True for Undefined and for the `none` sentinel.
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Undefined(_) | Self::Value(Value::None))
    }

    /// `self ?? fallback`.
    pub fn coalesce<E, F>(self, fallback: F) -> Result<Self, E>
    where
        F: FnOnce() -> Result<Self, E>,
    {
        if self.is_missing() {
            fallback()
        } else {
            Ok(self)
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_value().is_some_and(Value::is_true)
    }
}

impl From<Value> for Resolved {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Escapes text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Operator semantics shared by the runtime and the constant folder, so a
/// folded expression always produces exactly what the runtime would.
pub(crate) mod ops {
    use super::*;

    /// Largest string (in bytes) or list a `*` repetition may produce.
    pub(crate) const REPEAT_LIMIT: usize = 1 << 20;

    pub(crate) fn binary(op: BinOpKind, left: &Value, right: &Value) -> Result<Value, String> {
        match op {
            BinOpKind::Add => add(left, right),
            BinOpKind::Sub => arith(op, left, right, i64::checked_sub, |a, b| a - b),
            BinOpKind::Mul => mul(left, right),
            BinOpKind::Div => div(left, right),
            BinOpKind::FloorDiv => floor_div(left, right),
            BinOpKind::Mod => modulo(left, right),
            BinOpKind::Pow => pow(left, right),
        }
    }

    fn unsupported(op: BinOpKind, left: &Value, right: &Value) -> String {
        format!(
            "unsupported operand types for {}: '{}' and '{}'",
            op.symbol(),
            left.kind_name(),
            right.kind_name()
        )
    }

    fn arith(
        op: BinOpKind,
        left: &Value,
        right: &Value,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Value, String> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
                .map(Value::Int)
                .ok_or_else(|| format!("integer overflow in {}", op.symbol())),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
                _ => Err(unsupported(op, left, right)),
            },
        }
    }

    fn add(left: &Value, right: &Value) -> Result<Value, String> {
        match (left, right) {
            (Value::Safe(a), Value::Safe(b)) => Ok(Value::from_safe(format!("{a}{b}"))),
            (Value::Str(a) | Value::Safe(a), Value::Str(b) | Value::Safe(b)) => {
                Ok(Value::from(format!("{a}{b}")))
            }
            (Value::List(a), Value::List(b)) => {
                Ok(a.iter().chain(b.iter()).cloned().collect())
            }
            _ => arith(BinOpKind::Add, left, right, i64::checked_add, |a, b| a + b),
        }
    }

    fn mul(left: &Value, right: &Value) -> Result<Value, String> {
        match (left, right) {
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                let times = repetitions(s.len(), *n)?;
                Ok(Value::from(s.repeat(times)))
            }
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                let times = repetitions(items.len(), *n)?;
                Ok((0..times).flat_map(|_| items.iter().cloned()).collect())
            }
            _ => arith(BinOpKind::Mul, left, right, i64::checked_mul, |a, b| a * b),
        }
    }

    /// How many times to repeat a sequence of `len` elements. Negative counts
    /// repeat zero times.
    fn repetitions(len: usize, n: i64) -> Result<usize, String> {
        let times = usize::try_from(n).unwrap_or(0);
        len.checked_mul(times)
            .filter(|total| *total <= REPEAT_LIMIT)
            .map(|_| times)
            .ok_or_else(|| format!("repetition exceeds the limit of {REPEAT_LIMIT} elements"))
    }

    fn div(left: &Value, right: &Value) -> Result<Value, String> {
        match (left.as_f64(), right.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err("division by zero".to_string()),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(unsupported(BinOpKind::Div, left, right)),
        }
    }

    fn floor_div(left: &Value, right: &Value) -> Result<Value, String> {
        match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err("division by zero".to_string()),
            (Value::Int(a), Value::Int(b)) => {
                let q = a
                    .checked_div(*b)
                    .ok_or_else(|| "integer overflow in //".to_string())?;
                let adjust = a.checked_rem(*b).is_some_and(|r| r != 0) && ((*a < 0) != (*b < 0));
                Ok(Value::Int(if adjust { q.saturating_sub(1) } else { q }))
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err("division by zero".to_string()),
                (Some(a), Some(b)) => Ok(Value::Float((a / b).floor())),
                _ => Err(unsupported(BinOpKind::FloorDiv, left, right)),
            },
        }
    }

    fn modulo(left: &Value, right: &Value) -> Result<Value, String> {
        match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err("modulo by zero".to_string()),
            (Value::Int(a), Value::Int(b)) => {
                let r = a
                    .checked_rem(*b)
                    .ok_or_else(|| "integer overflow in %".to_string())?;
                Ok(Value::Int(if r != 0 && ((r < 0) != (*b < 0)) { r.saturating_add(*b) } else { r }))
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err("modulo by zero".to_string()),
                (Some(a), Some(b)) => Ok(Value::Float(a - b * (a / b).floor())),
                _ => Err(unsupported(BinOpKind::Mod, left, right)),
            },
        }
    }

    fn pow(left: &Value, right: &Value) -> Result<Value, String> {
        match (left, right) {
            (Value::Int(base), Value::Int(exp)) if *exp >= 0 => u32::try_from(*exp)
                .ok()
                .and_then(|exp| base.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(|| "integer overflow in **".to_string()),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
                _ => Err(unsupported(BinOpKind::Pow, left, right)),
            },
        }
    }

    pub(crate) fn negate(value: &Value) -> Result<Value, String> {
        match value {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| "integer overflow in unary -".to_string()),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::None
            | Value::Bool(_)
            | Value::Str(_)
            | Value::Safe(_)
            | Value::List(_)
            | Value::Map(_)
            | Value::Macro(_) => Err(format!("bad operand type for unary -: '{}'", value.kind_name())),
        }
    }

    pub(crate) fn plus(value: &Value) -> Result<Value, String> {
        if value.is_number() {
            Ok(value.clone())
        } else {
            Err(format!("bad operand type for unary +: '{}'", value.kind_name()))
        }
    }

    pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
        match op {
            CmpOp::Eq => Ok(left == right),
            CmpOp::Ne => Ok(left != right),
            CmpOp::Lt => order(left, right).map(Ordering::is_lt),
            CmpOp::Le => order(left, right).map(Ordering::is_le),
            CmpOp::Gt => order(left, right).map(Ordering::is_gt),
            CmpOp::Ge => order(left, right).map(Ordering::is_ge),
            CmpOp::In => contains(right, left),
            CmpOp::NotIn => contains(right, left).map(|found| !found),
        }
    }

    pub(crate) fn order(left: &Value, right: &Value) -> Result<Ordering, String> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Str(a) | Value::Safe(a), Value::Str(b) | Value::Safe(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = order(x, y)?;
                    if ord.is_ne() {
                        return Ok(ord);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| "cannot order NaN".to_string()),
                _ => Err(format!(
                    "cannot compare '{}' with '{}'",
                    left.kind_name(),
                    right.kind_name()
                )),
            },
        }
    }

    pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, String> {
        match container {
            Value::Str(haystack) | Value::Safe(haystack) => match item.as_str() {
                Some(needle) => Ok(haystack.contains(needle)),
                None => Err(format!(
                    "'in <string>' requires a string, not '{}'",
                    item.kind_name()
                )),
            },
            Value::List(items) => Ok(items.iter().any(|candidate| candidate == item)),
            Value::Map(map) => Ok(item.as_str().is_some_and(|key| map.contains_key(key))),
            Value::None => Ok(false),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Macro(_) => Err(format!(
                "argument of type '{}' is not iterable",
                container.kind_name()
            )),
        }
    }

    /// Joins rendered operands for `~`. Safe only when every part is safe.
    pub(crate) fn concat(parts: &[Value]) -> Value {
        let all_safe = !parts.is_empty() && parts.iter().all(Value::is_safe);
        let text: String = parts.iter().map(Value::to_output).collect();
        if all_safe {
            Value::from_safe(text)
        } else {
            Value::from(text)
        }
    }

    /// Dict literal keys: strings as-is, anything else by its rendering.
    pub(crate) fn key_string(key: &Value) -> String {
        key.as_str()
            .map_or_else(|| key.to_output(), str::to_string)
    }

    /// A slice bound: `none` leaves the side open.
    pub(crate) fn slice_bound(bound: &Value) -> Result<Option<i64>, String> {
        match bound {
            Value::None => Ok(None),
            Value::Int(i) => Ok(Some(*i)),
            other => Err(format!("slice indices must be integers, not '{}'", other.kind_name())),
        }
    }

    /// Materialises `start..end` (or `..=`). Errors above `limit` items.
    pub(crate) fn range(
        start: &Value,
        end: &Value,
        inclusive: bool,
        limit: usize,
    ) -> Result<Value, String> {
        let (Some(start), Some(end)) = (start.as_i64(), end.as_i64()) else {
            return Err(format!(
                "range bounds must be integers, got '{}' and '{}'",
                start.kind_name(),
                end.kind_name()
            ));
        };
        let end = if inclusive { end.saturating_add(1) } else { end };
        let count = usize::try_from(end.saturating_sub(start)).unwrap_or(0);
        if count > limit {
            return Err(format!("range of {count} items exceeds the limit of {limit}"));
        }
        Ok((start..end).map(Value::Int).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::ops::*;
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_render_scalars() {
        assert_eq!(Value::None.to_output(), "");
        assert_eq!(Value::Bool(true).to_output(), "true");
        assert_eq!(Value::Int(-3).to_output(), "-3");
        assert_eq!(Value::Float(2.0).to_output(), "2.0");
        assert_eq!(Value::Float(2.5).to_output(), "2.5");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_render_list_representation() {
        let list = Value::from(vec![1, 2, 3]);
        assert_eq!(list.to_output(), "[1, 2, 3]");
        let nested = Value::from(vec![Value::from("a"), Value::None, Value::from(vec![1])]);
        assert_eq!(nested.to_output(), "['a', none, [1]]");
        let map = Value::from_pairs([("b", 2), ("a", 1)]);
        assert_eq!(map.to_output(), "{'a': 1, 'b': 2}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_truthiness() {
        assert!(!Value::None.is_true());
        assert!(!Value::from("").is_true());
        assert!(Value::from("x").is_true());
        assert!(!Value::from(Vec::<Value>::new()).is_true());
        assert!(Value::Int(1).is_true());
        assert!(!Value::Float(0.0).is_true());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_numeric_equality_crosses_types() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::from("2"));
        assert_eq!(Value::from("a"), Value::from_safe("a"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic() {
        assert_eq!(binary(BinOpKind::Add, &Value::Int(2), &Value::Int(3)), Ok(Value::Int(5)));
        assert_eq!(binary(BinOpKind::Div, &Value::Int(7), &Value::Int(2)), Ok(Value::Float(3.5)));
        assert_eq!(binary(BinOpKind::FloorDiv, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(-4)));
        assert_eq!(binary(BinOpKind::FloorDiv, &Value::Int(7), &Value::Int(-2)), Ok(Value::Int(-4)));
        assert_eq!(binary(BinOpKind::Mod, &Value::Int(-7), &Value::Int(3)), Ok(Value::Int(2)));
        assert_eq!(binary(BinOpKind::Pow, &Value::Int(2), &Value::Int(10)), Ok(Value::Int(1024)));
        assert_eq!(
            binary(BinOpKind::Add, &Value::from("ab"), &Value::from("cd")),
            Ok(Value::from("abcd"))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic_errors() {
        assert!(binary(BinOpKind::Div, &Value::Int(1), &Value::Int(0)).is_err());
        assert!(binary(BinOpKind::Add, &Value::Int(i64::MAX), &Value::Int(1)).is_err());
        let err = binary(BinOpKind::Sub, &Value::from("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err, "unsupported operand types for -: 'string' and 'int'");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compare_and_contains() {
        assert_eq!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)), Ok(true));
        assert_eq!(compare(CmpOp::In, &Value::from("ell"), &Value::from("hello")), Ok(true));
        assert_eq!(compare(CmpOp::NotIn, &Value::Int(4), &Value::from(vec![1, 2])), Ok(true));
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::from("a")).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_item_access_and_slices() {
        let list = Value::from(vec![10, 20, 30, 40]);
        assert_eq!(list.get_item(&Value::Int(-1)), Some(Value::Int(40)));
        assert_eq!(list.get_item(&Value::Int(9)), None);
        assert_eq!(list.get_attr("1"), Some(Value::Int(20)));
        assert_eq!(list.slice(Some(1), Some(3), None), Ok(Value::from(vec![20, 30])));
        assert_eq!(list.slice(None, None, Some(-1)), Ok(Value::from(vec![40, 30, 20, 10])));
        assert_eq!(Value::from("hello").slice(None, Some(-1), None), Ok(Value::from("hell")));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_resolved_combinators() {
        let user = Resolved::from(Value::from_pairs([("name", "Ada")]));
        assert_eq!(user.clone().attr("name"), Resolved::Value(Value::from("Ada")));
        let missing = user.attr("email").attr("domain");
        assert!(missing.is_undefined());
        assert_eq!(missing.clone().into_value(), Value::None);

        let fallback: Result<Resolved, ()> = missing.coalesce(|| Ok(Value::from("x").into()));
        assert_eq!(fallback, Ok(Resolved::Value(Value::from("x"))));
        let kept: Result<Resolved, ()> =
            Resolved::from(Value::Int(0)).coalesce(|| Ok(Value::Int(1).into()));
        assert_eq!(kept, Ok(Resolved::Value(Value::Int(0))));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_range_limit() {
        assert_eq!(range(&Value::Int(1), &Value::Int(3), true, 10), Ok(Value::from(vec![1, 2, 3])));
        assert_eq!(range(&Value::Int(3), &Value::Int(1), false, 10), Ok(Value::from(Vec::<Value>::new())));
        assert!(range(&Value::Int(0), &Value::Int(100), false, 10).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_repetition_limit() {
        assert_eq!(binary(BinOpKind::Mul, &Value::from("ab"), &Value::Int(3)), Ok(Value::from("ababab")));
        assert_eq!(binary(BinOpKind::Mul, &Value::Int(-2), &Value::from("ab")), Ok(Value::from("")));
        assert_eq!(
            binary(BinOpKind::Mul, &Value::from(vec![1]), &Value::Int(2)),
            Ok(Value::from(vec![1, 1]))
        );

        let err = binary(BinOpKind::Mul, &Value::from("x"), &Value::Int(i64::MAX)).unwrap_err();
        assert!(err.contains("repetition exceeds"));
        assert!(binary(BinOpKind::Mul, &Value::from(vec![1, 2]), &Value::Int(i64::MAX)).is_err());
        let limit = i64::try_from(REPEAT_LIMIT).unwrap();
        assert!(binary(BinOpKind::Mul, &Value::from("x"), &Value::Int(limit)).is_ok());
        assert!(binary(BinOpKind::Mul, &Value::from("xy"), &Value::Int(limit)).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#x27;");
    }
}
