//! Built-in filters, tests and global functions.
//!
//! Every callable receives already-evaluated values. An undefined input
//! arrives as `none`, so `default` and friends can treat both the same way.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use rand::seq::{IndexedRandom, SliceRandom};

use crate::{
    analysis::Purity,
    ast::BinOpKind,
    config::Registry,
    value::{Value, escape_html, ops},
};

/// Upper bound on the number of items `range()` may produce at render time.
pub(crate) const RANGE_LIMIT: usize = 100_000;

pub type FilterFn = dyn Fn(&Value, &Args) -> Result<Value, String> + Send + Sync;
pub type TestFn = dyn Fn(&Value, &Args) -> Result<bool, String> + Send + Sync;
pub type FunctionFn = dyn Fn(&Args) -> Result<Value, String> + Send + Sync;

/// Arguments passed to a filter, test or function call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub const fn new(positional: Vec<Value>, keyword: BTreeMap<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub const fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// The argument at position `index`, or passed by keyword as `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    fn int(&self, index: usize, name: &str, default: i64) -> Result<i64, String> {
        match self.get(index, name) {
            None | Some(Value::None) => Ok(default),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| format!("argument '{name}' must be an integer, not '{}'", value.kind_name())),
        }
    }

    fn flag(&self, index: usize, name: &str) -> bool {
        self.get(index, name).is_some_and(Value::is_true)
    }

    fn text(&self, index: usize, name: &str) -> Option<Cow<'_, str>> {
        self.get(index, name).filter(|v| !v.is_none()).map(text)
    }
}

fn text(value: &Value) -> Cow<'_, str> {
    value
        .as_str()
        .map_or_else(|| Cow::Owned(value.to_output()), Cow::Borrowed)
}

/// Keeps the markup flag of `input` on a string derived from it.
fn like(input: &Value, out: String) -> Value {
    if input.is_safe() {
        Value::from_safe(out)
    } else {
        Value::from(out)
    }
}

fn items(value: &Value) -> Result<Vec<Value>, String> {
    value.try_iter()
}

pub(crate) fn register(registry: &mut Registry) {
    let pure: &[(&str, fn(&Value, &Args) -> Result<Value, String>)] = &[
        ("abs", abs),
        ("capitalize", capitalize),
        ("count", length),
        ("length", length),
        ("default", default),
        ("d", default),
        ("escape", escape),
        ("e", escape),
        ("first", first),
        ("float", float),
        ("int", int),
        ("join", join),
        ("keys", keys),
        ("last", last),
        ("list", list),
        ("lower", lower),
        ("max", max),
        ("min", min),
        ("replace", replace),
        ("reverse", reverse),
        ("round", round),
        ("safe", safe),
        ("sort", sort),
        ("split", split),
        ("string", string),
        ("striptags", striptags),
        ("sum", sum),
        ("title", title),
        ("trim", trim),
        ("truncate", truncate),
        ("unique", unique),
        ("upper", upper),
        ("values", values),
        ("items", map_items),
        ("wordcount", wordcount),
        ("urlencode", urlencode),
    ];
    for (name, filter) in pure {
        registry.add_filter(name, Purity::Pure, Arc::new(*filter));
    }
    registry.add_filter("random", Purity::Impure, Arc::new(random));
    registry.add_filter("shuffle", Purity::Impure, Arc::new(shuffle));

    let tests: &[(&str, fn(&Value, &Args) -> Result<bool, String>)] = &[
        ("none", |v, _| Ok(v.is_none())),
        ("string", |v, _| Ok(v.as_str().is_some())),
        ("number", |v, _| Ok(v.is_number())),
        ("integer", |v, _| Ok(matches!(v, Value::Int(_)))),
        ("float", |v, _| Ok(matches!(v, Value::Float(_)))),
        ("mapping", |v, _| Ok(matches!(v, Value::Map(_)))),
        ("sequence", |v, _| {
            Ok(matches!(v, Value::List(_) | Value::Str(_) | Value::Safe(_)))
        }),
        ("iterable", |v, _| {
            Ok(matches!(
                v,
                Value::List(_) | Value::Map(_) | Value::Str(_) | Value::Safe(_)
            ))
        }),
        ("even", |v, _| int_test(v, |i| i.rem_euclid(2) == 0)),
        ("odd", |v, _| int_test(v, |i| i.rem_euclid(2) != 0)),
        ("divisibleby", divisibleby),
        ("eq", equal),
        ("equalto", equal),
        ("sameas", equal),
        ("in", is_in),
        ("true", |v, _| Ok(matches!(v, Value::Bool(true)))),
        ("false", |v, _| Ok(matches!(v, Value::Bool(false)))),
        ("empty", |v, _| Ok(v.is_none() || v.len() == Some(0))),
    ];
    for (name, test) in tests {
        registry.add_test(name, Arc::new(*test));
    }

    registry.add_function("range", Purity::Pure, Arc::new(range));
    registry.add_function("dict", Purity::Pure, Arc::new(dict));
    registry.add_function("len", Purity::Pure, Arc::new(len));
}

fn abs(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| "integer overflow in abs".to_string()),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(format!("abs expects a number, not '{}'", other.kind_name())),
    }
}

fn capitalize(value: &Value, _: &Args) -> Result<Value, String> {
    let s = text(value);
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    };
    Ok(like(value, out))
}

fn length(value: &Value, _: &Args) -> Result<Value, String> {
    if value.is_none() {
        return Ok(Value::Int(0));
    }
    value
        .len()
        .map(Value::from)
        .ok_or_else(|| format!("object of type '{}' has no length", value.kind_name()))
}

fn default(value: &Value, args: &Args) -> Result<Value, String> {
    let use_fallback = value.is_none() || (args.flag(1, "boolean") && !value.is_true());
    if use_fallback {
        Ok(args
            .get(0, "default_value")
            .cloned()
            .unwrap_or_else(|| Value::from("")))
    } else {
        Ok(value.clone())
    }
}

fn escape(value: &Value, _: &Args) -> Result<Value, String> {
    if value.is_safe() {
        return Ok(value.clone());
    }
    Ok(Value::from_safe(escape_html(&value.to_output())))
}

fn first(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::List(items) => Ok(items.first().cloned().unwrap_or_default()),
        _ => Ok(items(value)?.into_iter().next().unwrap_or_default()),
    }
}

fn last(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::List(items) => Ok(items.last().cloned().unwrap_or_default()),
        _ => Ok(items(value)?.pop().unwrap_or_default()),
    }
}

#[allow(clippy::cast_precision_loss, reason = "template numbers are f64-compatible")]
fn float(value: &Value, args: &Args) -> Result<Value, String> {
    let fallback = args.get(0, "default").and_then(Value::as_f64).unwrap_or(0.0);
    Ok(Value::Float(match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Str(s) | Value::Safe(s) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }))
}

#[allow(clippy::cast_possible_truncation, reason = "float to int truncates like the source language")]
fn int(value: &Value, args: &Args) -> Result<Value, String> {
    let fallback = args.int(0, "default", 0)?;
    Ok(Value::Int(match value {
        Value::Int(i) => *i,
        Value::Float(f) if f.is_finite() => f.trunc() as i64,
        Value::Bool(b) => i64::from(*b),
        Value::Str(s) | Value::Safe(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .unwrap_or(fallback)
        }
        _ => fallback,
    }))
}

fn join(value: &Value, args: &Args) -> Result<Value, String> {
    let separator = args.text(0, "d").unwrap_or(Cow::Borrowed(""));
    let attribute = args.text(1, "attribute");
    let parts: Vec<String> = items(value)?
        .into_iter()
        .map(|item| match &attribute {
            Some(attr) => item.get_attr(attr).unwrap_or_default().to_output(),
            None => item.to_output(),
        })
        .collect();
    Ok(Value::from(parts.join(&*separator)))
}

fn keys(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::Map(map) => Ok(map.keys().map(|k| Value::from(k.as_str())).collect()),
        Value::None => Ok(Value::from(Vec::<Value>::new())),
        other => Err(format!("keys expects a mapping, not '{}'", other.kind_name())),
    }
}

fn values(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::Map(map) => Ok(map.values().cloned().collect()),
        Value::None => Ok(Value::from(Vec::<Value>::new())),
        other => Err(format!("values expects a mapping, not '{}'", other.kind_name())),
    }
}

fn map_items(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::Map(map) => Ok(map
            .iter()
            .map(|(k, v)| Value::from(vec![Value::from(k.as_str()), v.clone()]))
            .collect()),
        Value::None => Ok(Value::from(Vec::<Value>::new())),
        other => Err(format!("items expects a mapping, not '{}'", other.kind_name())),
    }
}

fn list(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(Value::from(items(value)?))
}

fn lower(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(like(value, text(value).to_lowercase()))
}

fn upper(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(like(value, text(value).to_uppercase()))
}

fn title(value: &Value, _: &Args) -> Result<Value, String> {
    let mut out = String::new();
    let mut at_word_start = true;
    for c in text(value).chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    Ok(like(value, out))
}

fn trim(value: &Value, args: &Args) -> Result<Value, String> {
    let s = text(value);
    let out = match args.text(0, "chars") {
        Some(chars) => s.trim_matches(|c| chars.contains(c)).to_string(),
        None => s.trim().to_string(),
    };
    Ok(like(value, out))
}

fn extreme(value: &Value, want: std::cmp::Ordering) -> Result<Value, String> {
    let mut best: Option<Value> = None;
    for item in items(value)? {
        best = match best {
            Some(current) if ops::order(&item, &current)? != want => Some(current),
            _ => Some(item),
        };
    }
    Ok(best.unwrap_or_default())
}

fn max(value: &Value, _: &Args) -> Result<Value, String> {
    extreme(value, std::cmp::Ordering::Greater)
}

fn min(value: &Value, _: &Args) -> Result<Value, String> {
    extreme(value, std::cmp::Ordering::Less)
}

fn replace(value: &Value, args: &Args) -> Result<Value, String> {
    let old = args
        .text(0, "old")
        .ok_or_else(|| "replace requires the substring to replace".to_string())?;
    let new = args.text(1, "new").unwrap_or(Cow::Borrowed(""));
    let s = text(value);
    let out = match args.get(2, "count").and_then(Value::as_i64) {
        Some(count) => s.replacen(&*old, &new, usize::try_from(count).unwrap_or(0)),
        None => s.replace(&*old, &new),
    };
    Ok(like(value, out))
}

fn reverse(value: &Value, _: &Args) -> Result<Value, String> {
    match value {
        Value::Str(_) | Value::Safe(_) => Ok(like(value, text(value).chars().rev().collect())),
        _ => {
            let mut items = items(value)?;
            items.reverse();
            Ok(Value::from(items))
        }
    }
}

#[allow(clippy::cast_precision_loss, reason = "template numbers are f64-compatible")]
fn round(value: &Value, args: &Args) -> Result<Value, String> {
    let number = value
        .as_f64()
        .ok_or_else(|| format!("round expects a number, not '{}'", value.kind_name()))?;
    let precision = i32::try_from(args.int(0, "precision", 0)?)
        .map_err(|_| "round precision out of range".to_string())?;
    let method = args.text(1, "method").unwrap_or(Cow::Borrowed("common"));
    let factor = 10f64.powi(precision);
    let scaled = number * factor;
    let rounded = match method.as_ref() {
        "common" => scaled.round(),
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        other => return Err(format!("unknown rounding method '{other}'")),
    };
    Ok(Value::Float(rounded / factor))
}

fn safe(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(Value::from_safe(value.to_output()))
}

fn sort(value: &Value, args: &Args) -> Result<Value, String> {
    let reverse = args.flag(0, "reverse");
    let attribute = args.text(1, "attribute");
    let key = |item: &Value| match &attribute {
        Some(attr) => item.get_attr(attr).unwrap_or_default(),
        None => item.clone(),
    };
    let mut items = items(value)?;
    let mut failure = None;
    items.sort_by(|a, b| {
        ops::order(&key(a), &key(b)).unwrap_or_else(|err| {
            failure.get_or_insert(err);
            std::cmp::Ordering::Equal
        })
    });
    if let Some(err) = failure {
        return Err(err);
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::from(items))
}

fn split(value: &Value, args: &Args) -> Result<Value, String> {
    let s = text(value);
    let parts: Vec<Value> = match args.text(0, "sep") {
        Some(sep) if !sep.is_empty() => s.split(&*sep).map(Value::from).collect(),
        _ => s.split_whitespace().map(Value::from).collect(),
    };
    Ok(Value::from(parts))
}

fn string(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(like(value, value.to_output()))
}

fn striptags(value: &Value, _: &Args) -> Result<Value, String> {
    let mut stripped = String::new();
    let mut in_tag = false;
    for c in text(value).chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                stripped.push(' ');
            }
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }
    Ok(Value::from(
        stripped.split_whitespace().collect::<Vec<_>>().join(" "),
    ))
}

fn sum(value: &Value, args: &Args) -> Result<Value, String> {
    let attribute = args.text(0, "attribute");
    let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
    for item in items(value)? {
        let item = match &attribute {
            Some(attr) => item.get_attr(attr).unwrap_or_default(),
            None => item,
        };
        total = ops::binary(BinOpKind::Add, &total, &item)?;
    }
    Ok(total)
}

fn truncate(value: &Value, args: &Args) -> Result<Value, String> {
    let length = usize::try_from(args.int(0, "length", 255)?).unwrap_or(0);
    let killwords = args.flag(1, "killwords");
    let end = args.text(2, "end").unwrap_or(Cow::Borrowed("..."));
    let leeway = usize::try_from(args.int(3, "leeway", 0)?).unwrap_or(0);

    let s = text(value);
    let count = s.chars().count();
    if count <= length.saturating_add(leeway) {
        return Ok(value.clone());
    }
    let keep = length.saturating_sub(end.chars().count());
    let head: String = s.chars().take(keep).collect();
    let cut_mid_word = s.chars().nth(keep).is_some_and(|c| !c.is_whitespace());
    let head = if killwords || !cut_mid_word {
        head
    } else {
        match head.rfind(char::is_whitespace) {
            Some(index) => head.get(..index).unwrap_or(&head).trim_end().to_string(),
            None => head,
        }
    };
    Ok(Value::from(format!("{head}{end}")))
}

fn unique(value: &Value, _: &Args) -> Result<Value, String> {
    let mut seen: Vec<Value> = Vec::new();
    for item in items(value)? {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    Ok(Value::from(seen))
}

fn wordcount(value: &Value, _: &Args) -> Result<Value, String> {
    Ok(Value::from(text(value).split_whitespace().count()))
}

fn percent_encode(s: &str, out: &mut String) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(char::from(byte));
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
}

fn urlencode(value: &Value, _: &Args) -> Result<Value, String> {
    let mut out = String::new();
    match value {
        Value::Map(map) => {
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push('&');
                }
                percent_encode(k, &mut out);
                out.push('=');
                percent_encode(&v.to_output(), &mut out);
            }
        }
        other => percent_encode(&text(other), &mut out),
    }
    Ok(Value::from(out))
}

fn random(value: &Value, _: &Args) -> Result<Value, String> {
    let items = items(value)?;
    Ok(items.choose(&mut rand::rng()).cloned().unwrap_or_default())
}

fn shuffle(value: &Value, _: &Args) -> Result<Value, String> {
    let mut items = items(value)?;
    items.shuffle(&mut rand::rng());
    Ok(Value::from(items))
}

fn int_test(value: &Value, check: fn(i64) -> bool) -> Result<bool, String> {
    Ok(value.as_i64().is_some_and(check))
}

fn divisibleby(value: &Value, args: &Args) -> Result<bool, String> {
    let divisor = args.int(0, "num", 1)?;
    if divisor == 0 {
        return Err("divisibleby(0) is undefined".to_string());
    }
    Ok(value
        .as_i64()
        .is_some_and(|i| i.checked_rem(divisor).is_none_or(|r| r == 0)))
}

fn equal(value: &Value, args: &Args) -> Result<bool, String> {
    Ok(args.get(0, "other").is_some_and(|other| other == value))
}

fn is_in(value: &Value, args: &Args) -> Result<bool, String> {
    let container = args.get(0, "seq").cloned().unwrap_or_default();
    ops::contains(&container, value)
}

fn dict(args: &Args) -> Result<Value, String> {
    Ok(Value::Map(Arc::new(args.keyword().clone())))
}

fn len(args: &Args) -> Result<Value, String> {
    length(args.get(0, "value").unwrap_or(&Value::None), &Args::default())
}

fn range(args: &Args) -> Result<Value, String> {
    let ints = args
        .positional()
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| format!("range expects integers, not '{}'", v.kind_name()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err("range expects 1 to 3 integer arguments".to_string()),
    };
    if step == 0 {
        return Err("range step cannot be zero".to_string());
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if out.len() >= RANGE_LIMIT {
            return Err(format!("range exceeds the limit of {RANGE_LIMIT} items"));
        }
        out.push(Value::Int(i));
        i = i
            .checked_add(step)
            .ok_or_else(|| "integer overflow in range".to_string())?;
    }
    Ok(Value::from(out))
}
