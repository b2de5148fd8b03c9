//! Whitelisted functions callable from expressions.
//!
//! Anything not listed here is rejected by the parser as a forbidden
//! construct. Pure functions receive evaluated arguments; the higher-order
//! ones (`map`, `filter`, ...) are evaluated by the interpreter because they
//! take a lambda.

use super::forbidden::is_forbidden;
use super::interpreter::Budget;
use crate::error::ExpressionError;
use crate::value::{loose_eq, number, Map, Value, ValueExt};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256, Sha512};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write as _;

type Result<T> = std::result::Result<T, ExpressionError>;

pub(crate) type PureFn = fn(&mut Call<'_>) -> Result<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HigherOrder {
    Map,
    Filter,
    Find,
    Some,
    Every,
    Reduce,
    SortBy,
}

#[derive(Clone, Copy)]
pub(crate) enum FunctionKind {
    Pure(PureFn),
    HigherOrder(HigherOrder),
}

#[derive(Clone, Copy)]
pub(crate) struct Function {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub kind: FunctionKind,
}

const VARIADIC: usize = usize::MAX;

static NULL: Value = Value::Null;

const fn pure(name: &'static str, min_args: usize, max_args: usize, f: PureFn) -> Function {
    Function {
        name,
        min_args,
        max_args,
        kind: FunctionKind::Pure(f),
    }
}

const fn higher(name: &'static str, min_args: usize, max_args: usize, h: HigherOrder) -> Function {
    Function {
        name,
        min_args,
        max_args,
        kind: FunctionKind::HigherOrder(h),
    }
}

static FUNCTIONS: &[Function] = &[
    // ---- strings
    pure("upper", 1, 1, upper),
    pure("lower", 1, 1, lower),
    pure("trim", 1, 1, trim),
    pure("trimStart", 1, 1, trim_start),
    pure("trimEnd", 1, 1, trim_end),
    pure("split", 1, 2, split),
    pure("join", 1, 2, join),
    pure("replace", 3, 3, replace),
    pure("substring", 2, 3, substring),
    pure("slice", 2, 3, slice),
    pure("includes", 2, 2, includes),
    pure("startsWith", 2, 2, starts_with),
    pure("endsWith", 2, 2, ends_with),
    pure("indexOf", 2, 2, index_of),
    pure("padStart", 2, 3, pad_start),
    pure("padEnd", 2, 3, pad_end),
    pure("repeat", 2, 2, repeat),
    pure("length", 1, 1, length),
    pure("reverse", 1, 1, reverse),
    pure("concat", 1, VARIADIC, concat),
    pure("string", 1, 1, to_string),
    pure("number", 1, 1, to_number),
    pure("int", 1, 1, to_int),
    pure("boolean", 1, 1, to_boolean),
    pure("toFixed", 2, 2, to_fixed),
    // ---- arrays and objects
    pure("first", 1, 1, first),
    pure("last", 1, 1, last),
    pure("unique", 1, 1, unique),
    pure("sort", 1, 1, sort),
    pure("flatten", 1, 2, flatten),
    pure("compact", 1, 1, compact),
    pure("sum", 1, 1, sum),
    pure("avg", 1, 1, avg),
    pure("range", 1, 3, range),
    pure("keys", 1, 1, keys),
    pure("values", 1, 1, values),
    pure("entries", 1, 1, entries),
    pure("merge", 1, VARIADIC, merge),
    pure("get", 2, 3, get),
    higher("map", 2, 2, HigherOrder::Map),
    higher("filter", 2, 2, HigherOrder::Filter),
    higher("find", 2, 2, HigherOrder::Find),
    higher("some", 2, 2, HigherOrder::Some),
    higher("every", 2, 2, HigherOrder::Every),
    higher("reduce", 3, 3, HigherOrder::Reduce),
    higher("sortBy", 2, 2, HigherOrder::SortBy),
    // ---- math
    pure("abs", 1, 1, abs),
    pure("round", 1, 2, round),
    pure("floor", 1, 1, floor),
    pure("ceil", 1, 1, ceil),
    pure("pow", 2, 2, pow),
    pure("sqrt", 1, 1, sqrt),
    pure("clamp", 3, 3, clamp),
    pure("min", 1, VARIADIC, min),
    pure("max", 1, VARIADIC, max),
    // ---- dates
    pure("now", 0, 0, now),
    pure("formatDate", 1, 2, format_date),
    pure("parseDate", 1, 2, parse_date),
    pure("toMillis", 1, 1, to_millis),
    pure("fromMillis", 1, 1, from_millis),
    pure("dateAdd", 3, 3, date_add),
    pure("dateDiff", 2, 3, date_diff),
    // ---- encoding and hashing
    pure("base64Encode", 1, 1, base64_encode),
    pure("base64Decode", 1, 1, base64_decode),
    pure("urlEncode", 1, 1, url_encode),
    pure("urlDecode", 1, 1, url_decode),
    pure("jsonStringify", 1, 2, json_stringify),
    pure("jsonParse", 1, 1, json_parse),
    pure("md5", 1, 1, md5_hex),
    pure("sha256", 1, 1, sha256_hex),
    pure("sha512", 1, 1, sha512_hex),
    // ---- types
    pure("typeOf", 1, 1, type_of),
    pure("isEmpty", 1, 1, is_empty),
    pure("ifEmpty", 2, 2, if_empty),
];

/// Alternative spellings, mostly the JavaScript method names.
static ALIASES: &[(&str, &str)] = &[
    ("toUpperCase", "upper"),
    ("toLowerCase", "lower"),
    ("toString", "string"),
    ("replaceAll", "replace"),
    ("contains", "includes"),
    ("uniq", "unique"),
    ("toNumber", "number"),
    ("parseInt", "int"),
    ("parseFloat", "number"),
    ("toJson", "jsonStringify"),
    ("parseJson", "jsonParse"),
];

pub(crate) fn lookup(name: &str) -> Option<&'static Function> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, target)| *target)
        .unwrap_or(name);
    FUNCTIONS.iter().find(|f| f.name == canonical)
}

/// Names of every callable function, aliases included.
pub fn function_names() -> impl Iterator<Item = &'static str> {
    FUNCTIONS
        .iter()
        .map(|f| f.name)
        .chain(ALIASES.iter().map(|(alias, _)| *alias))
}

/// Evaluated arguments of one pure call plus the budget it charges.
pub(crate) struct Call<'a> {
    pub name: &'static str,
    pub args: Vec<Value>,
    pub budget: &'a mut Budget,
    pub now: DateTime<Utc>,
    pub offset: usize,
}

impl Call<'_> {
    fn arg(&self, i: usize) -> &Value {
        self.args.get(i).unwrap_or(&NULL)
    }

    fn error(&self, message: impl std::fmt::Display) -> ExpressionError {
        ExpressionError::runtime(format!("{}(): {}", self.name, message), self.offset)
    }

    fn type_error(&self, i: usize, expected: &str) -> ExpressionError {
        self.error(format!(
            "argument {} must be {}, got {}",
            i + 1,
            expected,
            self.arg(i).type_name()
        ))
    }

    fn string(&self, i: usize) -> Result<&str> {
        self.arg(i).as_str().ok_or_else(|| self.type_error(i, "a string"))
    }

    fn opt_string(&self, i: usize) -> Result<Option<&str>> {
        match self.arg(i) {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(self.type_error(i, "a string")),
        }
    }

    fn number(&self, i: usize) -> Result<f64> {
        self.arg(i).to_f64().ok_or_else(|| self.type_error(i, "a number"))
    }

    fn opt_number(&self, i: usize) -> Result<Option<f64>> {
        match self.arg(i) {
            Value::Null => Ok(None),
            v => v.to_f64().map(Some).ok_or_else(|| self.type_error(i, "a number")),
        }
    }

    fn array(&self, i: usize) -> Result<&Vec<Value>> {
        self.arg(i).as_array().ok_or_else(|| self.type_error(i, "an array"))
    }

    fn object(&self, i: usize) -> Result<&Map<String, Value>> {
        self.arg(i).as_object().ok_or_else(|| self.type_error(i, "an object"))
    }

    fn take(&mut self, i: usize) -> Value {
        self.args.get_mut(i).map(Value::take).unwrap_or(Value::Null)
    }

    fn charge(&mut self, work: usize) -> Result<()> {
        self.budget.charge(work as u64, self.offset)
    }

    fn text(&mut self, s: String) -> Result<Value> {
        self.budget.check_string(s.len(), self.offset)?;
        Ok(Value::String(s))
    }

    fn list(&mut self, items: Vec<Value>) -> Result<Value> {
        self.budget.check_collection(items.len(), self.offset)?;
        Ok(Value::Array(items))
    }

    fn date(&self, i: usize) -> Result<DateTime<Utc>> {
        match self.arg(i) {
            Value::Number(n) => n
                .as_f64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
                .ok_or_else(|| self.error("timestamp out of range")),
            Value::String(s) => {
                parse_datetime(s).ok_or_else(|| self.error(format!("cannot parse date '{s}'")))
            }
            _ => Err(self.type_error(i, "a date string or milliseconds")),
        }
    }
}

/// Ordering used by comparisons and `sort`: numbers by value, strings
/// lexically. Other combinations are unordered.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC) and `YYYY-MM-DD`.
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

/// RFC 3339 with millisecond precision, the string form of dates in expressions.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---- strings

fn upper(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.to_uppercase();
    c.text(s)
}

fn lower(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.to_lowercase();
    c.text(s)
}

fn trim(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.trim().to_string();
    c.text(s)
}

fn trim_start(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.trim_start().to_string();
    c.text(s)
}

fn trim_end(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.trim_end().to_string();
    c.text(s)
}

fn split(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?;
    let parts: Vec<Value> = match c.opt_string(1)? {
        None => vec![Value::String(s.to_string())],
        Some("") => s.chars().map(|ch| Value::String(ch.to_string())).collect(),
        Some(sep) => s.split(sep).map(|p| Value::String(p.to_string())).collect(),
    };
    let work = s.len();
    c.charge(work)?;
    c.list(parts)
}

fn join(c: &mut Call<'_>) -> Result<Value> {
    let sep = c.opt_string(1)?.unwrap_or(",");
    let items = c.array(0)?;
    let work = items.len();
    let joined = items
        .iter()
        .map(ValueExt::to_display_string)
        .collect::<Vec<_>>()
        .join(sep);
    c.charge(work)?;
    c.text(joined)
}

fn replace(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.to_string();
    let from = c.string(1)?.to_string();
    let to = c.string(2)?.to_string();
    if from.is_empty() {
        return Err(c.error("search string must not be empty"));
    }
    // Bound the result before allocating it.
    let hits = s.matches(from.as_str()).count();
    let projected = s.len() + hits * to.len();
    c.budget.check_string(projected, c.offset)?;
    let out = s.replace(from.as_str(), &to);
    c.charge(s.len())?;
    c.text(out)
}

/// Resolve a possibly negative index against `len`, clamped to `0..=len`.
fn relative_index(index: f64, len: usize) -> usize {
    let index = index.trunc();
    if index < 0.0 {
        len.saturating_sub((-index) as usize)
    } else {
        (index as usize).min(len)
    }
}

fn substring(c: &mut Call<'_>) -> Result<Value> {
    let chars: Vec<char> = c.string(0)?.chars().collect();
    let len = chars.len();
    let clamp = |n: f64| (n.max(0.0) as usize).min(len);
    let mut start = clamp(c.number(1)?);
    let mut end = c.opt_number(2)?.map(clamp).unwrap_or(len);
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }
    let out: String = chars[start..end].iter().collect();
    c.text(out)
}

fn slice(c: &mut Call<'_>) -> Result<Value> {
    let start = c.number(1)?;
    let end = c.opt_number(2)?;
    match c.arg(0) {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let from = relative_index(start, chars.len());
            let to = end.map(|e| relative_index(e, chars.len())).unwrap_or(chars.len());
            let out: String = chars[from..to.max(from)].iter().collect();
            c.text(out)
        }
        Value::Array(items) => {
            let from = relative_index(start, items.len());
            let to = end.map(|e| relative_index(e, items.len())).unwrap_or(items.len());
            let out = items[from..to.max(from)].to_vec();
            c.list(out)
        }
        _ => Err(c.type_error(0, "a string or an array")),
    }
}

fn includes(c: &mut Call<'_>) -> Result<Value> {
    match (c.arg(0), c.arg(1)) {
        (Value::String(s), Value::String(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
        (Value::String(_), _) => Err(c.type_error(1, "a string")),
        (Value::Array(items), needle) => {
            let found = items.iter().any(|item| loose_eq(item, needle));
            let work = items.len();
            c.charge(work)?;
            Ok(Value::Bool(found))
        }
        (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
        _ => Err(c.type_error(0, "a string, an array or an object")),
    }
}

fn starts_with(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::Bool(c.string(0)?.starts_with(c.string(1)?)))
}

fn ends_with(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::Bool(c.string(0)?.ends_with(c.string(1)?)))
}

fn index_of(c: &mut Call<'_>) -> Result<Value> {
    let position = match (c.arg(0), c.arg(1)) {
        (Value::String(s), Value::String(needle)) => s
            .find(needle.as_str())
            .map(|byte| s[..byte].chars().count()),
        (Value::String(_), _) => return Err(c.type_error(1, "a string")),
        (Value::Array(items), needle) => items.iter().position(|item| loose_eq(item, needle)),
        _ => return Err(c.type_error(0, "a string or an array")),
    };
    Ok(position.map(|p| Value::from(p as u64)).unwrap_or_else(|| Value::from(-1)))
}

fn pad(c: &mut Call<'_>, at_start: bool) -> Result<Value> {
    let s = c.string(0)?.to_string();
    let target = c.number(1)?.max(0.0) as usize;
    let fill = c.opt_string(2)?.unwrap_or(" ").to_string();
    let current = s.chars().count();
    if target <= current || fill.is_empty() {
        return c.text(s);
    }
    c.budget.check_string(target, c.offset)?;
    let padding: String = fill.chars().cycle().take(target - current).collect();
    let out = if at_start {
        format!("{padding}{s}")
    } else {
        format!("{s}{padding}")
    };
    c.text(out)
}

fn pad_start(c: &mut Call<'_>) -> Result<Value> {
    pad(c, true)
}

fn pad_end(c: &mut Call<'_>) -> Result<Value> {
    pad(c, false)
}

fn repeat(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?.to_string();
    let count = c.number(1)?;
    if count < 0.0 || !count.is_finite() {
        return Err(c.error("count must be a non-negative number"));
    }
    let count = count as usize;
    c.budget
        .check_string(s.len().saturating_mul(count), c.offset)?;
    let out = s.repeat(count);
    c.text(out)
}

fn length(c: &mut Call<'_>) -> Result<Value> {
    let len = match c.arg(0) {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        _ => return Err(c.type_error(0, "a string, an array or an object")),
    };
    Ok(Value::from(len as u64))
}

fn reverse(c: &mut Call<'_>) -> Result<Value> {
    match c.take(0) {
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        Value::Array(mut items) => {
            items.reverse();
            Ok(Value::Array(items))
        }
        other => {
            c.args[0] = other;
            Err(c.type_error(0, "a string or an array"))
        }
    }
}

fn concat(c: &mut Call<'_>) -> Result<Value> {
    if c.arg(0).is_array() {
        let mut out = Vec::new();
        for value in std::mem::take(&mut c.args) {
            match value {
                Value::Array(items) => out.extend(items),
                other => out.push(other),
            }
            c.budget.check_collection(out.len(), c.offset)?;
        }
        c.charge(out.len())?;
        return c.list(out);
    }
    let mut out = String::new();
    for value in &c.args {
        out.push_str(&value.to_display_string());
        c.budget.check_string(out.len(), c.offset)?;
    }
    c.text(out)
}

fn to_string(c: &mut Call<'_>) -> Result<Value> {
    let s = c.arg(0).to_display_string();
    c.text(s)
}

fn coerce_number(c: &Call<'_>, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| c.error("invalid number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(0.0);
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| c.error(format!("cannot convert '{s}' to a number")))
        }
        other => Err(c.error(format!("cannot convert {} to a number", other.type_name()))),
    }
}

fn to_number(c: &mut Call<'_>) -> Result<Value> {
    let n = coerce_number(c, c.arg(0))?;
    Ok(number(n))
}

fn to_int(c: &mut Call<'_>) -> Result<Value> {
    let n = coerce_number(c, c.arg(0))?;
    Ok(number(n.trunc()))
}

fn to_boolean(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::Bool(c.arg(0).is_truthy()))
}

fn to_fixed(c: &mut Call<'_>) -> Result<Value> {
    let n = c.number(0)?;
    let digits = c.number(1)?.clamp(0.0, 20.0) as usize;
    Ok(Value::String(format!("{n:.digits$}")))
}

// ---- arrays and objects

fn first(c: &mut Call<'_>) -> Result<Value> {
    Ok(c.array(0)?.first().cloned().unwrap_or(Value::Null))
}

fn last(c: &mut Call<'_>) -> Result<Value> {
    Ok(c.array(0)?.last().cloned().unwrap_or(Value::Null))
}

fn unique(c: &mut Call<'_>) -> Result<Value> {
    let items = c.array(0)?;
    let mut seen = HashSet::new();
    let out: Vec<Value> = items
        .iter()
        .filter(|item| seen.insert(item.to_string()))
        .cloned()
        .collect();
    let work = items.len();
    c.charge(work)?;
    c.list(out)
}

fn sort(c: &mut Call<'_>) -> Result<Value> {
    let Value::Array(mut items) = c.take(0) else {
        return Err(c.error("argument 1 must be an array"));
    };
    let comparable = items.windows(2).all(|w| compare(&w[0], &w[1]).is_some());
    if !comparable {
        return Err(c.error("can only sort arrays of all numbers or all strings"));
    }
    let work = items.len() * (usize::BITS - items.len().leading_zeros()) as usize;
    c.charge(work)?;
    items.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
    Ok(Value::Array(items))
}

fn flatten_into(value: Value, depth: usize, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) if depth > 0 => {
            for item in items {
                flatten_into(item, depth - 1, out);
            }
        }
        other => out.push(other),
    }
}

fn flatten(c: &mut Call<'_>) -> Result<Value> {
    let depth = c.opt_number(1)?.unwrap_or(1.0).clamp(0.0, 64.0) as usize;
    let Value::Array(items) = c.take(0) else {
        return Err(c.error("argument 1 must be an array"));
    };
    let mut out = Vec::new();
    for item in items {
        flatten_into(item, depth, &mut out);
        c.budget.check_collection(out.len(), c.offset)?;
    }
    c.charge(out.len())?;
    Ok(Value::Array(out))
}

fn compact(c: &mut Call<'_>) -> Result<Value> {
    let out: Vec<Value> = c
        .array(0)?
        .iter()
        .filter(|v| !matches!(v, Value::Null) && v.as_str() != Some(""))
        .cloned()
        .collect();
    Ok(Value::Array(out))
}

fn numbers(c: &Call<'_>, items: &[Value]) -> Result<Vec<f64>> {
    items
        .iter()
        .map(|v| {
            v.to_f64()
                .ok_or_else(|| c.error(format!("expected numbers, found {}", v.type_name())))
        })
        .collect()
}

fn sum(c: &mut Call<'_>) -> Result<Value> {
    let values = numbers(c, c.array(0)?)?;
    c.charge(values.len())?;
    Ok(number(values.iter().sum()))
}

fn avg(c: &mut Call<'_>) -> Result<Value> {
    let values = numbers(c, c.array(0)?)?;
    c.charge(values.len())?;
    if values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(number(values.iter().sum::<f64>() / values.len() as f64))
}

fn range(c: &mut Call<'_>) -> Result<Value> {
    let (start, end) = match c.opt_number(1)? {
        Some(end) => (c.number(0)?, end),
        None => (0.0, c.number(0)?),
    };
    let step = c.opt_number(2)?.unwrap_or(if end >= start { 1.0 } else { -1.0 });
    if step == 0.0 || !step.is_finite() {
        return Err(c.error("step must be a non-zero number"));
    }
    let count = ((end - start) / step).ceil().max(0.0);
    c.budget
        .check_collection(count.min(usize::MAX as f64) as usize, c.offset)?;
    let count = count as usize;
    c.charge(count)?;
    let out = (0..count).map(|i| number(start + step * i as f64)).collect();
    Ok(Value::Array(out))
}

fn keys(c: &mut Call<'_>) -> Result<Value> {
    let out = c.object(0)?.keys().cloned().map(Value::String).collect();
    Ok(Value::Array(out))
}

fn values(c: &mut Call<'_>) -> Result<Value> {
    let out = c.object(0)?.values().cloned().collect();
    Ok(Value::Array(out))
}

fn entries(c: &mut Call<'_>) -> Result<Value> {
    let out = c
        .object(0)?
        .iter()
        .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
        .collect();
    Ok(Value::Array(out))
}

fn merge(c: &mut Call<'_>) -> Result<Value> {
    let mut out = Map::new();
    for (i, value) in std::mem::take(&mut c.args).into_iter().enumerate() {
        match value {
            Value::Object(map) => out.extend(map),
            Value::Null => {}
            other => {
                return Err(c.error(format!(
                    "argument {} must be an object, got {}",
                    i + 1,
                    other.type_name()
                )))
            }
        }
        c.budget.check_collection(out.len(), c.offset)?;
    }
    Ok(Value::Object(out))
}

/// `get(value, "a.b[0].c", default)`: safe deep lookup.
fn get(c: &mut Call<'_>) -> Result<Value> {
    let path = c.string(1)?.replace('[', ".").replace(']', "");
    let mut current = c.arg(0);
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if is_forbidden(segment) {
            return Err(ExpressionError::forbidden(
                format!("'{segment}' is not allowed in expressions"),
                c.offset,
            ));
        }
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(c.arg(2).clone()),
        }
    }
    Ok(current.clone())
}

// ---- math

fn abs(c: &mut Call<'_>) -> Result<Value> {
    Ok(number(c.number(0)?.abs()))
}

fn round(c: &mut Call<'_>) -> Result<Value> {
    let n = c.number(0)?;
    let digits = c.opt_number(1)?.unwrap_or(0.0).clamp(0.0, 15.0) as i32;
    let factor = 10f64.powi(digits);
    Ok(number((n * factor).round() / factor))
}

fn floor(c: &mut Call<'_>) -> Result<Value> {
    Ok(number(c.number(0)?.floor()))
}

fn ceil(c: &mut Call<'_>) -> Result<Value> {
    Ok(number(c.number(0)?.ceil()))
}

fn pow(c: &mut Call<'_>) -> Result<Value> {
    Ok(number(c.number(0)?.powf(c.number(1)?)))
}

fn sqrt(c: &mut Call<'_>) -> Result<Value> {
    let n = c.number(0)?;
    if n < 0.0 {
        return Err(c.error("square root of a negative number"));
    }
    Ok(number(n.sqrt()))
}

fn clamp(c: &mut Call<'_>) -> Result<Value> {
    let (n, lo, hi) = (c.number(0)?, c.number(1)?, c.number(2)?);
    if lo > hi {
        return Err(c.error("lower bound is above upper bound"));
    }
    Ok(number(n.clamp(lo, hi)))
}

/// `min(1, 2)` or `min([1, 2])`.
fn extreme(c: &mut Call<'_>, pick: fn(f64, f64) -> f64) -> Result<Value> {
    let values = match (c.args.len(), c.arg(0)) {
        (1, Value::Array(items)) => numbers(c, items)?,
        _ => numbers(c, &c.args)?,
    };
    c.charge(values.len())?;
    Ok(values.into_iter().reduce(pick).map(number).unwrap_or(Value::Null))
}

fn min(c: &mut Call<'_>) -> Result<Value> {
    extreme(c, f64::min)
}

fn max(c: &mut Call<'_>) -> Result<Value> {
    extreme(c, f64::max)
}

// ---- dates

fn now(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::String(format_datetime(&c.now)))
}

fn format_date(c: &mut Call<'_>) -> Result<Value> {
    let dt = c.date(0)?;
    let Some(fmt) = c.opt_string(1)? else {
        return Ok(Value::String(format_datetime(&dt)));
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.contains(&Item::Error) {
        return Err(c.error(format!("invalid date format '{fmt}'")));
    }
    let mut out = String::new();
    write!(out, "{}", dt.format_with_items(items.iter()))
        .map_err(|_| c.error(format!("cannot format date with '{fmt}'")))?;
    c.text(out)
}

fn parse_date(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?;
    let parsed = match c.opt_string(1)? {
        None => parse_datetime(s),
        Some(fmt) => NaiveDateTime::parse_from_str(s, fmt)
            .map(|naive| naive.and_utc())
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
    };
    parsed
        .map(|dt| Value::String(format_datetime(&dt)))
        .ok_or_else(|| c.error(format!("cannot parse date '{s}'")))
}

fn to_millis(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::from(c.date(0)?.timestamp_millis()))
}

fn from_millis(c: &mut Call<'_>) -> Result<Value> {
    let ms = c.number(0)?;
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|dt| Value::String(format_datetime(&dt)))
        .ok_or_else(|| c.error("timestamp out of range"))
}

fn unit_millis(c: &Call<'_>, i: usize) -> Result<f64> {
    let unit = c.opt_string(i)?.unwrap_or("ms");
    let ms = match unit {
        "ms" | "millisecond" | "milliseconds" => 1.0,
        "s" | "second" | "seconds" => 1_000.0,
        "m" | "minute" | "minutes" => 60_000.0,
        "h" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        "w" | "week" | "weeks" => 604_800_000.0,
        other => return Err(c.error(format!("unknown time unit '{other}'"))),
    };
    Ok(ms)
}

fn date_add(c: &mut Call<'_>) -> Result<Value> {
    let dt = c.date(0)?;
    let delta = c.number(1)? * unit_millis(c, 2)?;
    // Roughly +/- 285,000 years; beyond that chrono cannot represent the result.
    if !delta.is_finite() || delta.abs() > 9.0e15 {
        return Err(c.error("duration out of range"));
    }
    dt.checked_add_signed(chrono::Duration::milliseconds(delta as i64))
        .map(|dt| Value::String(format_datetime(&dt)))
        .ok_or_else(|| c.error("date out of range"))
}

fn date_diff(c: &mut Call<'_>) -> Result<Value> {
    let a = c.date(0)?;
    let b = c.date(1)?;
    let unit = unit_millis(c, 2)?;
    let ms = (a - b).num_milliseconds() as f64;
    Ok(number(ms / unit))
}

// ---- encoding and hashing

fn base64_encode(c: &mut Call<'_>) -> Result<Value> {
    let out = BASE64.encode(c.string(0)?.as_bytes());
    c.text(out)
}

fn base64_decode(c: &mut Call<'_>) -> Result<Value> {
    let bytes = BASE64
        .decode(c.string(0)?.trim())
        .map_err(|e| c.error(format!("invalid base64: {e}")))?;
    let out = String::from_utf8(bytes).map_err(|_| c.error("decoded bytes are not valid UTF-8"))?;
    c.text(out)
}

fn url_encode(c: &mut Call<'_>) -> Result<Value> {
    let mut out = String::new();
    for byte in c.string(0)?.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    c.text(out)
}

fn url_decode(c: &mut Call<'_>) -> Result<Value> {
    let input = c.string(0)?.as_bytes();
    let mut bytes = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| c.error(format!("invalid escape at position {i}")))?;
                bytes.push(hex);
                i += 3;
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            other => {
                bytes.push(other);
                i += 1;
            }
        }
    }
    let out = String::from_utf8(bytes).map_err(|_| c.error("decoded bytes are not valid UTF-8"))?;
    c.text(out)
}

fn json_stringify(c: &mut Call<'_>) -> Result<Value> {
    let pretty = c.arg(1).is_truthy();
    let out = if pretty {
        serde_json::to_string_pretty(c.arg(0))
    } else {
        serde_json::to_string(c.arg(0))
    }
    .map_err(|e| c.error(e))?;
    c.text(out)
}

fn json_parse(c: &mut Call<'_>) -> Result<Value> {
    let s = c.string(0)?;
    let work = s.len();
    let value: Value = serde_json::from_str(s).map_err(|e| c.error(format!("invalid JSON: {e}")))?;
    c.charge(work)?;
    Ok(value)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn md5_hex(c: &mut Call<'_>) -> Result<Value> {
    let digest = md5::compute(c.string(0)?.as_bytes());
    Ok(Value::String(format!("{digest:x}")))
}

fn sha256_hex(c: &mut Call<'_>) -> Result<Value> {
    let digest = Sha256::digest(c.string(0)?.as_bytes());
    Ok(Value::String(hex(&digest)))
}

fn sha512_hex(c: &mut Call<'_>) -> Result<Value> {
    let digest = Sha512::digest(c.string(0)?.as_bytes());
    Ok(Value::String(hex(&digest)))
}

// ---- types

fn type_of(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::String(c.arg(0).type_name().to_string()))
}

fn empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_empty(c: &mut Call<'_>) -> Result<Value> {
    Ok(Value::Bool(empty(c.arg(0))))
}

fn if_empty(c: &mut Call<'_>) -> Result<Value> {
    if empty(c.arg(0)) {
        Ok(c.take(1))
    } else {
        Ok(c.take(0))
    }
}
