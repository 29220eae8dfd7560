//! Type conversion from wire values to typed column values
//!
//! wal2json carries every column as a JSON value next to its PostgreSQL type
//! name; the snapshotter produces text. [`TypeConverter::convert`] turns the
//! `(type name, value)` pair into a [`ColumnValue`].
//!
//! Type names are matched case-insensitively with type modifiers removed, so
//! `character varying(255)` and `VARCHAR` both read as text. Array types are
//! recognised both as `_int4` (catalog form) and `integer[]` (formatted form).

use crate::error::{CaptureError, Result};
use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc,
};
use serde_json::Value;

/// Zoned layouts, tried before the zone-less ones
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S%#z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%dT%H:%M:%S%#z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A converted column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<FixedOffset>),
    Document(Value),
    Array(Vec<ColumnValue>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Short name of the variant, used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Integer(_) => "integer",
            ColumnValue::Float(_) => "float",
            ColumnValue::Text(_) => "text",
            ColumnValue::Boolean(_) => "boolean",
            ColumnValue::Timestamp(_) => "timestamp",
            ColumnValue::Document(_) => "document",
            ColumnValue::Array(_) => "array",
        }
    }

    /// Canonical text form; timestamps render as RFC 3339 with microseconds
    pub fn render(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Integer(v) => v.to_string(),
            ColumnValue::Float(v) => v.to_string(),
            ColumnValue::Text(v) => v.clone(),
            ColumnValue::Boolean(v) => v.to_string(),
            ColumnValue::Timestamp(v) => render_timestamp(v),
            ColumnValue::Document(v) => v.to_string(),
            ColumnValue::Array(_) => self.to_json().to_string(),
        }
    }

    /// JSON form of the value
    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Integer(v) => Value::from(*v),
            ColumnValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
            ColumnValue::Text(v) => Value::String(v.clone()),
            ColumnValue::Boolean(v) => Value::Bool(*v),
            ColumnValue::Timestamp(v) => Value::String(render_timestamp(v)),
            ColumnValue::Document(v) => v.clone(),
            ColumnValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl std::fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn mismatch(expected: &str, value: &ColumnValue) -> CaptureError {
    CaptureError::conversion(format!(
        "expected {expected}, got {} value",
        value.kind_name()
    ))
}

impl TryFrom<ColumnValue> for i64 {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Integer(v) => Ok(v),
            other => Err(mismatch("integer", &other)),
        }
    }
}

impl TryFrom<ColumnValue> for i32 {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        let wide = i64::try_from(value)?;
        i32::try_from(wide)
            .map_err(|_| CaptureError::conversion(format!("{wide} does not fit in i32")))
    }
}

impl TryFrom<ColumnValue> for f64 {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Float(v) => Ok(v),
            ColumnValue::Integer(v) => Ok(v as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl TryFrom<ColumnValue> for String {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Text(v) => Ok(v),
            ColumnValue::Null => Err(mismatch("text", &ColumnValue::Null)),
            other => Ok(other.render()),
        }
    }
}

impl TryFrom<ColumnValue> for bool {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Boolean(v) => Ok(v),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl TryFrom<ColumnValue> for DateTime<FixedOffset> {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Timestamp(v) => Ok(v),
            other => Err(mismatch("timestamp", &other)),
        }
    }
}

impl TryFrom<ColumnValue> for Value {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Document(v) => Ok(v),
            other => Ok(other.to_json()),
        }
    }
}

impl TryFrom<ColumnValue> for Vec<ColumnValue> {
    type Error = CaptureError;

    fn try_from(value: ColumnValue) -> Result<Self> {
        match value {
            ColumnValue::Array(items) => Ok(items),
            other => Err(mismatch("array", &other)),
        }
    }
}

/// Render a timestamp in canonical form
pub fn render_timestamp(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Converts wire values using PostgreSQL type names
///
/// Timestamps without an explicit offset are read as wall-clock time in the
/// converter's zone.
///
/// # Example
///
/// ```
/// use pg_capture::{ColumnValue, TypeConverter};
/// use serde_json::json;
///
/// let converter = TypeConverter::default();
/// assert_eq!(
///     converter.convert("int4", &json!("42")).unwrap(),
///     ColumnValue::Integer(42)
/// );
/// assert_eq!(
///     converter.convert("_text", &json!("{a,\"b c\",NULL}")).unwrap(),
///     ColumnValue::Array(vec![
///         ColumnValue::Text("a".into()),
///         ColumnValue::Text("b c".into()),
///         ColumnValue::Null,
///     ])
/// );
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TypeConverter {
    zone: FixedOffset,
}

impl Default for TypeConverter {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl TypeConverter {
    pub fn new(zone: FixedOffset) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    /// Convert one wire value according to its type name
    pub fn convert(&self, type_name: &str, value: &Value) -> Result<ColumnValue> {
        if value.is_null() {
            return Ok(ColumnValue::Null);
        }

        let normalized = normalize_type_name(type_name);
        if let Some(element_type) = array_element_type(&normalized) {
            return self.convert_array(element_type, value);
        }

        match normalized.as_str() {
            "int2" | "smallint" | "smallserial" => {
                to_integer(value, i64::from(i16::MIN), i64::from(i16::MAX))
            }
            "int4" | "integer" | "int" | "serial" => {
                to_integer(value, i64::from(i32::MIN), i64::from(i32::MAX))
            }
            "int8" | "bigint" | "bigserial" => to_integer(value, i64::MIN, i64::MAX),
            "float4" | "real" | "float8" | "double precision" | "numeric" | "decimal" => {
                to_float(value)
            }
            "varchar" | "character varying" | "char" | "character" | "text" | "bpchar"
            | "name" => Ok(ColumnValue::Text(to_text(value))),
            "bool" | "boolean" => to_boolean(value),
            "timestamp" | "timestamp without time zone" => self
                .parse_timestamp(expect_text(value, "timestamp")?, false)
                .map(ColumnValue::Timestamp),
            "timestamptz" | "timestamp with time zone" => self
                .parse_timestamp(expect_text(value, "timestamptz")?, true)
                .map(ColumnValue::Timestamp),
            "date" => self
                .parse_date(expect_text(value, "date")?)
                .map(ColumnValue::Timestamp),
            "json" | "jsonb" => to_document(value),
            "inet" | "cidr" | "uuid" => Ok(ColumnValue::Text(to_text(value))),
            _ => Ok(ColumnValue::Text(to_text(value))),
        }
    }

    /// Parse a timestamp using the accepted layouts, first match wins
    ///
    /// When `keep_offset` is false a value that carries an offset is moved to
    /// the converter's zone; zone-less values are always read in that zone.
    pub fn parse_timestamp(&self, text: &str, keep_offset: bool) -> Result<DateTime<FixedOffset>> {
        let text = text.trim();

        for format in ZONED_FORMATS {
            if let Ok(parsed) = DateTime::parse_from_str(text, format) {
                return Ok(self.place(parsed, keep_offset));
            }
        }

        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return self.localize(naive, text);
            }
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Ok(self.place(parsed, keep_offset));
        }

        Err(CaptureError::conversion(format!(
            "unable to parse timestamp: {text:?}"
        )))
    }

    /// Parse a date as midnight in the converter's zone
    ///
    /// Full timestamps are accepted too; their calendar date is kept.
    pub fn parse_date(&self, text: &str) -> Result<DateTime<FixedOffset>> {
        let text = text.trim();
        let date = match NaiveDate::parse_from_str(text, DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => self
                .parse_timestamp(text, false)
                .map_err(|_| CaptureError::conversion(format!("unable to parse date: {text:?}")))?
                .date_naive(),
        };

        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| CaptureError::conversion(format!("invalid date: {text:?}")))?;
        self.localize(midnight, text)
    }

    fn place(&self, parsed: DateTime<FixedOffset>, keep_offset: bool) -> DateTime<FixedOffset> {
        if keep_offset {
            parsed
        } else {
            parsed.with_timezone(&self.zone)
        }
    }

    fn localize(&self, naive: NaiveDateTime, text: &str) -> Result<DateTime<FixedOffset>> {
        self.zone
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| CaptureError::conversion(format!("timestamp out of range: {text:?}")))
    }

    fn convert_array(&self, element_type: &str, value: &Value) -> Result<ColumnValue> {
        match value {
            Value::Array(items) => self.convert_json_items(element_type, items),
            Value::String(text) => {
                let trimmed = text.trim();
                let literal = strip_dimensions(trimmed);
                if literal.starts_with('{') {
                    let elements = parse_array_literal(literal)?;
                    self.convert_literal(element_type, elements)
                } else if trimmed.starts_with('[') {
                    let items: Vec<Value> = serde_json::from_str(trimmed).map_err(|e| {
                        CaptureError::conversion(format!("parsing array {trimmed:?}: {e}"))
                    })?;
                    self.convert_json_items(element_type, &items)
                } else {
                    Err(CaptureError::conversion(format!(
                        "array value must be an array literal, got {trimmed:?}"
                    )))
                }
            }
            other => Err(CaptureError::conversion(format!(
                "array value must be a string or array, got {other}"
            ))),
        }
    }

    fn convert_json_items(&self, element_type: &str, items: &[Value]) -> Result<ColumnValue> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Array(nested) => self.convert_json_items(element_type, nested),
                _ => self.convert(element_type, item).map_err(|e| {
                    CaptureError::conversion(format!("converting array element {i}: {e}"))
                }),
            })
            .collect::<Result<Vec<_>>>()
            .map(ColumnValue::Array)
    }

    fn convert_literal(
        &self,
        element_type: &str,
        elements: Vec<LiteralElement>,
    ) -> Result<ColumnValue> {
        elements
            .into_iter()
            .enumerate()
            .map(|(i, element)| match element {
                LiteralElement::Null => Ok(ColumnValue::Null),
                LiteralElement::Nested(inner) => self.convert_literal(element_type, inner),
                LiteralElement::Text(text) => self
                    .convert(element_type, &Value::String(text))
                    .map_err(|e| {
                        CaptureError::conversion(format!("converting array element {i}: {e}"))
                    }),
            })
            .collect::<Result<Vec<_>>>()
            .map(ColumnValue::Array)
    }
}

/// Lowercase, drop type modifiers, collapse whitespace
pub(crate) fn normalize_type_name(type_name: &str) -> String {
    let mut stripped = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for c in type_name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c.to_ascii_lowercase()),
            _ => {}
        }
    }
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn array_element_type(normalized: &str) -> Option<&str> {
    if let Some(base) = normalized.strip_suffix("[]") {
        return Some(base.trim_end_matches("[]").trim_end());
    }
    normalized
        .strip_prefix('_')
        .filter(|base| !base.is_empty())
}

fn expect_text<'a>(value: &'a Value, type_name: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        CaptureError::conversion(format!("unexpected value for {type_name}: {value}"))
    })
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_integer(value: &Value, min: i64, max: i64) -> Result<ColumnValue> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && fits_i64(*f))
                .map(|f| f as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
    .ok_or_else(|| CaptureError::conversion(format!("unable to convert {value} to integer")))?;

    if parsed < min || parsed > max {
        return Err(CaptureError::conversion(format!(
            "{parsed} is out of range [{min}, {max}]"
        )));
    }
    Ok(ColumnValue::Integer(parsed))
}

/// `true` when a whole float converts to `i64` without saturating
pub(crate) fn fits_i64(value: f64) -> bool {
    value.is_finite() && value >= i64::MIN as f64 && value < i64::MAX as f64
}

fn to_float(value: &Value) -> Result<ColumnValue> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .map(ColumnValue::Float)
    .ok_or_else(|| CaptureError::conversion(format!("unable to convert {value} to float")))
}

pub(crate) fn parse_bool_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" => Some(true),
        "f" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn to_boolean(value: &Value) -> Result<ColumnValue> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(text) => parse_bool_text(text),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
    .map(ColumnValue::Boolean)
    .ok_or_else(|| CaptureError::conversion(format!("unable to convert {value} to boolean")))
}

pub(crate) fn to_document(value: &Value) -> Result<ColumnValue> {
    match value {
        Value::String(text) => serde_json::from_str(text)
            .map(ColumnValue::Document)
            .map_err(|e| CaptureError::conversion(format!("parsing JSON: {e}"))),
        other => Ok(ColumnValue::Document(other.clone())),
    }
}

/// `[1:3]={1,2,3}` carries explicit bounds before the literal
fn strip_dimensions(text: &str) -> &str {
    if text.starts_with('[') {
        if let Some(pos) = text.find("={") {
            return &text[pos + 1..];
        }
    }
    text
}

#[derive(Debug, Clone, PartialEq)]
enum LiteralElement {
    Null,
    Text(String),
    Nested(Vec<LiteralElement>),
}

/// Parse a PostgreSQL array literal such as `{1,2,"a b",NULL,{3,4}}`
fn parse_array_literal(text: &str) -> Result<Vec<LiteralElement>> {
    let mut chars = text.chars().peekable();
    if chars.next() != Some('{') {
        return Err(CaptureError::conversion(format!(
            "array literal must start with '{{': {text:?}"
        )));
    }

    let elements = parse_literal_items(&mut chars, text)?;

    if chars.any(|c| !c.is_whitespace()) {
        return Err(CaptureError::conversion(format!(
            "trailing characters after array literal: {text:?}"
        )));
    }
    Ok(elements)
}

fn parse_literal_items(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    text: &str,
) -> Result<Vec<LiteralElement>> {
    let unterminated = || CaptureError::conversion(format!("unterminated array literal: {text:?}"));
    let mut elements = Vec::new();

    skip_whitespace(chars);
    if chars.peek() == Some(&'}') {
        chars.next();
        return Ok(elements);
    }

    loop {
        skip_whitespace(chars);
        match chars.peek().copied() {
            None => return Err(unterminated()),
            Some('{') => {
                chars.next();
                elements.push(LiteralElement::Nested(parse_literal_items(chars, text)?));
            }
            Some('"') => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err(unterminated()),
                        Some('\\') => value.push(chars.next().ok_or_else(unterminated)?),
                        Some('"') => break,
                        Some(c) => value.push(c),
                    }
                }
                elements.push(LiteralElement::Text(value));
            }
            Some(_) => {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' || c == '}' {
                        break;
                    }
                    chars.next();
                    if c == '\\' {
                        value.push(chars.next().ok_or_else(unterminated)?);
                    } else {
                        value.push(c);
                    }
                }
                let value = value.trim();
                if value.eq_ignore_ascii_case("null") {
                    elements.push(LiteralElement::Null);
                } else {
                    elements.push(LiteralElement::Text(value.to_string()));
                }
            }
        }

        skip_whitespace(chars);
        match chars.next() {
            Some(',') => continue,
            Some('}') => return Ok(elements),
            _ => return Err(unterminated()),
        }
    }
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}
