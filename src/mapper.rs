//! Projection of change columns onto caller-defined records
//!
//! A destination type describes its fields once through [`Record::fields`].
//! [`StructMapper`] turns that description into a name table when it is built
//! and reuses it for every change:
//!
//! ```
//! use pg_capture::{ColumnValue, FieldKind, FieldSpec, Record, StructMapper, TypeConverter};
//! use serde_json::json;
//!
//! #[derive(Debug, Default)]
//! struct Order {
//!     id: i64,
//!     status: String,
//! }
//!
//! impl Record for Order {
//!     fn fields() -> Vec<FieldSpec<Self>> {
//!         vec![
//!             FieldSpec::new("Id", FieldKind::Integer, |o: &mut Order, v| {
//!                 o.id = v.try_into()?;
//!                 Ok(())
//!             }),
//!             FieldSpec::new("status", FieldKind::Text, |o: &mut Order, v| {
//!                 o.status = v.try_into()?;
//!                 Ok(())
//!             })
//!             .db("order_status"),
//!         ]
//!     }
//! }
//!
//! let mapper = StructMapper::<Order>::new(TypeConverter::default());
//! let mut order = Order::default();
//! mapper
//!     .apply(
//!         &mut order,
//!         &["ID".into(), "order_status".into()],
//!         &["int4".into(), "text".into()],
//!         &[json!("5"), json!("shipped")],
//!     )
//!     .unwrap();
//! assert_eq!(order.id, 5);
//! assert_eq!(order.status, "shipped");
//! ```

use crate::convert::{
    fits_i64, normalize_type_name, parse_bool_text, to_document, ColumnValue, TypeConverter,
};
use crate::error::{CaptureError, Result};
use crate::types::ChangeRecord;
use serde_json::Value;
use std::collections::HashMap;

/// Shape of a destination field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    Boolean,
    /// Always built by parsing the wire text as a timestamp
    Timestamp,
    /// Always built from JSON text or a structured value
    Document,
    Array,
}

/// Writes an already-coerced value into a field
pub type FieldSetter<T> = fn(&mut T, ColumnValue) -> Result<()>;

/// Description of one destination field
pub struct FieldSpec<T> {
    ident: &'static str,
    json: Option<&'static str>,
    db: Option<&'static str>,
    kind: FieldKind,
    set: FieldSetter<T>,
}

impl<T> FieldSpec<T> {
    pub fn new(ident: &'static str, kind: FieldKind, set: FieldSetter<T>) -> Self {
        Self {
            ident,
            json: None,
            db: None,
            kind,
            set,
        }
    }

    /// Serialization name; takes precedence over every other name
    pub fn json(mut self, name: &'static str) -> Self {
        self.json = Some(name);
        self
    }

    /// Storage column name, used when no serialization name is given
    pub fn db(mut self, name: &'static str) -> Self {
        self.db = Some(name);
        self
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Name columns are matched against; `-` means the field is never mapped
    pub fn lookup_name(&self) -> String {
        match (self.json, self.db) {
            (Some(json), _) if !json.is_empty() => json.to_string(),
            (_, Some(db)) if !db.is_empty() => db.to_string(),
            _ => self.ident.to_lowercase(),
        }
    }
}

impl<T> std::fmt::Debug for FieldSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSpec")
            .field("ident", &self.ident)
            .field("json", &self.json)
            .field("db", &self.db)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A destination type changes can be projected onto
pub trait Record: Default + Sized {
    fn fields() -> Vec<FieldSpec<Self>>;
}

/// Maps column triples onto a [`Record`]
#[derive(Debug)]
pub struct StructMapper<T> {
    converter: TypeConverter,
    fields: Vec<FieldSpec<T>>,
    /// lookup name -> index into `fields`, in declaration order
    names: Vec<(String, usize)>,
    exact: HashMap<String, usize>,
}

impl<T: Record> StructMapper<T> {
    pub fn new(converter: TypeConverter) -> Self {
        let fields = T::fields();
        let mut names = Vec::with_capacity(fields.len());
        let mut exact = HashMap::with_capacity(fields.len());

        for (index, field) in fields.iter().enumerate() {
            let name = field.lookup_name();
            if name == "-" {
                continue;
            }
            exact.entry(name.clone()).or_insert(index);
            names.push((name, index));
        }

        Self {
            converter,
            fields,
            names,
            exact,
        }
    }

    /// Lookup names of the mapped fields, in declaration order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|(name, _)| name.as_str())
    }

    fn lookup(&self, column: &str) -> Option<&FieldSpec<T>> {
        let index = self.exact.get(column).copied().or_else(|| {
            self.names
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, index)| *index)
        })?;
        self.fields.get(index)
    }

    /// Write every matching column into `target`
    ///
    /// Columns without a matching field are skipped and NULL leaves the field
    /// as it was.
    pub fn apply(
        &self,
        target: &mut T,
        names: &[String],
        types: &[String],
        values: &[Value],
    ) -> Result<()> {
        if names.len() != types.len() || names.len() != values.len() {
            return Err(CaptureError::conversion(format!(
                "column arrays differ in length: {} names, {} types, {} values",
                names.len(),
                types.len(),
                values.len()
            )));
        }

        for ((name, type_name), value) in names.iter().zip(types).zip(values) {
            let Some(field) = self.lookup(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            let converted = self
                .build(field.kind, type_name, value)
                .map_err(|e| CaptureError::conversion(format!("setting field {name}: {e}")))?;
            (field.set)(target, converted)
                .map_err(|e| CaptureError::conversion(format!("setting field {name}: {e}")))?;
        }

        Ok(())
    }

    /// Build a fresh record from a change's columns
    pub fn map_record(&self, record: &ChangeRecord) -> Result<T> {
        let mut target = T::default();
        self.apply(
            &mut target,
            &record.column_names,
            &record.column_types,
            &record.column_values,
        )?;
        Ok(target)
    }

    fn build(&self, kind: FieldKind, type_name: &str, value: &Value) -> Result<ColumnValue> {
        match kind {
            FieldKind::Document => to_document(value),
            FieldKind::Timestamp => {
                let text = value.as_str().ok_or_else(|| {
                    CaptureError::conversion(format!("expected timestamp text, got {value}"))
                })?;
                let timestamp = match normalize_type_name(type_name).as_str() {
                    "date" => self.converter.parse_date(text)?,
                    "timestamptz" | "timestamp with time zone" => {
                        self.converter.parse_timestamp(text, true)?
                    }
                    _ => self.converter.parse_timestamp(text, false)?,
                };
                Ok(ColumnValue::Timestamp(timestamp))
            }
            _ => coerce(self.converter.convert(type_name, value)?, kind),
        }
    }
}

/// Coerce a converted value to the shape a field expects
fn coerce(value: ColumnValue, kind: FieldKind) -> Result<ColumnValue> {
    let fail = |value: &ColumnValue| {
        CaptureError::conversion(format!(
            "cannot store {} value {:?} in {:?} field",
            value.kind_name(),
            value.render(),
            kind
        ))
    };

    match (kind, value) {
        (FieldKind::Integer, ColumnValue::Integer(v)) => Ok(ColumnValue::Integer(v)),
        (FieldKind::Integer, ColumnValue::Float(v)) => {
            let truncated = v.trunc();
            if !fits_i64(truncated) {
                return Err(CaptureError::conversion(format!(
                    "{v} is out of range [{}, {}]",
                    i64::MIN,
                    i64::MAX
                )));
            }
            Ok(ColumnValue::Integer(truncated as i64))
        }
        (FieldKind::Integer, ColumnValue::Boolean(v)) => Ok(ColumnValue::Integer(i64::from(v))),
        (FieldKind::Integer, ColumnValue::Text(text)) => text
            .trim()
            .parse::<i64>()
            .map(ColumnValue::Integer)
            .map_err(|_| fail(&ColumnValue::Text(text))),

        (FieldKind::Float, ColumnValue::Float(v)) => Ok(ColumnValue::Float(v)),
        (FieldKind::Float, ColumnValue::Integer(v)) => Ok(ColumnValue::Float(v as f64)),
        (FieldKind::Float, ColumnValue::Boolean(v)) => {
            Ok(ColumnValue::Float(if v { 1.0 } else { 0.0 }))
        }
        (FieldKind::Float, ColumnValue::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(ColumnValue::Float)
            .map_err(|_| fail(&ColumnValue::Text(text))),

        (FieldKind::Text, ColumnValue::Text(text)) => Ok(ColumnValue::Text(text)),
        (FieldKind::Text, other) => Ok(ColumnValue::Text(other.render())),

        (FieldKind::Boolean, ColumnValue::Boolean(v)) => Ok(ColumnValue::Boolean(v)),
        (FieldKind::Boolean, ColumnValue::Integer(v)) => Ok(ColumnValue::Boolean(v != 0)),
        (FieldKind::Boolean, ColumnValue::Text(text)) => parse_bool_text(&text)
            .map(ColumnValue::Boolean)
            .ok_or_else(|| fail(&ColumnValue::Text(text))),

        (FieldKind::Timestamp, value @ ColumnValue::Timestamp(_)) => Ok(value),
        (FieldKind::Document, value) => Ok(ColumnValue::Document(value.to_json())),
        (FieldKind::Array, value @ ColumnValue::Array(_)) => Ok(value),

        (_, other) => Err(fail(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, OldKeys};
    use chrono::{DateTime, FixedOffset, Timelike};
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Order {
        id: i64,
        status: String,
        total: f64,
        paid: bool,
        created_at: Option<DateTime<FixedOffset>>,
        meta: Value,
        tags: Vec<ColumnValue>,
        internal: String,
    }

    impl Record for Order {
        fn fields() -> Vec<FieldSpec<Self>> {
            vec![
                FieldSpec::new("Id", FieldKind::Integer, |o: &mut Order, v| {
                    o.id = v.try_into()?;
                    Ok(())
                }),
                FieldSpec::new("Status", FieldKind::Text, |o: &mut Order, v| {
                    o.status = v.try_into()?;
                    Ok(())
                })
                .json("status")
                .db("order_status"),
                FieldSpec::new("Total", FieldKind::Float, |o: &mut Order, v| {
                    o.total = v.try_into()?;
                    Ok(())
                })
                .db("total_amount"),
                FieldSpec::new("Paid", FieldKind::Boolean, |o: &mut Order, v| {
                    o.paid = v.try_into()?;
                    Ok(())
                }),
                FieldSpec::new("CreatedAt", FieldKind::Timestamp, |o: &mut Order, v| {
                    o.created_at = Some(v.try_into()?);
                    Ok(())
                })
                .json("created_at"),
                FieldSpec::new("Meta", FieldKind::Document, |o: &mut Order, v| {
                    o.meta = v.try_into()?;
                    Ok(())
                }),
                FieldSpec::new("Tags", FieldKind::Array, |o: &mut Order, v| {
                    o.tags = v.try_into()?;
                    Ok(())
                }),
                FieldSpec::new("Internal", FieldKind::Text, |o: &mut Order, v| {
                    o.internal = v.try_into()?;
                    Ok(())
                })
                .json("-"),
            ]
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn mapper() -> StructMapper<Order> {
        StructMapper::new(TypeConverter::new(FixedOffset::east_opt(3600).unwrap()))
    }

    #[test]
    fn test_lookup_name_precedence() {
        let names: Vec<_> = mapper().field_names().map(str::to_string).collect();
        assert_eq!(
            names,
            vec!["id", "status", "total_amount", "paid", "created_at", "meta", "tags"]
        );
    }

    #[test]
    fn test_apply_exact_and_case_insensitive() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["id", "STATUS", "Total_Amount", "paid", "unknown_column"]),
                &strings(&["int4", "varchar", "numeric", "bool", "text"]),
                &[json!(7), json!("new"), json!("19.5"), json!("t"), json!("ignored")],
            )
            .unwrap();

        assert_eq!(order.id, 7);
        assert_eq!(order.status, "new");
        assert_eq!(order.total, 19.5);
        assert!(order.paid);
    }

    #[test]
    fn test_null_leaves_field_untouched() {
        let mut order = Order {
            status: "kept".into(),
            ..Default::default()
        };
        mapper()
            .apply(&mut order, &strings(&["status"]), &strings(&["text"]), &[Value::Null])
            .unwrap();
        assert_eq!(order.status, "kept");
    }

    #[test]
    fn test_skipped_field_is_never_written() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["internal", "-"]),
                &strings(&["text", "text"]),
                &[json!("secret"), json!("secret")],
            )
            .unwrap();
        assert!(order.internal.is_empty());
    }

    #[test]
    fn test_text_is_coerced_into_numeric_fields() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["id", "total_amount"]),
                &strings(&["text", "text"]),
                &[json!("5"), json!("2.5")],
            )
            .unwrap();
        assert_eq!(order.id, 5);
        assert_eq!(order.total, 2.5);

        let err = mapper()
            .apply(&mut order, &strings(&["id"]), &strings(&["text"]), &[json!("five")])
            .unwrap_err();
        assert!(err.to_string().contains("setting field id"));
    }

    #[test]
    fn test_float_into_integer_field_is_range_checked() {
        let mut order = Order::default();
        mapper()
            .apply(&mut order, &strings(&["id"]), &strings(&["float8"]), &[json!(-2.9)])
            .unwrap();
        assert_eq!(order.id, -2);

        for value in [json!(1e20), json!(-1e20), json!(9.3e18)] {
            let err = mapper()
                .apply(&mut order, &strings(&["id"]), &strings(&["float8"]), &[value.clone()])
                .unwrap_err();
            assert!(matches!(err, CaptureError::Conversion(_)), "{value}");
            assert!(err.to_string().contains("out of range"), "{value}");
        }
        assert_eq!(order.id, -2);
    }

    #[test]
    fn test_timestamp_field_from_text_column() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["created_at"]),
                &strings(&["text"]),
                &[json!("2024-03-01 10:15:30")],
            )
            .unwrap();
        let created = order.created_at.unwrap();
        assert_eq!(created.offset().local_minus_utc(), 3600);
        assert_eq!(created.hour(), 10);
    }

    #[test]
    fn test_document_field_from_text_column() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["meta"]),
                &strings(&["text"]),
                &[json!(r#"{"gift":true}"#)],
            )
            .unwrap();
        assert_eq!(order.meta, json!({"gift": true}));
    }

    #[test]
    fn test_array_field() {
        let mut order = Order::default();
        mapper()
            .apply(
                &mut order,
                &strings(&["tags"]),
                &strings(&["_text"]),
                &[json!("{vip,rush}")],
            )
            .unwrap();
        assert_eq!(
            order.tags,
            vec![ColumnValue::Text("vip".into()), ColumnValue::Text("rush".into())]
        );
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut order = Order::default();
        assert!(mapper()
            .apply(&mut order, &strings(&["id", "status"]), &strings(&["int4"]), &[json!(1)])
            .is_err());
    }

    #[test]
    fn test_map_record() {
        let record = ChangeRecord {
            kind: ChangeKind::Update,
            schema: "public".into(),
            table: "orders".into(),
            column_names: strings(&["id", "status"]),
            column_types: strings(&["integer", "text"]),
            column_values: vec![json!(5), json!("shipped")],
            old_keys: Some(OldKeys {
                key_names: strings(&["id"]),
                key_types: strings(&["integer"]),
                key_values: vec![json!(5)],
            }),
        };

        let order = mapper().map_record(&record).unwrap();
        assert_eq!(order.id, 5);
        assert_eq!(order.status, "shipped");
        assert!(!order.paid);
    }
}
