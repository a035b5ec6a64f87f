//! Schema and document model.
//!
//! Documents carry typed field values; the schema names fields and decides
//! which are indexed (searchable) and which are stored (retrievable). Field
//! names may be dot-qualified for values lifted out of nested records.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::tuple::Tuple;

/// Field handle within one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Field(pub u32);

/// Field number under which a document's packed primary key is stored.
pub const PRIMARY_KEY_FIELD: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    I32,
    I64,
    F32,
    F64,
    Bytes,
}

#[derive(Debug, Clone)]
pub struct FieldEntry {
    pub name: String,
    pub field_type: FieldType,
    pub stored: bool,
    pub indexed: bool,
}

/// A typed field value. The variant is fixed at write time; an `i32` field
/// never silently widens to `i64`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn matches_type(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::I32(_), FieldType::I32)
                | (FieldValue::I64(_), FieldType::I64)
                | (FieldValue::F32(_), FieldType::F32)
                | (FieldValue::F64(_), FieldType::F64)
                | (FieldValue::Bytes(_), FieldType::Bytes)
                | (FieldValue::Text(_), FieldType::Text)
        )
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entries: Vec<FieldEntry>,
}

impl SchemaBuilder {
    fn add(&mut self, name: &str, field_type: FieldType, stored: bool, indexed: bool) -> Field {
        self.entries.push(FieldEntry {
            name: name.to_string(),
            field_type,
            stored,
            indexed,
        });
        Field(self.entries.len() as u32 - 1)
    }

    pub fn add_text_field(&mut self, name: &str, stored: bool, indexed: bool) -> Field {
        self.add(name, FieldType::Text, stored, indexed)
    }

    pub fn add_i32_field(&mut self, name: &str, stored: bool) -> Field {
        self.add(name, FieldType::I32, stored, false)
    }

    pub fn add_i64_field(&mut self, name: &str, stored: bool) -> Field {
        self.add(name, FieldType::I64, stored, false)
    }

    pub fn add_f64_field(&mut self, name: &str, stored: bool) -> Field {
        self.add(name, FieldType::F64, stored, false)
    }

    pub fn add_bytes_field(&mut self, name: &str, stored: bool) -> Field {
        self.add(name, FieldType::Bytes, stored, false)
    }

    pub fn build(self) -> Schema {
        let by_name = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), Field(i as u32)))
            .collect();
        Schema {
            entries: self.entries,
            by_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    entries: Vec<FieldEntry>,
    by_name: FxHashMap<String, Field>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        self.by_name.get(name).copied()
    }

    pub fn entry(&self, field: Field) -> Option<&FieldEntry> {
        self.entries.get(field.0 as usize)
    }

    pub fn entries(&self) -> &[FieldEntry] {
        &self.entries
    }
}

/// One document's field values, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    field_values: Vec<(Field, FieldValue)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: Field, value: FieldValue) {
        self.field_values.push((field, value));
    }

    pub fn add_text(&mut self, field: Field, text: impl Into<String>) {
        self.add(field, FieldValue::Text(text.into()));
    }

    pub fn add_i32(&mut self, field: Field, value: i32) {
        self.add(field, FieldValue::I32(value));
    }

    pub fn add_i64(&mut self, field: Field, value: i64) {
        self.add(field, FieldValue::I64(value));
    }

    pub fn add_f64(&mut self, field: Field, value: f64) {
        self.add(field, FieldValue::F64(value));
    }

    pub fn add_bytes(&mut self, field: Field, value: Vec<u8>) {
        self.add(field, FieldValue::Bytes(value));
    }

    pub fn field_values(&self) -> &[(Field, FieldValue)] {
        &self.field_values
    }

    pub fn get_first(&self, field: Field) -> Option<&FieldValue> {
        self.field_values
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v)
    }
}

/// A record as handed to the index maintainer: a unique primary key plus the
/// document body.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub primary_key: Tuple,
    pub document: Document,
}

impl Record {
    pub fn new(primary_key: Tuple, document: Document) -> Self {
        Self {
            primary_key,
            document,
        }
    }
}

/// Sort order requested by a query. Only the leading sort field matters for
/// partition selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub reverse: bool,
}

/// Lowercase alphanumeric tokenization, shared by indexing and querying.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Compiled dot-separated field path, e.g. `header.timestamp`.
pub type FieldPath = Arc<Vec<String>>;

static FIELD_PATH_CACHE: OnceLock<RwLock<FxHashMap<String, FieldPath>>> = OnceLock::new();

/// Compile (and cache, process-wide) a dot-separated field path.
pub fn compile_field_path(name: &str) -> FieldPath {
    let cache = FIELD_PATH_CACHE.get_or_init(|| RwLock::new(FxHashMap::default()));
    if let Some(path) = cache.read().get(name) {
        return Arc::clone(path);
    }
    let path: FieldPath = Arc::new(name.split('.').map(str::to_string).collect());
    cache.write().insert(name.to_string(), Arc::clone(&path));
    path
}

/// Evaluate a compiled path against a document. Nested record values are
/// represented as flat dot-qualified schema fields, so evaluation is a lookup
/// under the joined name.
pub fn evaluate_i64_path(schema: &Schema, document: &Document, path: &FieldPath) -> Result<i64> {
    let name = path.join(".");
    let field = schema
        .field(&name)
        .ok_or_else(|| Error::InvalidArgument(format!("no such field: {name}")))?;
    match document.get_first(field) {
        Some(FieldValue::I64(v)) => Ok(*v),
        Some(other) => Err(Error::InvalidArgument(format!(
            "invalid type for partitioning key {name}: {other:?}"
        ))),
        None => Err(Error::InvalidArgument(format!(
            "document is missing partitioning key {name}"
        ))),
    }
}
