//! Result projection: field descriptors + raw rows into typed rows.
//!
//! Decoders and the name index are computed once per description and
//! shared by every row through an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::convert::FromValue;
use crate::error::{ClientError, Result};
use crate::message::{FieldDescriptor, RawRow};
use crate::types::{Decoder, Oid, Value};

// ============================================================================
// Custom types
// ============================================================================

/// Per-client table of server-assigned type OIDs (enums, domains, ...).
///
/// Columns of a registered type are decoded as text.
#[derive(Debug, Default)]
pub struct CustomTypes {
    by_name: RwLock<HashMap<String, Oid>>,
}

impl CustomTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(types: HashMap<String, Oid>) -> Self {
        Self {
            by_name: RwLock::new(types),
        }
    }

    pub fn register(&self, name: impl Into<String>, oid: Oid) {
        self.by_name.write().insert(name.into(), oid);
    }

    pub fn oid(&self, name: &str) -> Option<Oid> {
        self.by_name.read().get(name).copied()
    }

    fn oids(&self) -> HashSet<Oid> {
        self.by_name.read().values().copied().collect()
    }
}

// ============================================================================
// Columns
// ============================================================================

/// An immutable row description with its decoders and name index.
#[derive(Debug)]
pub struct Columns {
    fields: Vec<FieldDescriptor>,
    decoders: Vec<Decoder>,
    index: HashMap<String, usize>,
}

impl Columns {
    pub fn new(fields: Vec<FieldDescriptor>, custom: &CustomTypes) -> Self {
        let custom_oids = custom.oids();
        let decoders = fields
            .iter()
            .map(|f| {
                let oid = if custom_oids.contains(&f.type_oid) {
                    Oid::TEXT
                } else {
                    f.type_oid
                };
                Decoder::new(f.format, oid)
            })
            .collect();

        // First occurrence wins on duplicate names.
        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            index.entry(field.name.clone()).or_insert(i);
        }

        Self {
            fields,
            decoders,
            index,
        }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn decode_row(columns: &Arc<Columns>, raw: &RawRow) -> Result<Row> {
    if raw.len() != columns.fields.len() {
        return Err(ClientError::ProtocolMismatch {
            expected: "one value per described field",
            received: format!("{} values for {} fields", raw.len(), columns.fields.len()),
        });
    }
    let values = raw
        .iter()
        .zip(&columns.decoders)
        .map(|(value, decoder)| match value {
            Some(data) => decoder.decode(data),
            None => Ok(Value::Null),
        })
        .collect::<Result<SmallVec<[Value; 8]>>>()?;

    Ok(Row {
        columns: Arc::clone(columns),
        values,
    })
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Columns>,
    values: SmallVec<[Value; 8]>,
}

impl Row {
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Raw decoded value of the named column.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).map(|i| &self.values[i])
    }

    pub fn get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .value(name)
            .ok_or_else(|| ClientError::Decode(format!("No column named {}", name)))?;
        T::from_value(value)
    }

    pub fn get_idx<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| ClientError::Decode(format!("Column index {} out of range", index)))?;
        T::from_value(value)
    }

    /// Like [`Row::get`], mapping SQL NULL to `None`.
    pub fn try_get<T: FromValue>(&self, name: &str) -> Result<Option<T>> {
        self.get::<Option<T>>(name)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Rows of one completed query. Field descriptions are kept even when
/// there are no rows.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<Columns>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Outcome of a completed query: exactly one of these.
#[derive(Debug, Clone)]
pub enum QueryResponse {
    Ok(u64),
    ResultSet(ResultSet),
}

/// Decode every row; any failure fails the whole result.
pub fn project(columns: Arc<Columns>, raw_rows: &[RawRow]) -> Result<ResultSet> {
    let rows = raw_rows
        .iter()
        .map(|raw| decode_row(&columns, raw))
        .collect::<Result<Vec<_>>>()?;
    Ok(ResultSet { columns, rows })
}
