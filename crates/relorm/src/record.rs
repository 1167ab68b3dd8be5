//! Fetched rows, records and record lists.

use crate::error::{OrmError, OrmResult};
use crate::value::{FromValue, Value};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// One raw result row as returned by a connection.
///
/// Column names are shared by every row of the same result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of a column by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    /// Value of a column by position.
    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }
}

/// Trait for mapping a [`Record`] to a Rust type.
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> OrmResult<Self>;
}

/// Eager-loaded relation result stored on a parent record.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(RecordList),
}

/// A fetched row bound to an entity, plus resolved relations.
#[derive(Debug, Clone)]
pub struct Record {
    entity: Option<Arc<str>>,
    row: Row,
    relations: HashMap<String, Related>,
}

impl Record {
    pub fn new(entity: Option<Arc<str>>, row: Row) -> Self {
        Self {
            entity,
            row,
            relations: HashMap::new(),
        }
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }

    /// Typed column access; a missing column is a decode error.
    pub fn try_get<T: FromValue>(&self, column: &str) -> OrmResult<T> {
        let value = self
            .row
            .get(column)
            .ok_or_else(|| OrmError::decode(column, "column not present in result"))?;
        T::from_value(value).map_err(|message| OrmError::decode(column, message))
    }

    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// Related records of a many-arity relation.
    pub fn many(&self, name: &str) -> Option<&RecordList> {
        match self.relations.get(name)? {
            Related::Many(list) => Some(list),
            Related::One(_) => None,
        }
    }

    /// Related record of a one-arity relation (`None` when absent or not loaded).
    pub fn one(&self, name: &str) -> Option<&Record> {
        match self.relations.get(name)? {
            Related::One(rec) => rec.as_deref(),
            Related::Many(_) => None,
        }
    }

    /// Fill a relation slot. Returns `false` if the slot was already filled.
    pub(crate) fn set_relation(&mut self, name: &str, related: Related) -> bool {
        if self.relations.contains_key(name) {
            return false;
        }
        self.relations.insert(name.to_string(), related);
        true
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.row.columns.len() + self.relations.len()))?;
        for (col, val) in self.row.columns.iter().zip(&self.row.values) {
            map.serialize_entry(col, val)?;
        }
        let mut names: Vec<&String> = self.relations.keys().collect();
        names.sort();
        for name in names {
            map.serialize_entry(name, &self.relations[name])?;
        }
        map.end()
    }
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Related::One(rec) => rec.serialize(serializer),
            Related::Many(list) => list.serialize(serializer),
        }
    }
}

/// Ordered records fetched by one statement.
#[derive(Debug, Clone, Default)]
pub struct RecordList {
    entity: Option<Arc<str>>,
    records: Vec<Record>,
}

impl RecordList {
    pub fn new(entity: Option<Arc<str>>, records: Vec<Record>) -> Self {
        Self { entity, records }
    }

    /// Bind raw rows to an entity.
    pub fn from_rows(entity: Option<Arc<str>>, rows: Vec<Row>) -> Self {
        let records = rows
            .into_iter()
            .map(|row| Record::new(entity.clone(), row))
            .collect();
        Self { entity, records }
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn get(&self, idx: usize) -> Option<&Record> {
        self.records.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub(crate) fn records_mut(&mut self) -> &mut Vec<Record> {
        &mut self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Map every record to `T`.
    pub fn map_into<T: FromRecord>(&self) -> OrmResult<Vec<T>> {
        self.records.iter().map(T::from_record).collect()
    }
}

impl IntoIterator for RecordList {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordList {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl Serialize for RecordList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.records.serialize(serializer)
    }
}
