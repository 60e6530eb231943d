//! Row schemas, storage ids and the per-row fold.
//!
//! A [`Schema`] is an ordered list of typed columns. Each column occupies a
//! slot in the per-type array of a [`Row`], assigned in declaration order
//! (the third `Long` column lives at `longs[2]`). Rows produced by the same
//! schema always have the same shape, which lets [`Schema::fold`] combine
//! two rows slot by slot without any lookups.

pub mod record;
pub mod rollup;
pub mod time_bucket;

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::merge::{ColumnValue, FoldOutcome, Operation, SemanticType, Value};

pub use record::Record;
pub use rollup::rollup;
pub use time_bucket::{Granularity, TimeBucket};

/// Separator between the time bucket and the entity id in a storage id.
pub const ID_SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("schema {0} declares no columns")]
    Empty(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("column {column} applies add to non-numeric type {semantic_type}")]
    NonNumericAdd {
        column: String,
        semantic_type: SemanticType,
    },
    #[error("formula column {column} must be long or double, got {semantic_type}")]
    FormulaTarget {
        column: String,
        semantic_type: SemanticType,
    },
    #[error("formula column {column} references {input}, which is not a long column")]
    FormulaInput { column: String, input: String },
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("column {column} is {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: SemanticType,
        found: SemanticType,
    },
    #[error("row {id} does not match the shape of schema {schema}")]
    ShapeMismatch { schema: String, id: String },
    #[error("invalid time bucket {0}")]
    InvalidTimeBucket(i64),
    #[error("timestamp {0}ms is outside the supported range")]
    TimestampOutOfRange(i64),
    #[error("cannot convert a {from} bucket to the finer {to} granularity")]
    FinerGranularity { from: Granularity, to: Granularity },
    #[error("invalid storage id {0:?}")]
    InvalidStorageId(String),
}

/// Identity of an aggregated row: a time bucket plus an entity id.
///
/// Two deltas with the same storage id describe the same entity in the same
/// time window and are folded together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId {
    time_bucket: TimeBucket,
    entity_id: String,
}

impl StorageId {
    pub fn new(time_bucket: TimeBucket, entity_id: impl Into<String>) -> Self {
        Self {
            time_bucket,
            entity_id: entity_id.into(),
        }
    }

    /// Parses the `<bucket>_<entity>` text form.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidStorageId(text.to_string());
        let (bucket, entity) = text.split_once(ID_SEPARATOR).ok_or_else(invalid)?;
        let bucket: i64 = bucket.parse().map_err(|_| invalid())?;
        Ok(Self::new(TimeBucket::new(bucket)?, entity))
    }

    pub fn time_bucket(&self) -> TimeBucket {
        self.time_bucket
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Same entity in a different bucket.
    pub fn with_time_bucket(&self, time_bucket: TimeBucket) -> Self {
        Self {
            time_bucket,
            entity_id: self.entity_id.clone(),
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.time_bucket, ID_SEPARATOR, self.entity_id)
    }
}

/// Derived value computed from other columns after every fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formula {
    /// `sum / count`, or zero when `count` is zero.
    Average { sum: String, count: String },
}

impl Formula {
    pub fn average(sum: &str, count: &str) -> Self {
        Self::Average {
            sum: sum.to_string(),
            count: count.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedFormula {
    Average { sum_slot: usize, count_slot: usize },
}

/// One column of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    semantic_type: SemanticType,
    operation: Operation,
    slot: usize,
    formula: Option<ResolvedFormula>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn semantic_type(&self) -> SemanticType {
        self.semantic_type
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Index within the row array of this column's type.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }
}

/// Number of slots per semantic type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SlotCounts {
    strings: usize,
    integers: usize,
    longs: usize,
    doubles: usize,
    booleans: usize,
    bytes: usize,
}

impl SlotCounts {
    fn next(&mut self, semantic_type: SemanticType) -> usize {
        let counter = match semantic_type {
            SemanticType::String => &mut self.strings,
            SemanticType::Integer => &mut self.integers,
            SemanticType::Long => &mut self.longs,
            SemanticType::Double => &mut self.doubles,
            SemanticType::Boolean => &mut self.booleans,
            SemanticType::Bytes => &mut self.bytes,
        };
        let slot = *counter;
        *counter += 1;
        slot
    }
}

/// Summary of a row fold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldReport {
    pub updated: usize,
    pub conflicts: usize,
}

/// Ordered, typed column layout of a role's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
    counts: SlotCounts,
    formulas: Vec<usize>,
    has_mergeable: bool,
}

impl Schema {
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: name.to_string(),
            columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether any column is `Add` or `Cover`. Such rows must always be
    /// routed to the same shard for a given entity.
    pub fn has_mergeable_columns(&self) -> bool {
        self.has_mergeable
    }

    /// A row with every column at its default value.
    pub fn new_row(&self, id: StorageId) -> Row {
        let c = &self.counts;
        Row {
            id,
            strings: vec![String::new(); c.strings],
            integers: vec![0; c.integers],
            longs: vec![0; c.longs],
            doubles: vec![0.0; c.doubles],
            booleans: vec![false; c.booleans],
            bytes: vec![Vec::new(); c.bytes],
        }
    }

    /// Whether the row has exactly this schema's slot layout.
    pub fn matches(&self, row: &Row) -> bool {
        let c = &self.counts;
        row.strings.len() == c.strings
            && row.integers.len() == c.integers
            && row.longs.len() == c.longs
            && row.doubles.len() == c.doubles
            && row.booleans.len() == c.booleans
            && row.bytes.len() == c.bytes
    }

    pub fn check_row(&self, row: &Row) -> Result<(), SchemaError> {
        if self.matches(row) {
            Ok(())
        } else {
            Err(SchemaError::ShapeMismatch {
                schema: self.name.clone(),
                id: row.id.to_string(),
            })
        }
    }

    /// Folds `incoming` into `existing` column by column, then recomputes
    /// formula columns.
    ///
    /// # Panics
    ///
    /// Panics when the two rows have different storage ids or either row
    /// does not match this schema. Both indicate a routing or wiring bug.
    pub fn fold(&self, existing: &mut Row, incoming: &Row) -> FoldReport {
        assert_eq!(
            existing.id, incoming.id,
            "fold across storage ids in schema {}",
            self.name
        );
        assert!(
            self.matches(existing) && self.matches(incoming),
            "row shape does not match schema {}",
            self.name
        );

        let mut report = FoldReport::default();
        for column in self.columns.iter().filter(|c| c.formula.is_none()) {
            let outcome = match column.semantic_type {
                SemanticType::String => fold_slot::<String>(column, existing, incoming),
                SemanticType::Integer => fold_slot::<i32>(column, existing, incoming),
                SemanticType::Long => fold_slot::<i64>(column, existing, incoming),
                SemanticType::Double => fold_slot::<f64>(column, existing, incoming),
                SemanticType::Boolean => fold_slot::<bool>(column, existing, incoming),
                SemanticType::Bytes => fold_slot::<Vec<u8>>(column, existing, incoming),
            };
            match outcome {
                FoldOutcome::Unchanged => {}
                FoldOutcome::Updated => report.updated += 1,
                FoldOutcome::Conflict => {
                    report.conflicts += 1;
                    warn!(
                        schema = %self.name,
                        column = %column.name,
                        storage_id = %existing.id,
                        "write-once column received a conflicting value, keeping the first",
                    );
                }
            }
        }

        self.apply_formulas(existing);
        report
    }

    /// Recomputes every formula column from its inputs.
    pub fn apply_formulas(&self, row: &mut Row) {
        for &index in &self.formulas {
            let column = &self.columns[index];
            let Some(ResolvedFormula::Average {
                sum_slot,
                count_slot,
            }) = column.formula
            else {
                continue;
            };

            let sum = row.longs[sum_slot];
            let count = row.longs[count_slot];
            match column.semantic_type {
                SemanticType::Double => {
                    row.doubles[column.slot] = if count == 0 {
                        0.0
                    } else {
                        sum as f64 / count as f64
                    };
                }
                _ => {
                    row.longs[column.slot] = if count == 0 { 0 } else { sum / count };
                }
            }
        }
    }

    /// Reads a column by name.
    pub fn get(&self, row: &Row, name: &str) -> Option<Value> {
        let column = self.column(name)?;
        let value = match column.semantic_type {
            SemanticType::String => row.get::<String>(column.slot).clone().into_value(),
            SemanticType::Integer => row.get::<i32>(column.slot).into_value(),
            SemanticType::Long => row.get::<i64>(column.slot).into_value(),
            SemanticType::Double => row.get::<f64>(column.slot).into_value(),
            SemanticType::Boolean => row.get::<bool>(column.slot).into_value(),
            SemanticType::Bytes => row.get::<Vec<u8>>(column.slot).clone().into_value(),
        };
        Some(value)
    }

    /// Writes a column by name. Formula columns are recomputed afterwards.
    pub fn set(&self, row: &mut Row, name: &str, value: Value) -> Result<(), SchemaError> {
        let column = self
            .column(name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))?;
        self.check_row(row)?;

        let mismatch = |found: SemanticType| SchemaError::TypeMismatch {
            column: name.to_string(),
            expected: column.semantic_type,
            found,
        };
        let found = value.semantic_type();
        match column.semantic_type {
            SemanticType::String => set_value::<String>(row, column.slot, value),
            SemanticType::Integer => set_value::<i32>(row, column.slot, value),
            SemanticType::Long => set_value::<i64>(row, column.slot, value),
            SemanticType::Double => set_value::<f64>(row, column.slot, value),
            SemanticType::Boolean => set_value::<bool>(row, column.slot, value),
            SemanticType::Bytes => set_value::<Vec<u8>>(row, column.slot, value),
        }
        .ok_or_else(|| mismatch(found))?;

        self.apply_formulas(row);
        Ok(())
    }
}

fn fold_slot<T: SlotValue>(column: &Column, existing: &mut Row, incoming: &Row) -> FoldOutcome {
    let incoming = &T::slots(incoming)[column.slot];
    let current = &mut T::slots_mut(existing)[column.slot];
    column.operation.fold(current, incoming)
}

fn set_value<T: SlotValue>(row: &mut Row, slot: usize, value: Value) -> Option<()> {
    let value = T::from_value(value)?;
    row.set(slot, value);
    Some(())
}

/// Builds a [`Schema`], assigning slots in declaration order.
pub struct SchemaBuilder {
    name: String,
    columns: Vec<(String, SemanticType, Operation, Option<Formula>)>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: &str, semantic_type: SemanticType, operation: Operation) -> Self {
        self.columns
            .push((name.to_string(), semantic_type, operation, None));
        self
    }

    /// Adds a derived column. Formula columns are never folded directly.
    pub fn formula(mut self, name: &str, semantic_type: SemanticType, formula: Formula) -> Self {
        self.columns.push((
            name.to_string(),
            semantic_type,
            Operation::Non,
            Some(formula),
        ));
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::Empty(self.name));
        }

        let mut seen = HashSet::new();
        let mut counts = SlotCounts::default();
        let mut columns = Vec::with_capacity(self.columns.len());

        for (name, semantic_type, operation, _) in &self.columns {
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
            if *operation == Operation::Add && !semantic_type.is_numeric() {
                return Err(SchemaError::NonNumericAdd {
                    column: name.clone(),
                    semantic_type: *semantic_type,
                });
            }
            columns.push(Column {
                name: name.clone(),
                semantic_type: *semantic_type,
                operation: *operation,
                slot: counts.next(*semantic_type),
                formula: None,
            });
        }

        let mut formulas = Vec::new();
        for (index, (name, semantic_type, _, formula)) in self.columns.iter().enumerate() {
            let Some(Formula::Average { sum, count }) = formula else {
                continue;
            };
            if !matches!(semantic_type, SemanticType::Long | SemanticType::Double) {
                return Err(SchemaError::FormulaTarget {
                    column: name.clone(),
                    semantic_type: *semantic_type,
                });
            }
            let long_slot = |input: &str| {
                self.columns
                    .iter()
                    .zip(&columns)
                    .find(|((n, t, _, f), _)| {
                        n == input && *t == SemanticType::Long && f.is_none()
                    })
                    .map(|(_, c)| c.slot)
                    .ok_or_else(|| SchemaError::FormulaInput {
                        column: name.clone(),
                        input: input.to_string(),
                    })
            };
            let resolved = ResolvedFormula::Average {
                sum_slot: long_slot(sum)?,
                count_slot: long_slot(count)?,
            };
            columns[index].formula = Some(resolved);
            formulas.push(index);
        }

        let has_mergeable = columns
            .iter()
            .any(|c| c.formula.is_none() && c.operation.is_mergeable());

        Ok(Schema {
            name: self.name,
            columns,
            counts,
            formulas,
            has_mergeable,
        })
    }
}

/// An aggregated row: a storage id plus one array per semantic type.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    id: StorageId,
    strings: Vec<String>,
    integers: Vec<i32>,
    longs: Vec<i64>,
    doubles: Vec<f64>,
    booleans: Vec<bool>,
    bytes: Vec<Vec<u8>>,
}

impl Row {
    pub fn id(&self) -> &StorageId {
        &self.id
    }

    /// Moves the row to another storage id, keeping its values.
    pub fn set_id(&mut self, id: StorageId) {
        self.id = id;
    }

    /// # Panics
    ///
    /// Panics when `slot` is out of range for `T`'s array.
    pub fn get<T: SlotValue>(&self, slot: usize) -> &T {
        &T::slots(self)[slot]
    }

    /// # Panics
    ///
    /// Panics when `slot` is out of range for `T`'s array.
    pub fn set<T: SlotValue>(&mut self, slot: usize, value: T) {
        T::slots_mut(self)[slot] = value;
    }
}

/// Column types with a dedicated array in [`Row`].
pub trait SlotValue: ColumnValue {
    fn slots(row: &Row) -> &[Self];
    fn slots_mut(row: &mut Row) -> &mut [Self];
}

macro_rules! slot_value {
    ($ty:ty, $field:ident) => {
        impl SlotValue for $ty {
            fn slots(row: &Row) -> &[Self] {
                &row.$field
            }

            fn slots_mut(row: &mut Row) -> &mut [Self] {
                &mut row.$field
            }
        }
    };
}

slot_value!(String, strings);
slot_value!(i32, integers);
slot_value!(i64, longs);
slot_value!(f64, doubles);
slot_value!(bool, booleans);
slot_value!(Vec<u8>, bytes);
