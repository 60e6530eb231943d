//! Column merge algebra.
//!
//! Every column carries an [`Operation`] that decides how an incoming
//! delta value folds into the value already held for the same storage id.
//! `Add` is commutative and associative, so the order in which deltas reach
//! a shard never changes the accumulated result. `Cover` and `Non` are
//! order sensitive and rely on the per-shard arrival order.

use std::fmt;

/// How an incoming value folds into the current value of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Write-once. The value the row was created with sticks, even when it
    /// is the type default.
    Non,
    /// Last write wins.
    Cover,
    /// Numeric sum.
    Add,
}

impl Operation {
    /// Returns the lowercase name used in logs and declarations.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Non => "non",
            Self::Cover => "cover",
            Self::Add => "add",
        }
    }

    /// Whether this operation changes a stored value after it was first set.
    pub fn is_mergeable(self) -> bool {
        !matches!(self, Self::Non)
    }

    /// Folds `incoming` into `current` in place.
    ///
    /// # Panics
    ///
    /// Panics when `Add` is applied to a non-numeric type. Schemas reject
    /// that combination at construction, so reaching it is a wiring bug.
    pub fn fold<T: ColumnValue>(self, current: &mut T, incoming: &T) -> FoldOutcome {
        match self {
            Self::Add => match current.checked_sum(incoming) {
                Some(sum) => {
                    *current = sum;
                    FoldOutcome::Updated
                }
                None => panic!("add fold on non-numeric {} column", T::TYPE.as_str()),
            },
            Self::Cover => {
                if current == incoming {
                    FoldOutcome::Unchanged
                } else {
                    current.clone_from(incoming);
                    FoldOutcome::Updated
                }
            }
            Self::Non => {
                if incoming.is_unset() || current == incoming {
                    FoldOutcome::Unchanged
                } else {
                    FoldOutcome::Conflict
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of folding a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Unchanged,
    Updated,
    /// A write-once column received a different non-default value. The
    /// current value was kept, whatever it is.
    Conflict,
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Bytes,
}

impl SemanticType {
    /// All semantic types, in row slot order.
    pub const ALL: [SemanticType; 6] = [
        Self::String,
        Self::Integer,
        Self::Long,
        Self::Double,
        Self::Boolean,
        Self::Bytes,
    ];

    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Long | Self::Double)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust type that can back a column.
pub trait ColumnValue: Clone + PartialEq + fmt::Debug + Default + Send + Sync + 'static {
    const TYPE: SemanticType;

    /// Whether the value equals the type's default (empty string, zero or
    /// false). Write-once columns ignore a default incoming value.
    fn is_unset(&self) -> bool;

    /// Numeric sum, saturating for integers. `None` for non-numeric types.
    fn checked_sum(&self, other: &Self) -> Option<Self>;

    fn into_value(self) -> Value;

    fn from_value(value: Value) -> Option<Self>;
}

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i32),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn semantic_type(&self) -> SemanticType {
        match self {
            Self::String(_) => SemanticType::String,
            Self::Integer(_) => SemanticType::Integer,
            Self::Long(_) => SemanticType::Long,
            Self::Double(_) => SemanticType::Double,
            Self::Boolean(_) => SemanticType::Boolean,
            Self::Bytes(_) => SemanticType::Bytes,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => f.write_str(v),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl ColumnValue for String {
    const TYPE: SemanticType = SemanticType::String;

    fn is_unset(&self) -> bool {
        self.is_empty()
    }

    fn checked_sum(&self, _other: &Self) -> Option<Self> {
        None
    }

    fn into_value(self) -> Value {
        Value::String(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

impl ColumnValue for i32 {
    const TYPE: SemanticType = SemanticType::Integer;

    fn is_unset(&self) -> bool {
        *self == 0
    }

    fn checked_sum(&self, other: &Self) -> Option<Self> {
        Some(self.saturating_add(*other))
    }

    fn into_value(self) -> Value {
        Value::Integer(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(v),
            _ => None,
        }
    }
}

impl ColumnValue for i64 {
    const TYPE: SemanticType = SemanticType::Long;

    fn is_unset(&self) -> bool {
        *self == 0
    }

    fn checked_sum(&self, other: &Self) -> Option<Self> {
        Some(self.saturating_add(*other))
    }

    fn into_value(self) -> Value {
        Value::Long(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }
}

impl ColumnValue for f64 {
    const TYPE: SemanticType = SemanticType::Double;

    fn is_unset(&self) -> bool {
        *self == 0.0
    }

    fn checked_sum(&self, other: &Self) -> Option<Self> {
        Some(self + other)
    }

    fn into_value(self) -> Value {
        Value::Double(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }
}

impl ColumnValue for bool {
    const TYPE: SemanticType = SemanticType::Boolean;

    fn is_unset(&self) -> bool {
        !*self
    }

    fn checked_sum(&self, _other: &Self) -> Option<Self> {
        None
    }

    fn into_value(self) -> Value {
        Value::Boolean(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

impl ColumnValue for Vec<u8> {
    const TYPE: SemanticType = SemanticType::Bytes;

    fn is_unset(&self) -> bool {
        self.is_empty()
    }

    fn checked_sum(&self, _other: &Self) -> Option<Self> {
        None
    }

    fn into_value(self) -> Value {
        Value::Bytes(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}
