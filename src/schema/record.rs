//! Typed records backed by a static schema.
//!
//! [`metric_record!`](crate::metric_record) declares a plain struct whose
//! fields are the columns of a role. The generated schema is built once,
//! and records convert to and from [`Row`] by column order. `add` fields
//! must be numeric; that is checked when the crate compiles.

use super::{Row, Schema, SchemaError, StorageId};

/// A typed view over one role's rows.
pub trait Record: Sized {
    /// Role name the record is dispatched under.
    const ROLE: &'static str;

    fn schema() -> &'static Schema;

    fn storage_id(&self) -> &StorageId;

    fn to_row(&self) -> Row;

    fn from_row(row: &Row) -> Result<Self, SchemaError>;
}

/// Declares a [`Record`] struct and its schema.
///
/// ```
/// streamfold::metric_record! {
///     /// Calls per endpoint.
///     pub struct EndpointCalls : "endpoint_calls" {
///         non endpoint_id: i32,
///         add calls: i64,
///         add duration_sum: i64,
///         cover last_status: String,
///     }
///     derived {
///         avg_duration: i64 = duration_sum / calls,
///     }
/// }
/// ```
#[macro_export]
macro_rules! metric_record {
    (@op add) => { $crate::merge::Operation::Add };
    (@op cover) => { $crate::merge::Operation::Cover };
    (@op non) => { $crate::merge::Operation::Non };

    (@check add $field:ident $ty:ty) => {
        const _: () = assert!(
            <$ty as $crate::merge::ColumnValue>::TYPE.is_numeric(),
            concat!("add column `", stringify!($field), "` must be numeric")
        );
    };
    (@check cover $field:ident $ty:ty) => {};
    (@check non $field:ident $ty:ty) => {};

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $role:literal {
            $( $(#[$fmeta:meta])* $op:ident $field:ident : $ty:ty ),+ $(,)?
        }
        $( derived {
            $( $(#[$dmeta:meta])* $dfield:ident : $dty:ty = $sum:ident / $count:ident ),+ $(,)?
        } )?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            pub storage_id: $crate::schema::StorageId,
            $( $(#[$fmeta])* pub $field: $ty, )+
            $( $( $(#[$dmeta])* pub $dfield: $dty, )+ )?
        }

        $( $crate::metric_record!(@check $op $field $ty); )+

        impl $name {
            /// A record with every column at its default value.
            pub fn new(storage_id: $crate::schema::StorageId) -> Self {
                Self {
                    storage_id,
                    $( $field: ::std::default::Default::default(), )+
                    $( $( $dfield: ::std::default::Default::default(), )+ )?
                }
            }
        }

        impl $crate::schema::Record for $name {
            const ROLE: &'static str = $role;

            fn schema() -> &'static $crate::schema::Schema {
                static SCHEMA: ::std::sync::OnceLock<$crate::schema::Schema> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    let builder = $crate::schema::Schema::builder($role)
                        $( .column(
                            stringify!($field),
                            <$ty as $crate::merge::ColumnValue>::TYPE,
                            $crate::metric_record!(@op $op),
                        ) )+
                        $( $( .formula(
                            stringify!($dfield),
                            <$dty as $crate::merge::ColumnValue>::TYPE,
                            $crate::schema::Formula::average(stringify!($sum), stringify!($count)),
                        ) )+ )?;
                    match builder.build() {
                        Ok(schema) => schema,
                        Err(e) => panic!("invalid record declaration {}: {}", $role, e),
                    }
                })
            }

            fn storage_id(&self) -> &$crate::schema::StorageId {
                &self.storage_id
            }

            fn to_row(&self) -> $crate::schema::Row {
                let schema = <Self as $crate::schema::Record>::schema();
                let mut row = schema.new_row(self.storage_id.clone());
                let mut columns = schema.columns().iter();
                $(
                    if let Some(column) = columns.next() {
                        row.set::<$ty>(column.slot(), ::std::clone::Clone::clone(&self.$field));
                    }
                )+
                schema.apply_formulas(&mut row);
                row
            }

            fn from_row(
                row: &$crate::schema::Row,
            ) -> ::std::result::Result<Self, $crate::schema::SchemaError> {
                let schema = <Self as $crate::schema::Record>::schema();
                schema.check_row(row)?;
                let mut columns = schema.columns().iter();
                Ok(Self {
                    storage_id: row.id().clone(),
                    $(
                        $field: columns
                            .next()
                            .map(|column| ::std::clone::Clone::clone(row.get::<$ty>(column.slot())))
                            .unwrap_or_default(),
                    )+
                    $( $(
                        $dfield: columns
                            .next()
                            .map(|column| ::std::clone::Clone::clone(row.get::<$dty>(column.slot())))
                            .unwrap_or_default(),
                    )+ )?
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Operation, SemanticType, Value};
    use crate::schema::TimeBucket;

    crate::metric_record! {
        /// Endpoint traffic used by the tests below.
        pub struct EndpointCalls : "endpoint_calls" {
            non endpoint_id: i32,
            non endpoint_name: String,
            add calls: i64,
            add duration_sum: i64,
            cover last_status: String,
        }
        derived {
            avg_duration: i64 = duration_sum / calls,
        }
    }

    crate::metric_record! {
        struct Plain : "plain" {
            non key: String,
            non flag: bool,
        }
    }

    fn id() -> StorageId {
        StorageId::new(TimeBucket::new(202_401_151_030).expect("valid"), "3")
    }

    #[test]
    fn test_schema_follows_declaration() {
        let schema = EndpointCalls::schema();
        assert_eq!(schema.name(), "endpoint_calls");
        let layout: Vec<_> = schema
            .columns()
            .iter()
            .map(|c| (c.name(), c.semantic_type(), c.operation(), c.is_formula()))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("endpoint_id", SemanticType::Integer, Operation::Non, false),
                ("endpoint_name", SemanticType::String, Operation::Non, false),
                ("calls", SemanticType::Long, Operation::Add, false),
                ("duration_sum", SemanticType::Long, Operation::Add, false),
                ("last_status", SemanticType::String, Operation::Cover, false),
                ("avg_duration", SemanticType::Long, Operation::Non, true),
            ]
        );
        assert!(std::ptr::eq(schema, EndpointCalls::schema()));
    }

    #[test]
    fn test_to_row_computes_formulas() {
        let mut record = EndpointCalls::new(id());
        record.endpoint_id = 3;
        record.endpoint_name = "/orders".into();
        record.calls = 4;
        record.duration_sum = 100;
        record.last_status = "200".into();

        let row = record.to_row();
        let schema = EndpointCalls::schema();
        assert_eq!(schema.get(&row, "avg_duration"), Some(Value::Long(25)));
        assert_eq!(schema.get(&row, "endpoint_name"), Some(Value::String("/orders".into())));

        let back = EndpointCalls::from_row(&row).expect("same schema");
        assert_eq!(back.avg_duration, 25);
        assert_eq!(back.calls, 4);
        assert_eq!(back.storage_id, id());
    }

    #[test]
    fn test_from_row_rejects_foreign_shape() {
        let row = Plain::new(id()).to_row();
        let err = EndpointCalls::from_row(&row).expect_err("different shape");
        assert!(matches!(err, SchemaError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_all_non_record_is_not_mergeable() {
        assert!(!Plain::schema().has_mergeable_columns());
        assert!(EndpointCalls::schema().has_mergeable_columns());
        assert_eq!(Plain::ROLE, "plain");
    }
}
