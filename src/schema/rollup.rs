use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::{Granularity, Row, Schema, SchemaError};

/// Re-buckets rows to a coarser granularity and folds rows that land on the
/// same storage id.
///
/// `Add` columns are conserved: the sum over the output equals the sum over
/// the input. Output is ordered by storage id.
pub fn rollup<I>(schema: &Schema, rows: I, target: Granularity) -> Result<Vec<Row>, SchemaError>
where
    I: IntoIterator<Item = Row>,
{
    let mut merged: BTreeMap<_, Row> = BTreeMap::new();

    for mut row in rows {
        schema.check_row(&row)?;
        let bucket = row.id().time_bucket().to_granularity(target)?;
        let id = row.id().with_time_bucket(bucket);
        row.set_id(id.clone());

        match merged.entry(id) {
            Entry::Occupied(mut existing) => {
                schema.fold(existing.get_mut(), &row);
            }
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }

    Ok(merged.into_values().collect())
}
