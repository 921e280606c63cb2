//! Range partitioning over encoded partition keys.
//!
//! Partition keys are opaque byte strings with lexicographic order. Intervals
//! are start-inclusive and end-exclusive; an empty end means +infinity and an
//! empty start means -infinity.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::schema::Schema;

/// One tablet's key interval.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub partition_key_start: Vec<u8>,
    pub partition_key_end: Vec<u8>,
}

impl Partition {
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { partition_key_start: start, partition_key_end: end }
    }

    pub fn debug_string(&self) -> String {
        format!(
            "[{}, {})",
            key_debug_string(&self.partition_key_start),
            key_debug_string(&self.partition_key_end)
        )
    }
}

pub fn key_debug_string(key: &[u8]) -> String {
    if key.is_empty() {
        return "<unbounded>".to_string();
    }
    key.iter().map(|b| format!("{b:02x}")).collect()
}

/// How a table maps rows to partition keys. The catalog only carries the
/// range key column names; key encoding happens on the worker side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub range_key_columns: Vec<String>,
}

impl PartitionSchema {
    /// The default partition schema ranges over the primary key columns.
    pub fn default_for(schema: &Schema) -> Self {
        Self {
            range_key_columns: schema.key_columns().iter().map(|c| c.name.clone()).collect(),
        }
    }
}

/// A decoded row operation from a create/alter request payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeOp {
    SplitRow(Vec<u8>),
    LowerBound { key: Vec<u8>, exclusive: bool },
    UpperBound { key: Vec<u8>, inclusive: bool },
}

/// The successor of `key` in lexicographic byte-string order.
fn key_successor(mut key: Vec<u8>) -> Vec<u8> {
    key.push(0);
    key
}

/// Split the operation stream into split rows and normalized range bounds
/// (inclusive lower, exclusive upper). Every lower bound must be directly
/// followed by an upper bound.
pub fn decode_range_ops(ops: &[RangeOp]) -> Result<(Vec<Vec<u8>>, Vec<(Vec<u8>, Vec<u8>)>)> {
    let mut split_rows = Vec::new();
    let mut bounds = Vec::new();
    let mut iter = ops.iter();
    while let Some(op) = iter.next() {
        match op {
            RangeOp::SplitRow(key) => split_rows.push(key.clone()),
            RangeOp::LowerBound { key, exclusive } => {
                let lower = if *exclusive {
                    key_successor(key.clone())
                } else {
                    key.clone()
                };
                let upper = match iter.next() {
                    Some(RangeOp::UpperBound { key, inclusive }) => {
                        if *inclusive && !key.is_empty() {
                            key_successor(key.clone())
                        } else {
                            key.clone()
                        }
                    }
                    _ => bail!("missing upper range bound in create table request"),
                };
                bounds.push((lower, upper));
            }
            RangeOp::UpperBound { .. } => {
                bail!("upper range bound without a preceding lower bound");
            }
        }
    }
    Ok((split_rows, bounds))
}

/// Decode exactly one normalized range bound, as required by alter-table
/// range partition steps.
pub fn decode_single_bound(ops: &[RangeOp]) -> Result<(Vec<u8>, Vec<u8>)> {
    if ops.len() != 2 {
        bail!("expected two row operations for alter range partition step");
    }
    let (_, bounds) = decode_range_ops(ops)?;
    match bounds.as_slice() {
        [bound] => Ok(bound.clone()),
        _ => bail!("expected a lower bound and upper bound row op for alter range partition step"),
    }
}

fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    key >= start && (end.is_empty() || key < end)
}

/// Compute the table's initial partitions from split rows and range bounds.
/// With no bounds, a single unbounded range is assumed. Bounds must be
/// non-empty, non-overlapping intervals; each split row must fall strictly
/// inside one bound.
pub fn create_partitions(
    split_rows: &[Vec<u8>],
    bounds: &[(Vec<u8>, Vec<u8>)],
) -> Result<Vec<Partition>> {
    let mut bounds: Vec<(Vec<u8>, Vec<u8>)> = if bounds.is_empty() {
        vec![(Vec::new(), Vec::new())]
    } else {
        bounds.to_vec()
    };
    bounds.sort();
    for (start, end) in &bounds {
        if !end.is_empty() && start >= end {
            bail!(
                "range partition lower bound must be less than the upper bound: [{}, {})",
                key_debug_string(start),
                key_debug_string(end)
            );
        }
    }
    for pair in bounds.windows(2) {
        let (_, prev_end) = &pair[0];
        let (next_start, _) = &pair[1];
        if prev_end.is_empty() || prev_end > next_start {
            bail!("overlapping range partitions");
        }
    }

    let mut split_rows: Vec<Vec<u8>> = split_rows.to_vec();
    split_rows.sort();
    if split_rows.windows(2).any(|w| w[0] == w[1]) {
        bail!("duplicate split row");
    }

    let mut partitions = Vec::new();
    let mut split_iter = split_rows.iter().peekable();
    for (start, end) in &bounds {
        let mut current_start = start.clone();
        while let Some(split) = split_iter.peek() {
            if !in_range(split, start, end) {
                break;
            }
            if split.as_slice() <= current_start.as_slice() {
                bail!("split row out of order or equal to a range bound");
            }
            partitions.push(Partition::new(current_start, (*split).clone()));
            current_start = (*split).clone();
            split_iter.next();
        }
        partitions.push(Partition::new(current_start, end.clone()));
    }
    if let Some(stray) = split_iter.next() {
        bail!(
            "split row {} does not fall in a range partition",
            key_debug_string(stray)
        );
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn decode_requires_upper_after_lower() {
        let err = decode_range_ops(&[RangeOp::LowerBound { key: k("a"), exclusive: false }])
            .expect_err("lower bound without upper");
        assert!(err.to_string().contains("missing upper range bound"));

        let err = decode_range_ops(&[RangeOp::UpperBound { key: k("a"), inclusive: false }])
            .expect_err("stray upper bound");
        assert!(err.to_string().contains("preceding lower bound"));
    }

    #[test]
    fn decode_normalizes_bound_kinds() {
        let (splits, bounds) = decode_range_ops(&[
            RangeOp::SplitRow(k("m")),
            RangeOp::LowerBound { key: k("a"), exclusive: true },
            RangeOp::UpperBound { key: k("z"), inclusive: true },
        ])
        .expect("decode ops");
        assert_eq!(splits, vec![k("m")]);
        assert_eq!(bounds, vec![(k("a\0"), k("z\0"))]);
    }

    #[test]
    fn unbounded_table_with_splits() {
        let parts = create_partitions(&[k("b"), k("d")], &[]).expect("create partitions");
        assert_eq!(
            parts,
            vec![
                Partition::new(vec![], k("b")),
                Partition::new(k("b"), k("d")),
                Partition::new(k("d"), vec![]),
            ]
        );
    }

    #[test]
    fn bounded_ranges_with_interior_split() {
        let parts = create_partitions(&[k("c")], &[(k("a"), k("f")), (k("f"), k("m"))])
            .expect("create partitions");
        assert_eq!(
            parts,
            vec![
                Partition::new(k("a"), k("c")),
                Partition::new(k("c"), k("f")),
                Partition::new(k("f"), k("m")),
            ]
        );
    }

    #[test]
    fn overlap_and_bad_bounds_rejected() {
        assert!(create_partitions(&[], &[(k("a"), k("c")), (k("b"), k("d"))]).is_err());
        assert!(create_partitions(&[], &[(k("c"), k("c"))]).is_err());
        assert!(create_partitions(&[], &[(k("d"), k("a"))]).is_err());
        // First bound unbounded above overlaps anything after it.
        assert!(create_partitions(&[], &[(k("a"), vec![]), (k("x"), vec![])]).is_err());
    }

    #[test]
    fn split_outside_bounds_rejected() {
        let err = create_partitions(&[k("z")], &[(k("a"), k("c"))]).expect_err("stray split");
        assert!(err.to_string().contains("does not fall in a range partition"));
        assert!(create_partitions(&[k("a")], &[(k("a"), k("c"))]).is_err());
        assert!(create_partitions(&[k("b"), k("b")], &[(k("a"), k("c"))]).is_err());
    }
}
