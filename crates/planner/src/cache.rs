//! Structural plan digests and the bounded LRU plan cache.

use crate::{LogicalPlan, PhysicalPlan};
use ahash::AHasher;
use common::{BooleanPredicate, KnnPredicate};
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use types::Value;

/// Deep structural digest of a logical tree. Floats hash by bit pattern,
/// so two queries digest equally iff their trees are identical.
pub fn digest(plan: &LogicalPlan) -> u64 {
    let mut hasher = AHasher::default();
    hash_plan(plan, &mut hasher);
    hasher.finish()
}

fn hash_plan(plan: &LogicalPlan, h: &mut impl Hasher) {
    std::mem::discriminant(plan).hash(h);
    match plan {
        LogicalPlan::EntityScan { entity, columns } => {
            entity.hash(h);
            columns.hash(h);
        }
        LogicalPlan::Sample {
            entity,
            columns,
            size,
            seed,
        } => {
            entity.hash(h);
            columns.hash(h);
            size.hash(h);
            seed.hash(h);
        }
        LogicalPlan::Filter { input, predicate } => {
            hash_plan(input, h);
            hash_predicate(predicate, h);
        }
        LogicalPlan::Knn { input, predicate } => {
            hash_plan(input, h);
            hash_knn(predicate, h);
        }
        LogicalPlan::Projection { input, op, columns } => {
            hash_plan(input, h);
            op.hash(h);
            columns.hash(h);
        }
        LogicalPlan::Limit { input, limit, skip } => {
            hash_plan(input, h);
            limit.hash(h);
            skip.hash(h);
        }
        LogicalPlan::Insert { entity, rows } => {
            entity.hash(h);
            rows.len().hash(h);
            for row in rows {
                for (column, value) in row {
                    column.hash(h);
                    hash_value(value, h);
                }
            }
        }
        LogicalPlan::Update {
            entity,
            predicate,
            assignments,
        } => {
            entity.hash(h);
            if let Some(p) = predicate {
                hash_predicate(p, h);
            }
            for (column, value) in assignments {
                column.hash(h);
                hash_value(value, h);
            }
        }
        LogicalPlan::Delete { entity, predicate } => {
            entity.hash(h);
            if let Some(p) = predicate {
                hash_predicate(p, h);
            }
        }
        LogicalPlan::OptimizeEntity { entity } => entity.hash(h),
    }
}

fn hash_predicate(pred: &BooleanPredicate, h: &mut impl Hasher) {
    match pred {
        BooleanPredicate::Atomic {
            column,
            op,
            not,
            values,
        } => {
            0u8.hash(h);
            column.hash(h);
            op.hash(h);
            not.hash(h);
            for v in values {
                hash_value(v, h);
            }
        }
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            1u8.hash(h);
            connector.hash(h);
            hash_predicate(left, h);
            hash_predicate(right, h);
        }
    }
}

fn hash_knn(knn: &KnnPredicate, h: &mut impl Hasher) {
    knn.column.hash(h);
    knn.k.hash(h);
    knn.distance.hash(h);
    knn.hint.hash(h);
    for q in &knn.queries {
        for x in q {
            x.to_bits().hash(h);
        }
    }
    if let Some(weights) = &knn.weights {
        for w in weights {
            for x in w {
                x.to_bits().hash(h);
            }
        }
    }
}

fn hash_value(value: &Value, h: &mut impl Hasher) {
    std::mem::discriminant(value).hash(h);
    match value {
        Value::Boolean(v) => v.hash(h),
        Value::Byte(v) => v.hash(h),
        Value::Short(v) => v.hash(h),
        Value::Int(v) => v.hash(h),
        Value::Long(v) | Value::Date(v) => v.hash(h),
        Value::Float(v) => v.to_bits().hash(h),
        Value::Double(v) => v.to_bits().hash(h),
        Value::String(v) => v.hash(h),
        Value::Complex32(re, im) => {
            re.to_bits().hash(h);
            im.to_bits().hash(h);
        }
        Value::Complex64(re, im) => {
            re.to_bits().hash(h);
            im.to_bits().hash(h);
        }
        Value::BooleanVector(v) => v.hash(h),
        Value::IntVector(v) => v.hash(h),
        Value::LongVector(v) => v.hash(h),
        Value::FloatVector(v) => v.iter().for_each(|x| x.to_bits().hash(h)),
        Value::DoubleVector(v) => v.iter().for_each(|x| x.to_bits().hash(h)),
        Value::Complex32Vector(v) => v.iter().for_each(|(re, im)| {
            re.to_bits().hash(h);
            im.to_bits().hash(h);
        }),
        Value::Complex64Vector(v) => v.iter().for_each(|(re, im)| {
            re.to_bits().hash(h);
            im.to_bits().hash(h);
        }),
        Value::Null => {}
    }
}

/// Bounded LRU of selected plans, keyed by logical digest.
pub struct PlanCache {
    inner: Mutex<LruCache<u64, Arc<PhysicalPlan>>>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> PlanCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        PlanCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<PhysicalPlan>> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn put(&self, key: u64, plan: Arc<PhysicalPlan>) {
        self.inner.lock().put(key, plan);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
