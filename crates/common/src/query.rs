//! Wire-level query model. External callers hand the engine one [`Query`]
//! per request; the binder in the engine facade attaches catalogue objects
//! and lowers it to a logical plan.

use crate::names::{ColumnName, EntityName};
use crate::TupleId;
use serde::{Deserialize, Serialize};
use types::Value;

/// Comparison operator of an atomic Boolean predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    Like,
    Match,
    IsNull,
    Between,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connector {
    And,
    Or,
}

/// Boolean predicate tree over the columns of one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BooleanPredicate {
    Atomic {
        column: ColumnName,
        op: ComparisonOperator,
        not: bool,
        values: Vec<Value>,
    },
    Compound {
        connector: Connector,
        left: Box<BooleanPredicate>,
        right: Box<BooleanPredicate>,
    },
}

impl BooleanPredicate {
    /// All columns referenced anywhere in the tree, in encounter order.
    pub fn columns(&self) -> Vec<&ColumnName> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnName>) {
        match self {
            BooleanPredicate::Atomic { column, .. } => out.push(column),
            BooleanPredicate::Compound { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }

    /// Number of atomic leaves; a rough selectivity proxy for costing.
    pub fn atom_count(&self) -> usize {
        match self {
            BooleanPredicate::Atomic { .. } => 1,
            BooleanPredicate::Compound { left, right, .. } => {
                left.atom_count() + right.atom_count()
            }
        }
    }
}

/// Distance kernel selector for kNN predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    L1,
    L2,
    SquaredL2,
    Cosine,
    InnerProduct,
    Hamming,
    ChiSquared,
}

/// k-nearest-neighbour predicate against one vector column. Multiple query
/// vectors share `k`, the kernel, and the optional per-vector weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnPredicate {
    pub column: ColumnName,
    pub k: usize,
    pub queries: Vec<Vec<f64>>,
    pub weights: Option<Vec<Vec<f64>>>,
    pub distance: Distance,
    /// Optional index name hint; the planner still verifies `can_process`.
    pub hint: Option<String>,
}

impl KnnPredicate {
    /// Weights that are all ≈ 1 carry no information and are dropped by the
    /// operators for the unweighted fast path.
    pub fn effective_weights(&self) -> Option<&Vec<Vec<f64>>> {
        let w = self.weights.as_ref()?;
        let uniform = w
            .iter()
            .all(|ws| ws.iter().all(|x| (x - 1.0).abs() < 1e-9));
        if uniform { None } else { Some(w) }
    }
}

/// Projection head of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionOp {
    Select,
    Count,
    Exists,
    Sum,
    Max,
    Min,
    Mean,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub op: ProjectionOp,
    pub columns: Vec<(ColumnName, Option<String>)>,
}

/// Driving source of a query: a full entity or a seeded random sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QuerySource {
    Entity(EntityName),
    Sample {
        entity: EntityName,
        size: u64,
        seed: u64,
    },
}

impl QuerySource {
    pub fn entity(&self) -> &EntityName {
        match self {
            QuerySource::Entity(e) => e,
            QuerySource::Sample { entity, .. } => entity,
        }
    }
}

/// A complete declarative query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub from: QuerySource,
    pub predicate: Option<BooleanPredicate>,
    pub knn: Option<KnnPredicate>,
    pub projection: Projection,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

/// One result tuple. The owning operator knows the column layout; records
/// carry only the tuple id and the positional values.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub tid: TupleId,
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(tid: TupleId, values: Vec<Value>) -> Record {
        Record { tid, values }
    }
}

/// Change notification emitted by writing entity transactions and consumed
/// by every incrementally-updatable index before the entity commit returns.
#[derive(Clone, Debug, PartialEq)]
pub enum DataChangeEvent {
    Insert {
        entity: EntityName,
        tid: TupleId,
        values: Vec<(ColumnName, Value)>,
    },
    Update {
        entity: EntityName,
        tid: TupleId,
        old: Vec<(ColumnName, Value)>,
        new: Vec<(ColumnName, Value)>,
    },
    Delete {
        entity: EntityName,
        tid: TupleId,
        old: Vec<(ColumnName, Value)>,
    },
}

impl DataChangeEvent {
    pub fn tid(&self) -> TupleId {
        match self {
            DataChangeEvent::Insert { tid, .. }
            | DataChangeEvent::Update { tid, .. }
            | DataChangeEvent::Delete { tid, .. } => *tid,
        }
    }
}
