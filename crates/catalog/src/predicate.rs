//! Row-at-a-time Boolean predicate evaluation, shared by the entity-level
//! filter and the linear-scan filter operator.

use common::{BooleanPredicate, ColumnName, ComparisonOperator, Connector, DbError, DbResult};
use regex::Regex;
use types::Value;

/// Evaluate a predicate against one tuple. `lookup` resolves a column to
/// its value in the tuple; a `None` means the column was not fetched,
/// which is an execution bug, not a data condition.
pub fn eval_predicate(
    predicate: &BooleanPredicate,
    lookup: &dyn Fn(&ColumnName) -> Option<Value>,
) -> DbResult<bool> {
    match predicate {
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            let l = eval_predicate(left, lookup)?;
            Ok(match connector {
                Connector::And => l && eval_predicate(right, lookup)?,
                Connector::Or => l || eval_predicate(right, lookup)?,
            })
        }
        BooleanPredicate::Atomic {
            column,
            op,
            not,
            values,
        } => {
            let value = lookup(column).ok_or_else(|| {
                DbError::OperatorExecution(format!("column '{column}' was not fetched"))
            })?;
            let hit = eval_atomic(&value, *op, values, column)?;
            Ok(hit != *not)
        }
    }
}

fn eval_atomic(
    value: &Value,
    op: ComparisonOperator,
    rhs: &[Value],
    column: &ColumnName,
) -> DbResult<bool> {
    if op == ComparisonOperator::IsNull {
        return Ok(value.is_null());
    }
    // SQL-style null semantics: null never compares.
    if value.is_null() {
        return Ok(false);
    }
    let first = rhs.first().ok_or_else(|| {
        DbError::QuerySyntax(format!("operator {op:?} on '{column}' needs a value"))
    })?;
    Ok(match op {
        ComparisonOperator::Equal => value.eq_same_type(first) == Some(true),
        ComparisonOperator::NotEqual => value.eq_same_type(first) == Some(false),
        ComparisonOperator::Less => {
            matches!(value.cmp_same_type(first), Some(std::cmp::Ordering::Less))
        }
        ComparisonOperator::LessEqual => matches!(
            value.cmp_same_type(first),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        ),
        ComparisonOperator::Greater => {
            matches!(value.cmp_same_type(first), Some(std::cmp::Ordering::Greater))
        }
        ComparisonOperator::GreaterEqual => matches!(
            value.cmp_same_type(first),
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        ),
        ComparisonOperator::In => rhs.iter().any(|v| value.eq_same_type(v) == Some(true)),
        ComparisonOperator::Between => {
            let second = rhs.get(1).ok_or_else(|| {
                DbError::QuerySyntax(format!("BETWEEN on '{column}' needs two values"))
            })?;
            matches!(
                value.cmp_same_type(first),
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            ) && matches!(
                value.cmp_same_type(second),
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            )
        }
        ComparisonOperator::Like => match (value, first) {
            (Value::String(s), Value::String(pattern)) => like_matches(pattern, s)?,
            _ => false,
        },
        ComparisonOperator::Match => match (value, first) {
            // Linear-scan MATCH: every query token occurs in the value.
            (Value::String(s), Value::String(query)) => {
                let haystack = s.to_lowercase();
                query
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                    .all(|t| haystack.contains(t))
            }
            _ => false,
        },
        ComparisonOperator::IsNull => unreachable!("handled above"),
    })
}

fn like_matches(pattern: &str, candidate: &str) -> DbResult<bool> {
    let mut out = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    let re = Regex::new(&out)
        .map_err(|e| DbError::QuerySyntax(format!("bad LIKE pattern '{pattern}': {e}")))?;
    Ok(re.is_match(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SchemaName;

    fn column() -> ColumnName {
        SchemaName::new("s").entity("e").column("c")
    }

    fn atom(op: ComparisonOperator, not: bool, values: Vec<Value>) -> BooleanPredicate {
        BooleanPredicate::Atomic {
            column: column(),
            op,
            not,
            values,
        }
    }

    fn eval(pred: &BooleanPredicate, value: Value) -> bool {
        eval_predicate(pred, &move |_| Some(value.clone())).unwrap()
    }

    #[test]
    fn comparisons() {
        assert!(eval(&atom(ComparisonOperator::Equal, false, vec![Value::Int(3)]), Value::Int(3)));
        assert!(eval(&atom(ComparisonOperator::Less, false, vec![Value::Int(5)]), Value::Int(3)));
        assert!(!eval(&atom(ComparisonOperator::Greater, false, vec![Value::Int(5)]), Value::Int(3)));
        assert!(eval(
            &atom(ComparisonOperator::Between, false, vec![Value::Int(1), Value::Int(5)]),
            Value::Int(3)
        ));
        assert!(eval(
            &atom(ComparisonOperator::In, false, vec![Value::Int(1), Value::Int(3)]),
            Value::Int(3)
        ));
    }

    #[test]
    fn negation_flips() {
        assert!(eval(&atom(ComparisonOperator::Equal, true, vec![Value::Int(4)]), Value::Int(3)));
        assert!(!eval(&atom(ComparisonOperator::Equal, true, vec![Value::Int(3)]), Value::Int(3)));
    }

    #[test]
    fn null_never_compares_but_isnull_sees_it() {
        assert!(!eval(&atom(ComparisonOperator::Equal, false, vec![Value::Int(3)]), Value::Null));
        assert!(eval(&atom(ComparisonOperator::IsNull, false, vec![]), Value::Null));
        assert!(!eval(&atom(ComparisonOperator::IsNull, false, vec![]), Value::Int(3)));
    }

    #[test]
    fn like_and_match() {
        assert!(eval(
            &atom(ComparisonOperator::Like, false, vec![Value::String("ha%".into())]),
            Value::String("hare".into())
        ));
        assert!(!eval(
            &atom(ComparisonOperator::Like, false, vec![Value::String("ha_".into())]),
            Value::String("hare".into())
        ));
        assert!(eval(
            &atom(ComparisonOperator::Match, false, vec![Value::String("quick fox".into())]),
            Value::String("the quick brown fox".into())
        ));
    }

    #[test]
    fn compound_connectors() {
        let both = BooleanPredicate::Compound {
            connector: Connector::And,
            left: Box::new(atom(ComparisonOperator::Greater, false, vec![Value::Int(1)])),
            right: Box::new(atom(ComparisonOperator::Less, false, vec![Value::Int(5)])),
        };
        assert!(eval(&both, Value::Int(3)));
        assert!(!eval(&both, Value::Int(7)));

        let either = BooleanPredicate::Compound {
            connector: Connector::Or,
            left: Box::new(atom(ComparisonOperator::Equal, false, vec![Value::Int(1)])),
            right: Box::new(atom(ComparisonOperator::Equal, false, vec![Value::Int(7)])),
        };
        assert!(eval(&either, Value::Int(7)));
        assert!(!eval(&either, Value::Int(3)));
    }

    #[test]
    fn cross_type_comparison_is_false() {
        assert!(!eval(
            &atom(ComparisonOperator::Equal, false, vec![Value::String("3".into())]),
            Value::Int(3)
        ));
    }
}
