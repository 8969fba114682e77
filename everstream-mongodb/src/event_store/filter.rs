//! Translation of the condition algebra into MongoDB filter documents.
use bson::{doc, Bson, Document};
use everstream::Condition;

/// Builds a filter matching documents whose `field` satisfies `condition`.
///
/// An empty `And` matches everything; an empty `Or` matches nothing. `Not`
/// translates to `$nor` so that it composes with nested combinators.
pub(crate) fn condition_to_filter(field: &str, condition: &Condition<i64>) -> Document {
    match condition {
        Condition::Eq(value) => doc! { field: { "$eq": *value } },
        Condition::Ne(value) => doc! { field: { "$ne": *value } },
        Condition::Lt(value) => doc! { field: { "$lt": *value } },
        Condition::Lte(value) => doc! { field: { "$lte": *value } },
        Condition::Gt(value) => doc! { field: { "$gt": *value } },
        Condition::Gte(value) => doc! { field: { "$gte": *value } },
        Condition::And(operands) => {
            if operands.is_empty() {
                Document::new()
            } else {
                doc! { "$and": operands_to_filters(field, operands) }
            }
        }
        Condition::Or(operands) => {
            if operands.is_empty() {
                doc! { "$expr": false }
            } else {
                doc! { "$or": operands_to_filters(field, operands) }
            }
        }
        Condition::Not(operand) => doc! { "$nor": [condition_to_filter(field, operand)] },
    }
}

fn operands_to_filters(field: &str, operands: &[Condition<i64>]) -> Vec<Bson> {
    operands
        .iter()
        .map(|operand| Bson::Document(condition_to_filter(field, operand)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use everstream::condition::{and, eq, gte, lt, ne, not, or};

    #[test]
    fn it_translates_comparisons() {
        assert_eq!(
            condition_to_filter("version", &eq(10)),
            doc! { "version": { "$eq": 10_i64 } }
        );
        assert_eq!(
            condition_to_filter("version", &ne(1)),
            doc! { "version": { "$ne": 1_i64 } }
        );
    }

    #[test]
    fn it_translates_combinators() {
        assert_eq!(
            condition_to_filter("version", &and([gte(0), lt(100)])),
            doc! { "$and": [
                { "version": { "$gte": 0_i64 } },
                { "version": { "$lt": 100_i64 } },
            ]}
        );
        assert_eq!(
            condition_to_filter("version", &or([gte(100), lt(1)])),
            doc! { "$or": [
                { "version": { "$gte": 100_i64 } },
                { "version": { "$lt": 1_i64 } },
            ]}
        );
        assert_eq!(
            condition_to_filter("version", &not(eq(1))),
            doc! { "$nor": [ { "version": { "$eq": 1_i64 } } ] }
        );
    }

    #[test]
    fn empty_and_matches_everything() {
        assert_eq!(condition_to_filter("version", &and([])), Document::new());
    }
}
