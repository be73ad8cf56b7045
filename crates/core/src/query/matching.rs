//! Pure filter evaluation and ordering.
//!
//! Backing-store adapters that cannot push a query down use these to
//! evaluate it in process. Semantics follow document-store conventions: an
//! entity lacking a filtered or sorted property never matches, and an array
//! property matches when any of its elements does.

use std::cmp::Ordering;

use crate::entity::{Entity, Value};
use crate::geo;

use super::{Filter, FilterOp, Query, Sort, SortDirection};

/// Orders two values of compatible types.
///
/// Integers and doubles compare numerically with each other; every other
/// pair of different types is incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
        (Value::Double(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Key(a), Value::Key(b)) => Some(a.cmp(b)),
        (Value::GeoPoint(a), Value::GeoPoint(b)) => a
            .latitude
            .partial_cmp(&b.latitude)
            .map(|o| o.then(a.longitude.partial_cmp(&b.longitude).unwrap_or(Ordering::Equal))),
        _ => None,
    }
}

fn scalar_matches(property: &Value, op: FilterOp, operand: &Value) -> bool {
    if op == FilterOp::In {
        return match operand {
            Value::Array(candidates) => candidates
                .iter()
                .any(|c| compare_values(property, c) == Some(Ordering::Equal)),
            _ => false,
        };
    }
    let ordering = compare_values(property, operand);
    match op {
        FilterOp::Equal => ordering == Some(Ordering::Equal),
        FilterOp::NotEqual => ordering != Some(Ordering::Equal),
        FilterOp::LessThan => ordering == Some(Ordering::Less),
        FilterOp::LessThanOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        FilterOp::GreaterThan => ordering == Some(Ordering::Greater),
        FilterOp::GreaterThanOrEqual => {
            matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
        }
        FilterOp::In => false,
    }
}

/// Evaluates one filter against an entity.
pub fn matches_filter(entity: &Entity, filter: &Filter) -> bool {
    let Some(property) = entity.get(&filter.field) else {
        return false;
    };
    match (property, &filter.value) {
        (Value::Array(elements), operand) if !matches!(operand, Value::Array(_)) || filter.op == FilterOp::In => {
            elements
                .iter()
                .any(|element| scalar_matches(element, filter.op, operand))
        }
        (property, operand) => scalar_matches(property, filter.op, operand),
    }
}

/// Evaluates every restriction of `query` (kind, ancestor, filters, geo
/// radius) except ordering and limit.
pub fn matches_query(entity: &Entity, query: &Query) -> bool {
    if entity.kind() != query.kind {
        return false;
    }
    if let Some(ancestor) = &query.ancestor {
        if !entity.key.has_ancestor(ancestor) {
            return false;
        }
    }
    if let Some(clause) = &query.geo {
        if !geo::within_radius(entity, clause) {
            return false;
        }
    }
    if query.order.iter().any(|s| entity.get(&s.field).is_none()) {
        return false;
    }
    query.filters.iter().all(|f| matches_filter(entity, f))
}

/// Compares two entities by a sort order, falling back to key order
/// so results are deterministic.
pub fn compare_entities(a: &Entity, b: &Entity, order: &[Sort]) -> Ordering {
    for sort in order {
        let ordering = match (a.get(&sort.field), b.get(&sort.field)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| x.type_tag().cmp(y.type_tag())),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = match sort.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.key.cmp(&b.key)
}

/// Filters, orders and truncates an in-memory candidate set.
pub fn evaluate<'a, I>(candidates: I, query: &Query) -> Vec<Entity>
where
    I: IntoIterator<Item = &'a Entity>,
{
    let mut results: Vec<Entity> = candidates
        .into_iter()
        .filter(|e| matches_query(e, query))
        .cloned()
        .collect();
    results.sort_by(|a, b| compare_entities(a, b, &query.order));
    if query.geo.as_ref().and_then(|g| g.direction).is_none() {
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Key, KeyId};

    fn widget(id: i64, color: &str, size: i64) -> Entity {
        Entity::new(Key::with_id("ns", "Widget", id))
            .with("color", color)
            .with("size", size)
    }

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(
            compare_values(&Value::Integer(2), &Value::Double(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_values(&Value::Integer(1), &Value::from("1")), None);
    }

    #[test]
    fn test_equality_filter() {
        let query = Query::kind("Widget").filter("color", FilterOp::Equal, "red");
        assert!(matches_query(&widget(1, "red", 1), &query));
        assert!(!matches_query(&widget(2, "blue", 1), &query));
    }

    #[test]
    fn test_missing_property_never_matches() {
        let entity = Entity::new(Key::with_id("ns", "Widget", 1));
        let filter = Filter {
            field: "color".to_string(),
            op: FilterOp::NotEqual,
            value: Value::from("red"),
        };
        assert!(!matches_filter(&entity, &filter));
    }

    #[test]
    fn test_range_filters() {
        let entity = widget(1, "red", 5);
        let check = |op, v: i64| {
            matches_filter(
                &entity,
                &Filter {
                    field: "size".to_string(),
                    op,
                    value: Value::Integer(v),
                },
            )
        };
        assert!(check(FilterOp::GreaterThan, 4));
        assert!(!check(FilterOp::GreaterThan, 5));
        assert!(check(FilterOp::GreaterThanOrEqual, 5));
        assert!(check(FilterOp::LessThan, 6));
        assert!(check(FilterOp::LessThanOrEqual, 5));
        assert!(!check(FilterOp::LessThan, 5));
    }

    #[test]
    fn test_in_filter() {
        let query = Query::kind("Widget").filter("color", FilterOp::In, vec!["red", "green"]);
        assert!(matches_query(&widget(1, "red", 1), &query));
        assert!(!matches_query(&widget(2, "blue", 1), &query));
    }

    #[test]
    fn test_array_property_matches_any_element() {
        let entity = Entity::new(Key::with_id("ns", "Widget", 1)).with("tags", vec!["a", "b"]);
        let query = Query::kind("Widget").filter("tags", FilterOp::Equal, "b");
        assert!(matches_query(&entity, &query));
    }

    #[test]
    fn test_ancestor_restriction() {
        let account = Key::with_name("ns", "Account", "acme");
        let inside = Entity::new(account.child("Widget", KeyId::Id(1)));
        let outside = Entity::new(Key::with_id("ns", "Widget", 2));
        let query = Query::kind("Widget").ancestor(account);

        assert!(matches_query(&inside, &query));
        assert!(!matches_query(&outside, &query));
    }

    #[test]
    fn test_evaluate_sorts_and_limits() {
        let entities = vec![widget(1, "red", 3), widget(2, "red", 1), widget(3, "red", 2)];
        let query = Query::kind("Widget")
            .order_by("size", SortDirection::Descending)
            .limit(2);

        let results = evaluate(&entities, &query);

        let sizes: Vec<_> = results.iter().map(|e| e.get("size").cloned()).collect();
        assert_eq!(sizes, vec![Some(Value::Integer(3)), Some(Value::Integer(2))]);
    }

    #[test]
    fn test_sort_excludes_entities_missing_the_column() {
        let entities = vec![
            widget(1, "red", 3),
            Entity::new(Key::with_id("ns", "Widget", 2)).with("color", "red"),
        ];
        let query = Query::kind("Widget").order_by("size", SortDirection::Ascending);

        assert_eq!(evaluate(&entities, &query).len(), 1);
    }
}
