//! Index bucket derivation.
//!
//! Buckets are the secondary sets (`INDEXALL`, `INDEXCOL`) that let a write
//! find cached queries it may have invalidated even when the written entity
//! was not part of their results.

use std::collections::BTreeSet;

use crate::query::Query;
use crate::storage::{ColumnImpact, ModifiedEntity};

use super::keys::{index_all_key, index_column_key};

/// Columns a query depends on: filter, sort and geo columns.
pub fn query_columns(query: &Query) -> BTreeSet<String> {
    let mut columns: BTreeSet<String> = query.filters.iter().map(|f| f.field.clone()).collect();
    columns.extend(query.order.iter().map(|s| s.field.clone()));
    if let Some(geo) = &query.geo {
        columns.insert(geo.field.clone());
    }
    columns
}

/// Buckets a filled query registers itself in.
///
/// Queries without a column filter scan the whole kind and join `INDEXALL`;
/// every filtered, sorted or geo column adds its `INDEXCOL` bucket.
pub fn query_buckets(namespace: &str, query: &Query) -> Vec<String> {
    let mut buckets = Vec::new();
    if !query.has_column_filter() {
        buckets.push(index_all_key(namespace, &query.kind));
    }
    for column in query_columns(query) {
        buckets.push(index_column_key(namespace, &query.kind, &column));
    }
    buckets
}

/// Buckets whose queries must be purged after `modified` was written.
///
/// Creates and upserts have no prior snapshot, so they hit the kind-wide
/// bucket and every column they carry. Updates hit only the columns whose
/// value changed. Deletes rely solely on `CACHEDIN`.
pub fn modification_buckets(namespace: &str, modified: &ModifiedEntity) -> Vec<String> {
    let kind = modified.key.kind();
    match &modified.impact {
        ColumnImpact::Everything(columns) => {
            let mut buckets = vec![index_all_key(namespace, kind)];
            buckets.extend(columns.iter().map(|c| index_column_key(namespace, kind, c)));
            buckets
        }
        ColumnImpact::Columns(columns) => columns
            .iter()
            .map(|c| index_column_key(namespace, kind, c))
            .collect(),
        ColumnImpact::KeyOnly => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Key;
    use crate::geo::GeoPoint;
    use crate::query::{FilterOp, SortDirection};
    use crate::storage::WriteOperation;

    #[test]
    fn test_unfiltered_query_joins_index_all() {
        let query = Query::kind("Widget");
        assert_eq!(query_buckets("ns", &query), vec!["INDEXALL:ns:Widget"]);
    }

    #[test]
    fn test_sorted_unfiltered_query_joins_both() {
        let query = Query::kind("Widget").order_by("size", SortDirection::Ascending);
        assert_eq!(
            query_buckets("ns", &query),
            vec!["INDEXALL:ns:Widget", "INDEXCOL:ns:Widget:size"]
        );
    }

    #[test]
    fn test_filtered_query_joins_column_buckets_only() {
        let query = Query::kind("Widget")
            .filter("color", FilterOp::Equal, "red")
            .filter("color", FilterOp::NotEqual, "blue")
            .near("location", GeoPoint::new(0.0, 0.0), 10.0, None);

        assert_eq!(
            query_buckets("ns", &query),
            vec!["INDEXCOL:ns:Widget:color", "INDEXCOL:ns:Widget:location"]
        );
    }

    #[test]
    fn test_create_hits_everything() {
        let modified = ModifiedEntity {
            key: Key::with_id("ns", "Widget", 1),
            operation: WriteOperation::Create,
            impact: ColumnImpact::Everything(BTreeSet::from(["color".to_string()])),
        };

        assert_eq!(
            modification_buckets("ns", &modified),
            vec!["INDEXALL:ns:Widget", "INDEXCOL:ns:Widget:color"]
        );
    }

    #[test]
    fn test_update_hits_changed_columns() {
        let modified = ModifiedEntity {
            key: Key::with_id("ns", "Widget", 1),
            operation: WriteOperation::Update,
            impact: ColumnImpact::Columns(BTreeSet::from(["size".to_string()])),
        };

        assert_eq!(
            modification_buckets("ns", &modified),
            vec!["INDEXCOL:ns:Widget:size"]
        );
    }

    #[test]
    fn test_delete_hits_no_bucket() {
        let modified = ModifiedEntity {
            key: Key::with_id("ns", "Widget", 1),
            operation: WriteOperation::Delete,
            impact: ColumnImpact::KeyOnly,
        };

        assert!(modification_buckets("ns", &modified).is_empty());
    }
}
