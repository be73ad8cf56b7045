use serde::{Deserialize, Serialize};

use crate::entity::{Key, Value};
use crate::geo::GeoPoint;

/// Comparison operator of a single filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// Matches when the property equals any element of an array value.
    In,
}

impl FilterOp {
    /// Stable textual form used in fingerprints.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Equal => "eq",
            FilterOp::NotEqual => "ne",
            FilterOp::LessThan => "lt",
            FilterOp::LessThanOrEqual => "le",
            FilterOp::GreaterThan => "gt",
            FilterOp::GreaterThanOrEqual => "ge",
            FilterOp::In => "in",
        }
    }
}

/// `field op value`. A query's filters are combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Radius restriction on a geo-point column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoClause {
    pub field: String,
    pub center: GeoPoint,
    pub radius_meters: f64,
    /// Order results by distance from `center`.
    #[serde(default)]
    pub direction: Option<SortDirection>,
}

/// A query over one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order: Vec<Sort>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub ancestor: Option<Key>,
    #[serde(default)]
    pub geo: Option<GeoClause>,
}

impl Query {
    /// Starts a query over every entity of `kind`.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            ancestor: None,
            geo: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn near(
        mut self,
        field: impl Into<String>,
        center: GeoPoint,
        radius_meters: f64,
        direction: Option<SortDirection>,
    ) -> Self {
        self.geo = Some(GeoClause {
            field: field.into(),
            center,
            radius_meters,
            direction,
        });
        self
    }

    /// True when no column restricts the result set.
    pub fn has_column_filter(&self) -> bool {
        !self.filters.is_empty() || self.geo.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let query = Query::kind("Widget")
            .filter("color", FilterOp::Equal, "red")
            .order_by("size", SortDirection::Descending)
            .limit(10);

        assert_eq!(query.kind, "Widget");
        assert_eq!(query.filters.len(), 1);
        assert_eq!(query.order[0].direction, SortDirection::Descending);
        assert_eq!(query.limit, Some(10));
        assert!(query.has_column_filter());
    }

    #[test]
    fn test_unfiltered_query() {
        let query = Query::kind("Widget").order_by("size", SortDirection::Ascending);
        assert!(!query.has_column_filter());
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let query: Query = serde_json::from_str(r#"{"kind":"Widget"}"#).unwrap();
        assert_eq!(query, Query::kind("Widget"));
    }

    #[test]
    fn test_deserialize_filter_json() {
        let json = r#"{
            "kind": "Widget",
            "filters": [{"field": "color", "op": "equal", "value": {"type": "string", "value": "red"}}],
            "order": [{"field": "size"}],
            "limit": 5
        }"#;
        let query: Query = serde_json::from_str(json).unwrap();

        assert_eq!(
            query,
            Query::kind("Widget")
                .filter("color", FilterOp::Equal, "red")
                .order_by("size", SortDirection::Ascending)
                .limit(5)
        );
    }
}
