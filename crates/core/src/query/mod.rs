mod matching;
mod types;

pub use matching::{compare_entities, compare_values, evaluate, matches_filter, matches_query};
pub use types::{Filter, FilterOp, GeoClause, Query, Sort, SortDirection};
