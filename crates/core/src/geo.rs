//! Geographic helpers for radius queries.
//!
//! Decomposing a radius query into bounded range scans belongs to the
//! backing-store adapter. This module only covers what the cache layer needs
//! to reason about the results: distances and the rule for merging the
//! per-range partitions into one ordered stream.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::query::{GeoClause, SortDirection};

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Haversine distance to `other`, in meters.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lng = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }
}

/// Distance of an entity's geo column from the clause center.
///
/// Returns `None` when the entity has no geo-point in that column.
pub fn entity_distance(entity: &Entity, clause: &GeoClause) -> Option<f64> {
    let point = entity.get(&clause.field)?.as_geo_point()?;
    Some(clause.center.distance_meters(&point))
}

/// True when the entity lies within the clause radius.
pub fn within_radius(entity: &Entity, clause: &GeoClause) -> bool {
    entity_distance(entity, clause).is_some_and(|d| d <= clause.radius_meters)
}

/// Merges range partitions into the batches that may be yielded.
///
/// With a sort direction, partitions are not ordered relative to each other,
/// so everything is collected, sorted by distance and truncated before a
/// single batch is produced. Without one, each partition is passed through
/// as soon as it is available, and the limit truncates the merged stream.
pub fn merge_partitions(
    partitions: Vec<Vec<Entity>>,
    clause: &GeoClause,
    limit: Option<usize>,
) -> Vec<Vec<Entity>> {
    match clause.direction {
        Some(direction) => {
            let mut all: Vec<(f64, Entity)> = partitions
                .into_iter()
                .flatten()
                .filter_map(|e| entity_distance(&e, clause).map(|d| (d, e)))
                .collect();
            all.sort_by(|(a, _), (b, _)| {
                let ordering = a.partial_cmp(b).unwrap_or(Ordering::Equal);
                match direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
            if let Some(limit) = limit {
                all.truncate(limit);
            }
            if all.is_empty() {
                return Vec::new();
            }
            vec![all.into_iter().map(|(_, e)| e).collect()]
        }
        None => {
            let mut remaining = limit.unwrap_or(usize::MAX);
            let mut batches = Vec::new();
            for mut partition in partitions {
                if remaining == 0 {
                    break;
                }
                partition.truncate(remaining);
                remaining -= partition.len();
                if !partition.is_empty() {
                    batches.push(partition);
                }
            }
            batches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Key;

    fn place(id: i64, lat: f64, lng: f64) -> Entity {
        Entity::new(Key::with_id("ns", "Place", id)).with("location", GeoPoint::new(lat, lng))
    }

    fn clause(direction: Option<SortDirection>) -> GeoClause {
        GeoClause {
            field: "location".to_string(),
            center: GeoPoint::new(0.0, 0.0),
            radius_meters: 1_000_000.0,
            direction,
        }
    }

    #[test]
    fn test_distance_one_degree_longitude_at_equator() {
        let d = GeoPoint::new(0.0, 0.0).distance_meters(&GeoPoint::new(0.0, 1.0));
        assert!((d - 111_195.0).abs() < 100.0, "distance was {d}");
    }

    #[test]
    fn test_distance_is_zero_for_same_point() {
        let p = GeoPoint::new(51.5, -0.12);
        assert_eq!(p.distance_meters(&p), 0.0);
    }

    #[test]
    fn test_within_radius() {
        let c = clause(None);
        assert!(within_radius(&place(1, 0.0, 1.0), &c));
        assert!(!within_radius(&place(2, 0.0, 20.0), &c));
        assert!(!within_radius(
            &Entity::new(Key::with_id("ns", "Place", 3)),
            &c
        ));
    }

    #[test]
    fn test_sorted_merge_orders_across_partitions() {
        let partitions = vec![
            vec![place(3, 0.0, 3.0), place(1, 0.0, 1.0)],
            vec![place(2, 0.0, -2.0)],
        ];

        let batches = merge_partitions(partitions, &clause(Some(SortDirection::Ascending)), Some(2));

        assert_eq!(batches.len(), 1);
        let ids: Vec<_> = batches[0].iter().map(|e| e.key.clone()).collect();
        assert_eq!(
            ids,
            vec![Key::with_id("ns", "Place", 1), Key::with_id("ns", "Place", 2)]
        );
    }

    #[test]
    fn test_sorted_merge_descending() {
        let partitions = vec![vec![place(1, 0.0, 1.0)], vec![place(2, 0.0, 2.0)]];

        let batches = merge_partitions(partitions, &clause(Some(SortDirection::Descending)), None);

        assert_eq!(batches[0][0].key, Key::with_id("ns", "Place", 2));
    }

    #[test]
    fn test_unsorted_merge_streams_partitions_and_truncates() {
        let partitions = vec![
            vec![place(1, 0.0, 1.0), place(2, 0.0, 2.0)],
            vec![],
            vec![place(3, 0.0, 3.0), place(4, 0.0, 4.0)],
            vec![place(5, 0.0, 5.0)],
        ];

        let batches = merge_partitions(partitions, &clause(None), Some(3));

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].key, Key::with_id("ns", "Place", 3));
    }
}
