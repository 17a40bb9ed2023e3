//! Shared path geometry.
//!
//! Paths are keyed by a cheap fingerprint of their endpoints and length, not their full
//! geometry. Two paths with the same rounded endpoints and the same number of points share
//! one entry even if they differ in between; the first path seen defines the stored geometry.

use std::collections::HashMap;

use crate::geometry::round_coordinate;
use crate::interpolate::Waypoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint of a path, or `None` for an empty one.
    pub fn of(path: &[Waypoint]) -> Option<Self> {
        let first = path.first()?;
        let last = path.last()?;
        let key = format!(
            "{:.4},{:.4}|{:.4},{:.4}|{}",
            round_coordinate(first.longitude),
            round_coordinate(first.latitude),
            round_coordinate(last.longitude),
            round_coordinate(last.latitude),
            path.len()
        );
        Some(Fingerprint(xxhash_rust::xxh3::xxh3_64(key.as_bytes())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeVertex {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: f64,
}

impl From<&Waypoint> for ShapeVertex {
    fn from(waypoint: &Waypoint) -> Self {
        ShapeVertex {
            longitude: waypoint.longitude,
            latitude: waypoint.latitude,
            elevation: waypoint.elevation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShapeEntry {
    pub fingerprint: Fingerprint,
    pub vertices: Vec<ShapeVertex>,
}

/// Canonical shapes in insertion order; the position is the shape index in the container.
#[derive(Debug, Clone, Default)]
pub struct ShapeTable {
    entries: Vec<ShapeEntry>,
    index_by_fingerprint: HashMap<Fingerprint, usize>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the shared shape for `path`, inserting it if its fingerprint is new.
    ///
    /// Returns `None` for an empty path.
    pub fn intern(&mut self, path: &[Waypoint]) -> Option<usize> {
        let fingerprint = Fingerprint::of(path)?;
        let entries = &mut self.entries;
        let index = *self
            .index_by_fingerprint
            .entry(fingerprint)
            .or_insert_with(|| {
                entries.push(ShapeEntry {
                    fingerprint,
                    vertices: path.iter().map(ShapeVertex::from).collect(),
                });
                entries.len() - 1
            });
        Some(index)
    }

    pub fn get(&self, index: usize) -> Option<&ShapeEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ShapeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn waypoint(longitude: f64, latitude: f64, timestamp: u32) -> Waypoint {
        Waypoint {
            longitude,
            latitude,
            elevation: 0.0,
            timestamp,
        }
    }

    #[test]
    fn same_endpoints_and_length_share_a_shape() {
        // Different middle geometry, same endpoints and point count: this collision is the
        // intended trade-off of the fingerprint, not a false positive.
        let a = [waypoint(13.0, 52.0, 0), waypoint(13.1, 52.1, 10), waypoint(13.2, 52.2, 20)];
        let b = [waypoint(13.0, 52.0, 5), waypoint(13.9, 51.5, 15), waypoint(13.2, 52.2, 25)];
        let mut table = ShapeTable::new();
        assert_eq!(table.intern(&a), Some(0));
        assert_eq!(table.intern(&b), Some(0));
        assert_eq!(table.len(), 1);
        // First seen wins.
        assert_eq!(table.get(0).unwrap().vertices[1].longitude, 13.1);
    }

    #[test]
    fn length_or_endpoint_differences_split_shapes() {
        let a = [waypoint(13.0, 52.0, 0), waypoint(13.2, 52.2, 20)];
        let longer = [waypoint(13.0, 52.0, 0), waypoint(13.1, 52.1, 10), waypoint(13.2, 52.2, 20)];
        let moved = [waypoint(13.0, 52.0, 0), waypoint(13.2, 52.3, 20)];
        let mut table = ShapeTable::new();
        assert_eq!(table.intern(&a), Some(0));
        assert_eq!(table.intern(&longer), Some(1));
        assert_eq!(table.intern(&moved), Some(2));
        assert_eq!(table.intern(&a), Some(0));
        assert_eq!(table.intern(&[]), None);
        assert!(!table.is_empty());
    }

    #[test]
    fn endpoints_compare_at_four_decimals() {
        let a = [waypoint(13.00001, 52.0, 0), waypoint(13.2, 52.2, 20)];
        let b = [waypoint(13.00004, 52.0, 0), waypoint(13.2, 52.20002, 20)];
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    proptest! {
        #[test]
        fn collision_rule_is_exactly_endpoints_and_count(
            first in (-180.0f64..180.0, -90.0f64..90.0),
            last in (-180.0f64..180.0, -90.0f64..90.0),
            middle_a in prop::collection::vec((-180.0f64..180.0, -90.0f64..90.0), 0..20),
            middle_b_seed in prop::collection::vec((-180.0f64..180.0, -90.0f64..90.0), 20),
        ) {
            let build = |middle: &[(f64, f64)]| {
                let mut path = vec![waypoint(first.0, first.1, 0)];
                path.extend(middle.iter().map(|&(lon, lat)| waypoint(lon, lat, 1)));
                path.push(waypoint(last.0, last.1, 2));
                path
            };
            let a = build(&middle_a);
            let b = build(&middle_b_seed[..middle_a.len()]);
            let c = build(&middle_b_seed[..middle_a.len() + 1]);

            let mut table = ShapeTable::new();
            let index_a = table.intern(&a);
            prop_assert_eq!(table.intern(&b), index_a);
            prop_assert_ne!(table.intern(&c), index_a);
            prop_assert!(table.len() <= 3);
        }
    }
}
