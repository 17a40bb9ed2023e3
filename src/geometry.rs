//! Great-circle helpers shared by the loader and the interpolator.

use geo::{Coord, Distance, Haversine, Point};

/// Decimal places kept for stored coordinates (~11 m).
pub const COORDINATE_DECIMALS: i32 = 4;

/// Great-circle distance in meters between two `(lon, lat)` coordinates.
pub fn distance_meters(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Haversine.distance(Point::from(a), Point::from(b))
}

/// Running sum of segment lengths, starting at 0 for the first coordinate.
pub fn cumulative_distances<I>(coords: I) -> Vec<f64>
where
    I: IntoIterator<Item = Coord<f64>>,
{
    let mut result = vec![];
    let mut previous: Option<Coord<f64>> = None;
    let mut total = 0.0;
    for coord in coords {
        if let Some(previous) = previous {
            total += distance_meters(previous, coord);
        }
        result.push(total);
        previous = Some(coord);
    }
    result
}

/// Index of the coordinate closest to `target`.
///
/// This is an exhaustive scan without a distance cutoff, so a far away point still
/// matches if nothing is closer. Ties resolve to the lowest index.
pub fn nearest_index<I>(coords: I, target: Coord<f64>) -> Option<(usize, f64)>
where
    I: IntoIterator<Item = Coord<f64>>,
{
    let mut best: Option<(usize, f64)> = None;
    for (i, coord) in coords.into_iter().enumerate() {
        let distance = distance_meters(coord, target);
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((i, distance)),
        }
    }
    best
}

pub fn round_coordinate(value: f64) -> f64 {
    let factor = 10f64.powi(COORDINATE_DECIMALS);
    (value * factor).round() / factor
}

/// Rounded coordinate as integer ten-thousandths, usable as an exact comparison key.
pub fn coordinate_key(value: f64) -> i64 {
    (value * 10f64.powi(COORDINATE_DECIMALS)).round() as i64
}
