//! Typed, indexed schedule tables built from raw feed rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use geo::{coord, Coord};
use serde::Serialize;
use ustr::{ustr, Ustr};

use crate::feed_rkyv::RawFeed;
use crate::geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RouteID(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StopID(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TripID(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ShapeID(pub Ustr);

/// Vehicle category of a route. The discriminant is the byte stored in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TransitMode {
    Tram = 0,
    Subway = 1,
    Rail = 2,
    Bus = 3,
    Ferry = 4,
    CableTram = 5,
    AerialLift = 6,
    Funicular = 7,
    Unknown = 255,
}

impl TransitMode {
    /// Maps basic and extended GTFS route types. Anything without a mode of its own,
    /// including air and taxi services, becomes [`TransitMode::Bus`].
    pub fn from_route_type(route_type: Option<i16>) -> Self {
        let Some(code) = route_type else {
            return Self::Bus;
        };
        match code {
            0 | 900..=999 => Self::Tram,
            1 | 400..=499 => Self::Subway,
            2 | 100..=199 => Self::Rail,
            3 | 200..=299 | 700..=799 => Self::Bus,
            4 | 1000..=1099 | 1200..=1299 => Self::Ferry,
            5 => Self::CableTram,
            6 | 1300..=1399 => Self::AerialLift,
            7 | 1400..=1499 => Self::Funicular,
            _ => Self::Bus,
        }
    }

    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Tram,
            1 => Self::Subway,
            2 => Self::Rail,
            3 => Self::Bus,
            4 => Self::Ferry,
            5 => Self::CableTram,
            6 => Self::AerialLift,
            7 => Self::Funicular,
            _ => Self::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Color used when the feed does not provide one.
    pub fn default_color(self) -> [u8; 3] {
        match self {
            Self::Tram => [0xD7, 0x26, 0x1E],
            Self::Subway => [0x00, 0x5F, 0xA8],
            Self::Rail => [0x00, 0x8D, 0x4F],
            Self::Bus => [0x95, 0x27, 0x6E],
            Self::Ferry => [0x00, 0x9B, 0xD5],
            Self::CableTram | Self::AerialLift | Self::Funicular => [0xF0, 0x8A, 0x00],
            Self::Unknown => [0x80, 0x80, 0x80],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub id: RouteID,
    pub mode: TransitMode,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub color: [u8; 3],
}

impl Route {
    /// Short name if present, else long name, else the route id.
    pub fn display_name(&self) -> &str {
        [&self.short_name, &self.long_name]
            .into_iter()
            .flatten()
            .map(|name| name.trim())
            .find(|name| !name.is_empty())
            .unwrap_or(self.id.0.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub id: TripID,
    pub route_id: RouteID,
    pub shape_id: Option<ShapeID>,
    pub headsign: String,
    pub direction: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct StopTime {
    pub stop_id: StopID,
    pub arrival: u32,
    pub departure: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ShapePoint {
    pub coord: Coord<f64>,
    pub sequence: u32,
    /// Cumulative distance from the first point of the shape.
    ///
    /// Taken from the feed when every point carries it, otherwise the great-circle
    /// running sum in meters.
    pub dist_traveled: f64,
}

/// Counts of rows the loader could not use. None of these are fatal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub routes: usize,
    pub stops: usize,
    pub trips: usize,
    pub shapes: usize,
    pub duplicate_routes: usize,
    pub duplicate_trips: usize,
    pub stops_without_coordinates: usize,
    pub trips_with_unknown_route: usize,
    pub trips_with_unknown_shape: usize,
    pub stop_times_with_unknown_trip: usize,
    pub stop_times_with_unknown_stop: usize,
    pub stop_times_without_time: usize,
    pub shapes_with_backfilled_distance: usize,
}

/// The loaded schedule. Immutable once [`Schedule::load`] returns.
#[derive(Debug, Clone)]
pub struct Schedule {
    routes: Vec<Route>,
    route_index: HashMap<RouteID, usize>,
    stops: HashMap<StopID, Coord<f64>>,
    trips: Vec<Trip>,
    trips_by_route: BTreeMap<RouteID, Vec<usize>>,
    stop_times_by_trip: HashMap<TripID, Vec<StopTime>>,
    shapes: HashMap<ShapeID, Vec<ShapePoint>>,
    report: LoadReport,
}

impl Schedule {
    pub fn load(feed: &RawFeed) -> Self {
        let mut report = LoadReport::default();

        let mut routes = vec![];
        let mut route_index = HashMap::new();
        for row in &feed.routes {
            let id = RouteID(ustr(&row.route_id));
            if route_index.contains_key(&id) {
                report.duplicate_routes += 1;
                continue;
            }
            let mode = TransitMode::from_route_type(row.route_type);
            let color = row
                .route_color
                .as_deref()
                .and_then(parse_hex_color)
                .unwrap_or_else(|| mode.default_color());
            route_index.insert(id, routes.len());
            routes.push(Route {
                id,
                mode,
                short_name: row.route_short_name.clone(),
                long_name: row.route_long_name.clone(),
                color,
            });
        }

        let mut stops = HashMap::new();
        for row in &feed.stops {
            let (Some(lat), Some(lon)) = (row.stop_lat, row.stop_lon) else {
                report.stops_without_coordinates += 1;
                continue;
            };
            stops.insert(StopID(ustr(&row.stop_id)), coord! {x: lon, y: lat});
        }

        let shapes = load_shapes(feed, &mut report);

        let mut trips = vec![];
        let mut known_trips = HashSet::new();
        let mut trips_by_route: BTreeMap<RouteID, Vec<usize>> = BTreeMap::new();
        for row in &feed.trips {
            let trip_id = TripID(ustr(&row.trip_id));
            if known_trips.contains(&trip_id) {
                report.duplicate_trips += 1;
                continue;
            }
            let route_id = RouteID(ustr(&row.route_id));
            if !route_index.contains_key(&route_id) {
                log::debug!(
                    "Dropping trip {} with unknown route {}",
                    row.trip_id,
                    row.route_id
                );
                report.trips_with_unknown_route += 1;
                continue;
            }
            let shape_id = row
                .shape_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| ShapeID(ustr(id)));
            if let Some(shape_id) = shape_id {
                if !shapes.contains_key(&shape_id) {
                    report.trips_with_unknown_shape += 1;
                }
            }
            known_trips.insert(trip_id);
            trips_by_route.entry(route_id).or_default().push(trips.len());
            trips.push(Trip {
                id: trip_id,
                route_id,
                shape_id,
                headsign: row.trip_headsign.clone().unwrap_or_default(),
                direction: row.direction_id,
            });
        }

        let mut stop_times_by_trip: HashMap<TripID, Vec<StopTime>> = HashMap::new();
        for row in &feed.stop_times {
            let trip_id = TripID(ustr(&row.trip_id));
            if !known_trips.contains(&trip_id) {
                report.stop_times_with_unknown_trip += 1;
                continue;
            }
            let stop_id = StopID(ustr(&row.stop_id));
            if !stops.contains_key(&stop_id) {
                report.stop_times_with_unknown_stop += 1;
                continue;
            }
            // A stop with only one of the two times uses it for both.
            let (arrival, departure) = match (row.arrival_time, row.departure_time) {
                (Some(arrival), Some(departure)) => (arrival, departure),
                (Some(time), None) | (None, Some(time)) => (time, time),
                (None, None) => {
                    report.stop_times_without_time += 1;
                    continue;
                }
            };
            stop_times_by_trip.entry(trip_id).or_default().push(StopTime {
                stop_id,
                arrival,
                departure,
                sequence: row.stop_sequence,
            });
        }
        for stop_times in stop_times_by_trip.values_mut() {
            stop_times.sort_by_key(|stop_time| stop_time.sequence);
        }

        report.routes = routes.len();
        report.stops = stops.len();
        report.trips = trips.len();
        report.shapes = shapes.len();
        if report.stop_times_with_unknown_stop > 0 {
            log::warn!(
                "Dropped {} stop times referencing unknown stops",
                report.stop_times_with_unknown_stop
            );
        }
        if report.trips_with_unknown_route > 0 {
            log::warn!(
                "Dropped {} trips referencing unknown routes",
                report.trips_with_unknown_route
            );
        }

        Schedule {
            routes,
            route_index,
            stops,
            trips,
            trips_by_route,
            stop_times_by_trip,
            shapes,
            report,
        }
    }

    /// Routes in feed order; the position is the route's index in the container.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route_index(&self, id: RouteID) -> Option<usize> {
        self.route_index.get(&id).copied()
    }

    pub fn stop_coord(&self, id: StopID) -> Option<Coord<f64>> {
        self.stops.get(&id).copied()
    }

    pub fn trips(&self) -> &[Trip] {
        &self.trips
    }

    pub fn trips_for_route(&self, id: RouteID) -> impl Iterator<Item = &Trip> {
        self.trips_by_route
            .get(&id)
            .into_iter()
            .flatten()
            .map(|&i| &self.trips[i])
    }

    pub fn stop_times(&self, id: TripID) -> &[StopTime] {
        self.stop_times_by_trip
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn shape(&self, id: ShapeID) -> Option<&[ShapePoint]> {
        self.shapes.get(&id).map(Vec::as_slice)
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }
}

fn load_shapes(feed: &RawFeed, report: &mut LoadReport) -> HashMap<ShapeID, Vec<ShapePoint>> {
    let mut rows_per_shape: HashMap<ShapeID, Vec<(Coord<f64>, u32, Option<f64>)>> =
        HashMap::new();
    for row in &feed.shape_points {
        rows_per_shape
            .entry(ShapeID(ustr(&row.shape_id)))
            .or_default()
            .push((
                coord! {x: row.shape_pt_lon, y: row.shape_pt_lat},
                row.shape_pt_sequence,
                row.shape_dist_traveled,
            ));
    }

    let mut shapes = HashMap::new();
    for (shape_id, mut rows) in rows_per_shape {
        // Sort by shape_pt_sequence, in case the file isn't in order
        rows.sort_by_key(|(_, sequence, _)| *sequence);
        let distances = if rows.iter().all(|(_, _, dist)| dist.is_some()) {
            rows.iter().map(|(_, _, dist)| dist.unwrap_or_default()).collect()
        } else {
            report.shapes_with_backfilled_distance += 1;
            geometry::cumulative_distances(rows.iter().map(|(coord, _, _)| *coord))
        };
        let points = rows
            .into_iter()
            .zip(distances)
            .map(|((coord, sequence, _), dist_traveled)| ShapePoint {
                coord,
                sequence,
                dist_traveled,
            })
            .collect();
        shapes.insert(shape_id, points);
    }
    shapes
}

/// Parses `RRGGBB`, with or without a leading `#`.
pub fn parse_hex_color(value: &str) -> Option<[u8; 3]> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}
