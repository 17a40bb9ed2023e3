//! Time-stamped paths for scheduled trips.
//!
//! Every stop of a trip is snapped to its nearest shape vertex, then each vertex between two
//! snapped stops gets a timestamp interpolated by the distance traveled along the shape.

use std::borrow::Cow;

use serde::Serialize;

use crate::geometry::{self, coordinate_key, round_coordinate};
use crate::schedule::{Schedule, ShapePoint, StopTime, Trip};

/// Exclusive upper bound for timestamps: 30 hours after the start of the service day.
pub const MAX_TIMESTAMP: u32 = 108_000;

/// Substituted whenever an elevation lookup fails.
pub const DEFAULT_ELEVATION: f64 = 0.0;

/// Ground elevation lookup in meters.
///
/// Implementations may fetch or cache tiles; the interpolator never propagates their errors
/// and uses [`DEFAULT_ELEVATION`] instead.
pub trait Elevation {
    fn elevation(&self, longitude: f64, latitude: f64) -> anyhow::Result<f64>;
}

/// Constant elevation, used when elevation sampling is disabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatElevation(pub f64);

impl Elevation for FlatElevation {
    fn elevation(&self, _longitude: f64, _latitude: f64) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

impl<F> Elevation for F
where
    F: Fn(f64, f64) -> anyhow::Result<f64>,
{
    fn elevation(&self, longitude: f64, latitude: f64) -> anyhow::Result<f64> {
        self(longitude, latitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: f64,
    /// Seconds since the start of the service day, below [`MAX_TIMESTAMP`].
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InterpolationOptions {
    /// Connect the stops of a trip directly when it has no usable shape.
    pub stop_geometry_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No shape, or a shape id that is not in the shape table.
    NoGeometry,
    /// Fewer than two stops could be matched to the path.
    TooFewStops,
}

/// What happened to individual samples while walking a trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleStats {
    /// Timestamp outside `[0, MAX_TIMESTAMP)`.
    pub out_of_window: usize,
    /// Timestamp earlier than an already emitted one.
    pub time_regressions: usize,
    /// Same timestamp and rounded coordinate as the previous sample.
    pub duplicates: usize,
    /// Stop pairs skipped because they do not advance along the path or go back in time.
    pub degenerate_segments: usize,
    pub elevation_failures: usize,
}

impl SampleStats {
    pub fn merge(&mut self, other: &SampleStats) {
        self.out_of_window += other.out_of_window;
        self.time_regressions += other.time_regressions;
        self.duplicates += other.duplicates;
        self.degenerate_segments += other.degenerate_segments;
        self.elevation_failures += other.elevation_failures;
    }
}

/// A stop snapped to a path vertex.
#[derive(Debug, Clone, Copy)]
pub struct StopMatch {
    pub shape_index: usize,
    pub dist_traveled: f64,
    /// Distance between the stop and the vertex it snapped to, in meters.
    pub offset_meters: f64,
    pub arrival: u32,
    pub departure: u32,
}

/// A trip whose stops have been matched to its path, ready to be walked.
#[derive(Debug, Clone)]
pub struct TripPlan<'a> {
    path: Cow<'a, [ShapePoint]>,
    matches: Vec<StopMatch>,
}

pub fn plan_trip<'a>(
    schedule: &'a Schedule,
    trip: &Trip,
    options: &InterpolationOptions,
) -> Result<TripPlan<'a>, SkipReason> {
    let stop_times = schedule.stop_times(trip.id);
    let path = match trip.shape_id.and_then(|id| schedule.shape(id)) {
        Some(points) if !points.is_empty() => Cow::Borrowed(points),
        _ if options.stop_geometry_fallback => Cow::Owned(stop_path(schedule, stop_times)),
        _ => return Err(SkipReason::NoGeometry),
    };

    let mut matches = vec![];
    for stop_time in stop_times {
        let Some(stop) = schedule.stop_coord(stop_time.stop_id) else {
            continue;
        };
        let Some((shape_index, offset_meters)) =
            geometry::nearest_index(path.iter().map(|point| point.coord), stop)
        else {
            continue;
        };
        matches.push(StopMatch {
            shape_index,
            dist_traveled: path[shape_index].dist_traveled,
            offset_meters,
            arrival: stop_time.arrival,
            departure: stop_time.departure,
        });
    }
    // Guards against stop sequences running against the shape direction.
    matches.sort_by_key(|stop_match| stop_match.shape_index);

    if matches.len() < 2 {
        return Err(SkipReason::TooFewStops);
    }
    Ok(TripPlan { path, matches })
}

pub fn interpolate_trip<E: Elevation + ?Sized>(
    schedule: &Schedule,
    trip: &Trip,
    options: &InterpolationOptions,
    elevation: &E,
) -> Result<(Vec<Waypoint>, SampleStats), SkipReason> {
    let plan = plan_trip(schedule, trip, options)?;
    let mut waypoints = plan.waypoints(elevation);
    let collected: Vec<Waypoint> = waypoints.by_ref().collect();
    Ok((collected, waypoints.stats()))
}

/// Path made of the trip's own stops, for feeds without shapes.
fn stop_path(schedule: &Schedule, stop_times: &[StopTime]) -> Vec<ShapePoint> {
    let stops: Vec<(geo::Coord<f64>, u32)> = stop_times
        .iter()
        .filter_map(|stop_time| {
            schedule
                .stop_coord(stop_time.stop_id)
                .map(|coord| (coord, stop_time.sequence))
        })
        .collect();
    let distances = geometry::cumulative_distances(stops.iter().map(|(coord, _)| *coord));
    stops
        .into_iter()
        .zip(distances)
        .map(|((coord, sequence), dist_traveled)| ShapePoint {
            coord,
            sequence,
            dist_traveled,
        })
        .collect()
}

impl<'a> TripPlan<'a> {
    pub fn matches(&self) -> &[StopMatch] {
        &self.matches
    }

    pub fn path(&self) -> &[ShapePoint] {
        &self.path
    }

    pub fn waypoints<'e, E: Elevation + ?Sized>(self, elevation: &'e E) -> Waypoints<'a, 'e, E> {
        Waypoints {
            path: self.path,
            matches: self.matches,
            elevation,
            next_pair: 0,
            segment: None,
            last_timestamp: None,
            last_key: None,
            stats: SampleStats::default(),
        }
    }
}

/// How far along a segment a vertex is.
#[derive(Debug)]
enum Progress {
    /// By the shape's cumulative distance.
    Distance { origin: f64, length: f64 },
    /// By great-circle lengths summed over the segment, when the cumulative distance does not grow.
    Summed { offsets: Vec<f64>, length: f64 },
    /// By vertex position, when the segment has no length at all.
    Index,
}

#[derive(Debug)]
struct Segment {
    start: usize,
    end: usize,
    departure: u32,
    arrival: u32,
    progress: Progress,
    cursor: usize,
}

impl Segment {
    fn new(path: &[ShapePoint], from: &StopMatch, to: &StopMatch) -> Option<Self> {
        if from.shape_index >= to.shape_index || to.arrival < from.departure {
            return None;
        }
        let (start, end) = (from.shape_index, to.shape_index);
        let origin = path[start].dist_traveled;
        let length = path[end].dist_traveled - origin;
        let progress = if length > 0.0 {
            Progress::Distance { origin, length }
        } else {
            let offsets =
                geometry::cumulative_distances(path[start..=end].iter().map(|point| point.coord));
            match offsets.last().copied() {
                Some(length) if length > 0.0 => Progress::Summed { offsets, length },
                _ => Progress::Index,
            }
        };
        Some(Segment {
            start,
            end,
            departure: from.departure,
            arrival: to.arrival,
            progress,
            cursor: start,
        })
    }

    fn fraction(&self, path: &[ShapePoint], index: usize) -> f64 {
        match &self.progress {
            Progress::Distance { origin, length } => (path[index].dist_traveled - origin) / length,
            Progress::Summed { offsets, length } => offsets[index - self.start] / length,
            Progress::Index => (index - self.start) as f64 / (self.end - self.start) as f64,
        }
    }

    /// The next vertex of the segment and its raw, not yet validated, timestamp.
    fn next_sample(&mut self, path: &[ShapePoint]) -> Option<(usize, i64)> {
        if self.cursor > self.end {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;

        let timestamp = if index == self.start {
            i64::from(self.departure)
        } else if index == self.end {
            i64::from(self.arrival)
        } else {
            let span = f64::from(self.arrival) - f64::from(self.departure);
            // Truncated to whole seconds.
            (f64::from(self.departure) + span * self.fraction(path, index)) as i64
        };
        Some((index, timestamp))
    }
}

/// The waypoints of one trip, produced lazily and in order.
///
/// Consuming the iterator is the only way to read them; it cannot be rewound or cloned.
/// Samples outside the valid time window, samples going back in time and consecutive
/// duplicates are dropped along the way and counted in [`Waypoints::stats`].
pub struct Waypoints<'a, 'e, E: ?Sized> {
    path: Cow<'a, [ShapePoint]>,
    matches: Vec<StopMatch>,
    elevation: &'e E,
    next_pair: usize,
    segment: Option<Segment>,
    last_timestamp: Option<u32>,
    last_key: Option<(u32, i64, i64)>,
    stats: SampleStats,
}

impl<E: Elevation + ?Sized> Waypoints<'_, '_, E> {
    pub fn stats(&self) -> SampleStats {
        self.stats
    }

    /// Moves to the next usable pair of matched stops. Returns false once all are used.
    fn advance_segment(&mut self) -> bool {
        self.segment = None;
        while self.next_pair + 1 < self.matches.len() {
            let from = &self.matches[self.next_pair];
            let to = &self.matches[self.next_pair + 1];
            self.next_pair += 1;
            match Segment::new(&self.path, from, to) {
                Some(segment) => {
                    self.segment = Some(segment);
                    return true;
                }
                None => self.stats.degenerate_segments += 1,
            }
        }
        false
    }
}

impl<E: Elevation + ?Sized> Iterator for Waypoints<'_, '_, E> {
    type Item = Waypoint;

    fn next(&mut self) -> Option<Waypoint> {
        loop {
            let sample = self
                .segment
                .as_mut()
                .and_then(|segment| segment.next_sample(&self.path));
            let Some((index, raw_timestamp)) = sample else {
                if !self.advance_segment() {
                    return None;
                }
                continue;
            };

            let timestamp = match u32::try_from(raw_timestamp) {
                Ok(timestamp) if timestamp < MAX_TIMESTAMP => timestamp,
                _ => {
                    self.stats.out_of_window += 1;
                    continue;
                }
            };
            if self.last_timestamp.is_some_and(|last| timestamp < last) {
                self.stats.time_regressions += 1;
                continue;
            }

            let coord = self.path[index].coord;
            let key = (timestamp, coordinate_key(coord.x), coordinate_key(coord.y));
            if self.last_key == Some(key) {
                self.stats.duplicates += 1;
                continue;
            }
            self.last_key = Some(key);
            self.last_timestamp = Some(timestamp);

            let longitude = round_coordinate(coord.x);
            let latitude = round_coordinate(coord.y);
            let elevation = match self.elevation.elevation(longitude, latitude) {
                Ok(meters) => meters,
                Err(err) => {
                    log::debug!("Elevation lookup at {longitude},{latitude} failed: {err:#}");
                    self.stats.elevation_failures += 1;
                    DEFAULT_ELEVATION
                }
            };
            return Some(Waypoint {
                longitude,
                latitude,
                elevation,
                timestamp,
            });
        }
    }
}

impl<E: Elevation + ?Sized> std::iter::FusedIterator for Waypoints<'_, '_, E> {}
