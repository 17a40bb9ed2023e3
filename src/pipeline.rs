//! Load, interpolate, deduplicate and encode, in that order.

use anyhow::{Context, Result};
use indicatif::{ParallelProgressIterator, ProgressIterator};
use rayon::prelude::*;
use serde::Serialize;

use crate::container::{self, ContainerInput, EncodedContainer, EncodedTrip, StringTable};
use crate::dedup::ShapeTable;
use crate::feed_rkyv::RawFeed;
use crate::interpolate::{self, Elevation, InterpolationOptions, SampleStats, SkipReason, Waypoint};
use crate::schedule::{LoadReport, Schedule, Trip};

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub interpolation: InterpolationOptions,
    /// Interpolate trips on the rayon thread pool. The output is identical either way.
    pub parallel: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            interpolation: InterpolationOptions::default(),
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub load: LoadReport,
    pub trips_encoded: usize,
    pub skipped_no_geometry: usize,
    pub skipped_too_few_stops: usize,
    /// Trips left with fewer than two waypoints after filtering.
    pub skipped_degenerate: usize,
    pub samples: SampleStats,
    pub shapes: usize,
    pub headsigns: usize,
}

pub struct PipelineOutput {
    pub container: EncodedContainer,
    pub report: PipelineReport,
}

type TripResult = Result<(Vec<Waypoint>, SampleStats), SkipReason>;

pub fn run<E>(feed: &RawFeed, elevation: &E, options: &PipelineOptions) -> Result<PipelineOutput>
where
    E: Elevation + Sync + ?Sized,
{
    let style = indicatif::ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}",
    )?;

    let schedule = Schedule::load(feed);
    let load = schedule.report().clone();
    log::info!(
        "Loaded schedule: {} routes, {} stops, {} trips, {} shapes",
        load.routes,
        load.stops,
        load.trips,
        load.shapes
    );

    // Routes in feed order, then their trips in feed order.
    let trips: Vec<&Trip> = schedule
        .routes()
        .iter()
        .flat_map(|route| schedule.trips_for_route(route.id))
        .collect();

    let interpolate_one = |trip: &&Trip| -> TripResult {
        interpolate::interpolate_trip(&schedule, trip, &options.interpolation, elevation)
    };
    let results: Vec<TripResult> = if options.parallel {
        trips
            .par_iter()
            .progress_with_style(style.clone())
            .with_message("Interpolate trips.")
            .with_finish(indicatif::ProgressFinish::AndLeave)
            .map(interpolate_one)
            .collect()
    } else {
        trips
            .iter()
            .progress_with_style(style.clone())
            .with_message("Interpolate trips.")
            .with_finish(indicatif::ProgressFinish::AndLeave)
            .map(interpolate_one)
            .collect()
    };

    let mut report = PipelineReport {
        load,
        ..Default::default()
    };
    let mut shapes = ShapeTable::new();
    let mut headsigns = StringTable::new();
    let mut encoded_trips = vec![];
    for (trip, result) in trips.iter().zip(results) {
        let waypoints = match result {
            Ok((waypoints, stats)) => {
                report.samples.merge(&stats);
                waypoints
            }
            Err(SkipReason::NoGeometry) => {
                log::debug!(
                    "Skipping trip {} (direction {:?}) without geometry",
                    trip.id.0,
                    trip.direction
                );
                report.skipped_no_geometry += 1;
                continue;
            }
            Err(SkipReason::TooFewStops) => {
                log::debug!(
                    "Skipping trip {} (direction {:?}) with fewer than two matched stops",
                    trip.id.0,
                    trip.direction
                );
                report.skipped_too_few_stops += 1;
                continue;
            }
        };
        if waypoints.len() < 2 {
            log::debug!("Skipping trip {} with {} waypoints", trip.id.0, waypoints.len());
            report.skipped_degenerate += 1;
            continue;
        }

        let shape_index = shapes
            .intern(&waypoints)
            .context("Non-empty path has no fingerprint")?;
        let route_index = schedule
            .route_index(trip.route_id)
            .with_context(|| format!("Trip {} references a dropped route", trip.id.0))?;
        encoded_trips.push(EncodedTrip {
            shape_index,
            route_index,
            headsign_index: headsigns.intern(&trip.headsign),
            timestamps: waypoints.iter().map(|waypoint| waypoint.timestamp).collect(),
        });
    }
    report.trips_encoded = encoded_trips.len();
    report.shapes = shapes.len();
    report.headsigns = headsigns.len();

    if report.skipped_no_geometry + report.skipped_too_few_stops + report.skipped_degenerate > 0 {
        log::warn!(
            "Skipped trips: {} without geometry, {} with too few matched stops, {} degenerate",
            report.skipped_no_geometry,
            report.skipped_too_few_stops,
            report.skipped_degenerate
        );
    }
    log::info!(
        "Encoding {} trips using {} shared shapes",
        report.trips_encoded,
        report.shapes
    );

    let container = container::encode(&ContainerInput {
        shapes: &shapes,
        routes: schedule.routes(),
        headsigns: &headsigns,
        trips: &encoded_trips,
    })?;
    Ok(PipelineOutput { container, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_rkyv::*;
    use crate::interpolate::FlatElevation;

    /// Two routes sharing one shape; one trip without a shape.
    fn feed() -> RawFeed {
        let mut feed = RawFeed::default();
        for (route_id, route_type) in [("tram", 0), ("bus", 3)] {
            feed.routes.push(RouteRow {
                route_id: route_id.to_string(),
                route_type: Some(route_type),
                route_short_name: Some(route_id.to_uppercase()),
                ..Default::default()
            });
        }
        for i in 0..5 {
            feed.shape_points.push(ShapePointRow {
                shape_id: "line".to_string(),
                shape_pt_lat: 50.0 + i as f64 * 0.002,
                shape_pt_lon: 8.0,
                shape_pt_sequence: i,
                shape_dist_traveled: None,
            });
        }
        for (n, lat) in [50.0, 50.008].into_iter().enumerate() {
            feed.stops.push(StopRow {
                stop_id: format!("s{n}"),
                stop_lat: Some(lat),
                stop_lon: Some(8.0),
                ..Default::default()
            });
        }
        let trips = [
            ("bus-1", "bus", Some("line"), 30_000),
            ("tram-1", "tram", Some("line"), 40_000),
            ("tram-2", "tram", None, 41_000),
            ("tram-3", "tram", Some("line"), 97_200),
        ];
        for (trip_id, route_id, shape_id, start) in trips {
            feed.trips.push(TripRow {
                trip_id: trip_id.to_string(),
                route_id: route_id.to_string(),
                shape_id: shape_id.map(str::to_string),
                trip_headsign: Some("Nord".to_string()),
                ..Default::default()
            });
            for (n, time) in [start, start + 400].into_iter().enumerate() {
                feed.stop_times.push(StopTimeRow {
                    trip_id: trip_id.to_string(),
                    arrival_time: Some(time),
                    departure_time: Some(time),
                    stop_id: format!("s{n}"),
                    stop_sequence: n as u32,
                });
            }
        }
        feed
    }

    #[test]
    fn counts_skips_and_shares_shapes() {
        let output = run(
            &feed(),
            &FlatElevation(100.0),
            &PipelineOptions {
                parallel: false,
                ..Default::default()
            },
        )
        .unwrap();
        let report = &output.report;
        assert_eq!(report.load.trips, 4);
        assert_eq!(report.trips_encoded, 3);
        assert_eq!(report.skipped_no_geometry, 1);
        assert_eq!(report.shapes, 1);
        assert_eq!(report.headsigns, 1);

        let chunks = &output.container.layout.chunks;
        let trips_in = |hour: u32| chunks.iter().find(|c| c.hour == hour).unwrap().trips;
        assert_eq!(trips_in(8), 1);
        assert_eq!(trips_in(11), 1);
        assert_eq!(trips_in(27), 1);
    }

    #[test]
    fn parallel_output_is_identical() {
        let feed = feed();
        let sequential = run(
            &feed,
            &FlatElevation(0.0),
            &PipelineOptions {
                parallel: false,
                ..Default::default()
            },
        )
        .unwrap();
        let parallel = run(&feed, &FlatElevation(0.0), &PipelineOptions::default()).unwrap();
        assert_eq!(sequential.container.bytes, parallel.container.bytes);
    }

    #[test]
    fn fallback_encodes_trips_without_shapes() {
        let mut options = PipelineOptions::default();
        options.interpolation.stop_geometry_fallback = true;
        let output = run(&feed(), &FlatElevation(0.0), &options).unwrap();
        assert_eq!(output.report.trips_encoded, 4);
        assert_eq!(output.report.skipped_no_geometry, 0);
        // The two-stop path has a different point count from the five-point shape.
        assert_eq!(output.report.shapes, 2);
    }
}
