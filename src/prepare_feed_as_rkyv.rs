use std::path::{Path, PathBuf};

use crate::feed_rkyv::*;
use anyhow::{Context, Result};

const RKYV_FILE_NAME: &str = "feed_rkyv.bin";

/// Loads the raw rows of the GTFS feed in `feed_folder_path`.
///
/// With `use_cache`, the rows come from an rkyv archive next to the feed, which is
/// created on first use.
pub async fn load_feed_folder(feed_folder_path: &Path, use_cache: bool) -> Result<RawFeed> {
    if !use_cache {
        return raw_feed_from_gtfs(feed_folder_path);
    }
    let rkyv_path = ensure_feed_folder_rkyv(feed_folder_path).await?;
    let bytes = tokio::fs::read(&rkyv_path).await?;
    // Archived data must be aligned, a plain Vec<u8> is not.
    let mut buffer = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    buffer.extend_from_slice(&bytes);
    let feed = rkyv::from_bytes::<RawFeed, rkyv::rancor::Error>(&buffer)
        .with_context(|| format!("Corrupt feed cache at {:?}, delete it to rebuild", rkyv_path))?;
    log::info!(
        "Loaded cached feed: {} routes, {} stops, {} trips, {} stop times, {} shape points",
        feed.routes.len(),
        feed.stops.len(),
        feed.trips.len(),
        feed.stop_times.len(),
        feed.shape_points.len()
    );
    Ok(feed)
}

pub async fn ensure_feed_folder_rkyv(feed_folder_path: &Path) -> Result<PathBuf> {
    let output_path = feed_folder_path.join(RKYV_FILE_NAME);
    if !output_path.exists() {
        write_feed_folder_rkyv(feed_folder_path).await?;
    }
    Ok(output_path)
}

/// Parses the feed and (re)writes its rkyv cache unconditionally.
pub async fn write_feed_folder_rkyv(feed_folder_path: &Path) -> Result<PathBuf> {
    let output_path = feed_folder_path.join(RKYV_FILE_NAME);
    let feed = raw_feed_from_gtfs(feed_folder_path)?;
    log::info!("Serializing data.");
    let buffer = rkyv::to_bytes::<rkyv::rancor::Error>(&feed)?;
    log::info!("Writing data to {:?}", output_path);
    tokio::fs::write(&output_path, &buffer).await?;
    Ok(output_path)
}

fn raw_feed_from_gtfs(feed_folder_path: &Path) -> Result<RawFeed> {
    log::info!("Loading original GTFS data from {:?}", feed_folder_path);
    let gtfs = gtfs_structures::RawGtfs::from_path(feed_folder_path)?;

    log::info!("Preparing routes.");
    let mut routes = vec![];
    for route in gtfs.routes? {
        routes.push(RouteRow {
            route_id: route.id.clone(),
            route_type: Some(route_type_code(route.route_type)),
            route_short_name: route.short_name.clone(),
            route_long_name: route.long_name.clone(),
            route_color: route_color_hex(route.color.r, route.color.g, route.color.b),
        });
    }

    log::info!("Preparing stops...");
    let mut stops = vec![];
    for stop in gtfs.stops? {
        stops.push(StopRow {
            stop_id: stop.id.clone(),
            stop_lat: stop.latitude,
            stop_lon: stop.longitude,
        });
    }

    log::info!("Preparing trips.");
    let mut trips = vec![];
    for trip in gtfs.trips? {
        trips.push(TripRow {
            trip_id: trip.id.clone(),
            route_id: trip.route_id.clone(),
            shape_id: trip.shape_id.clone(),
            direction_id: trip.direction_id.map(|direction| match direction {
                gtfs_structures::DirectionType::Outbound => 0,
                gtfs_structures::DirectionType::Inbound => 1,
            }),
            trip_headsign: trip.trip_headsign.clone(),
        });
    }

    log::info!("Preparing stop times.");
    let mut stop_times = vec![];
    for stop_time in gtfs.stop_times? {
        stop_times.push(StopTimeRow {
            trip_id: stop_time.trip_id.clone(),
            arrival_time: stop_time.arrival_time,
            departure_time: stop_time.departure_time,
            stop_id: stop_time.stop_id.clone(),
            stop_sequence: u32::from(stop_time.stop_sequence),
        });
    }

    log::info!("Preparing shapes.");
    let mut shape_points = vec![];
    match gtfs.shapes {
        Some(shapes) => {
            for point in shapes? {
                shape_points.push(ShapePointRow {
                    shape_id: point.id.clone(),
                    shape_pt_lat: point.latitude,
                    shape_pt_lon: point.longitude,
                    shape_pt_sequence: u32::try_from(point.sequence)?,
                    shape_dist_traveled: point.dist_traveled.map(f64::from),
                });
            }
        }
        None => log::warn!("Feed has no shapes.txt, only stop geometry is available."),
    }

    Ok(RawFeed {
        routes,
        stops,
        trips,
        stop_times,
        shape_points,
    })
}

/// gtfs-structures fills a missing `route_color` with white, which is treated as unset.
fn route_color_hex(r: u8, g: u8, b: u8) -> Option<String> {
    if (r, g, b) == (0xFF, 0xFF, 0xFF) {
        return None;
    }
    Some(format!("{r:02X}{g:02X}{b:02X}"))
}

fn route_type_code(route_type: gtfs_structures::RouteType) -> i16 {
    match route_type {
        gtfs_structures::RouteType::Tramway => 0,
        gtfs_structures::RouteType::Subway => 1,
        gtfs_structures::RouteType::Rail => 2,
        gtfs_structures::RouteType::Bus => 3,
        gtfs_structures::RouteType::Ferry => 4,
        gtfs_structures::RouteType::CableCar => 5,
        gtfs_structures::RouteType::Gondola => 6,
        gtfs_structures::RouteType::Funicular => 7,
        gtfs_structures::RouteType::Coach => 200,
        gtfs_structures::RouteType::Air => 1100,
        gtfs_structures::RouteType::Taxi => 1500,
        gtfs_structures::RouteType::Other(other) => other,
    }
}
