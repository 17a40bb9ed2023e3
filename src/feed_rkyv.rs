//! Raw schedule rows, one struct per tabular file.
//!
//! These carry the feed columns with as little interpretation as possible.
//! Typing, validation and indexing happen in [`crate::schedule`].

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct RawFeed {
    pub routes: Vec<RouteRow>,
    pub stops: Vec<StopRow>,
    pub trips: Vec<TripRow>,
    pub stop_times: Vec<StopTimeRow>,
    pub shape_points: Vec<ShapePointRow>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct RouteRow {
    pub route_id: String,
    /// Numeric GTFS route type, basic (0-7) or extended (100-1700).
    pub route_type: Option<i16>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    /// Hex color without the leading `#`, e.g. `"FFCC00"`.
    pub route_color: Option<String>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct StopRow {
    pub stop_id: String,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct TripRow {
    pub trip_id: String,
    pub route_id: String,
    pub shape_id: Option<String>,
    /// 0 or 1 as in the feed.
    pub direction_id: Option<u8>,
    pub trip_headsign: Option<String>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct StopTimeRow {
    pub trip_id: String,
    /// Seconds since midnight; may exceed 86400 for trips running past midnight.
    pub arrival_time: Option<u32>,
    pub departure_time: Option<u32>,
    pub stop_id: String,
    pub stop_sequence: u32,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ShapePointRow {
    pub shape_id: String,
    pub shape_pt_lat: f64,
    pub shape_pt_lon: f64,
    pub shape_pt_sequence: u32,
    pub shape_dist_traveled: Option<f64>,
}

/// Parses a feed time of the form `H:MM:SS` or `HH:MM:SS` into seconds since midnight.
///
/// Hours are not capped at 24.
pub fn parse_feed_time(value: &str) -> Option<u32> {
    let mut parts = value.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    hours.checked_mul(3600)?.checked_add(minutes * 60 + seconds)
}
