//! Human-readable mirror of a container's layout. The binary is authoritative.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::format::FORMAT_VERSION;
use super::{ChunkLayout, Layout, Section};

#[derive(Debug, Clone, Serialize)]
pub struct Manifest<R> {
    pub generated_at: DateTime<Utc>,
    pub format_version: u32,
    pub total_size: usize,
    pub shared_prefix_size: usize,
    pub shape_count: usize,
    pub route_count: usize,
    pub headsign_count: usize,
    pub header: Section,
    pub shape_table: Section,
    pub route_table: Section,
    pub headsign_table: Section,
    pub chunk_index: Section,
    pub chunks: Vec<ChunkLayout>,
    pub report: R,
}

impl<R: Serialize> Manifest<R> {
    pub fn new(layout: &Layout, report: R, generated_at: DateTime<Utc>) -> Self {
        Manifest {
            generated_at,
            format_version: FORMAT_VERSION,
            total_size: layout.total_size,
            shared_prefix_size: layout.shared_prefix_size(),
            shape_count: layout.shape_count,
            route_count: layout.route_count,
            headsign_count: layout.headsign_count,
            header: layout.header,
            shape_table: layout.shape_table,
            route_table: layout.route_table,
            headsign_table: layout.headsign_table,
            chunk_index: layout.chunk_index,
            chunks: layout.chunks.clone(),
            report,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mirrors_the_layout() {
        let section = |offset, size| Section { offset, size };
        let layout = Layout {
            shape_count: 1,
            route_count: 1,
            headsign_count: 1,
            header: section(0, 32),
            shape_table: section(32, 28),
            route_table: section(60, 16),
            headsign_table: section(76, 9),
            chunk_index: section(85, 288),
            chunks: vec![ChunkLayout {
                hour: 8,
                offset: 373,
                size: 36,
                trips: 1,
            }],
            total_size: 409,
        };
        let generated_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let manifest = Manifest::new(&layout, serde_json::json!({ "trips_encoded": 1 }), generated_at);
        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();

        assert_eq!(value["generated_at"], "2024-05-01T12:00:00Z");
        assert_eq!(value["format_version"], FORMAT_VERSION);
        assert_eq!(value["shared_prefix_size"], 373);
        assert_eq!(value["chunks"][0]["hour"], 8);
        assert_eq!(value["chunks"][0]["trips"], 1);
        assert_eq!(value["report"]["trips_encoded"], 1);
    }
}
