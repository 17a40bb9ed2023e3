//! The binary playback container.
//!
//! Shared tables (shapes, routes, headsigns, chunk index) come first so a client can fetch
//! them with one range request, followed by one chunk of trips per hour bucket that can be
//! fetched on its own. See [`format`] for the exact layout.

pub mod decode;
pub mod format;
pub mod manifest;

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use zerocopy::{IntoBytes, U16, U32};

use crate::dedup::ShapeTable;
use crate::schedule::Route;
use format::*;

#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    #[error("Not a playback container (magic {0:?}).")]
    BadMagic([u8; 4]),
    #[error("Unsupported container version {0}; expected {FORMAT_VERSION}.")]
    UnsupportedVersion(u32),
    #[error("Unexpected end of data: needed {needed} bytes at offset {offset}.")]
    Truncated { offset: usize, needed: usize },
    #[error("String at blob offset {offset} is not NUL-terminated.")]
    UnterminatedString { offset: usize },
    #[error("String is not valid UTF-8.")]
    InvalidString(#[from] std::str::Utf8Error),
    #[error("Value {value} does not fit the {field} field.")]
    FieldOverflow { field: &'static str, value: usize },
    #[error("Index {index} is out of range for the {table} table ({len} entries).")]
    InvalidIndex {
        table: &'static str,
        index: usize,
        len: usize,
    },
    #[error("Trip has {timestamps} timestamps but its shape has {vertices} points.")]
    TimestampCountMismatch { timestamps: usize, vertices: usize },
    #[error("Hour bucket {0} is outside the supported range.")]
    InvalidHour(u32),
    #[error("Layout mismatch in {section}: expected offset {expected}, found {actual}.")]
    LayoutMismatch {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Hour bucket of a trip starting at `start_time`, clamped into `[MIN_HOUR, MAX_HOUR]`.
///
/// Hours past midnight keep counting up: a trip starting at 27:00:00 lands in bucket 27.
pub fn hour_bucket(start_time: u32) -> u32 {
    (start_time / 3600).clamp(MIN_HOUR, MAX_HOUR)
}

/// Deduplicated strings in insertion order.
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &str) -> usize {
        if let Some(&index) = self.index.get(value) {
            return index;
        }
        self.strings.push(value.to_string());
        self.index.insert(value.to_string(), self.strings.len() - 1);
        self.strings.len() - 1
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTrip {
    pub shape_index: usize,
    pub route_index: usize,
    pub headsign_index: usize,
    /// Absolute timestamps, one per shape point.
    pub timestamps: Vec<u32>,
}

impl EncodedTrip {
    pub fn start_time(&self) -> u32 {
        self.timestamps.first().copied().unwrap_or_default()
    }
}

pub struct ContainerInput<'a> {
    pub shapes: &'a ShapeTable,
    pub routes: &'a [Route],
    pub headsigns: &'a StringTable,
    pub trips: &'a [EncodedTrip],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section {
    pub offset: usize,
    pub size: usize,
}

impl Section {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkLayout {
    pub hour: u32,
    pub offset: usize,
    pub size: usize,
    pub trips: usize,
}

/// Where everything ended up in an encoded container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub shape_count: usize,
    pub route_count: usize,
    pub headsign_count: usize,
    pub header: Section,
    pub shape_table: Section,
    pub route_table: Section,
    pub headsign_table: Section,
    pub chunk_index: Section,
    pub chunks: Vec<ChunkLayout>,
    pub total_size: usize,
}

impl Layout {
    /// Bytes a client fetches once before requesting individual chunks.
    pub fn shared_prefix_size(&self) -> usize {
        self.chunk_index.end()
    }
}

pub struct EncodedContainer {
    pub bytes: Vec<u8>,
    pub layout: Layout,
}

/// Serializes the container in a single forward pass.
///
/// Any failure here means the inputs broke an invariant the earlier stages guarantee,
/// so the whole encode is abandoned rather than producing a partial file.
pub fn encode(input: &ContainerInput<'_>) -> Result<EncodedContainer, ContainerError> {
    let mut out: Vec<u8> = vec![0; HEADER_SIZE];
    let header = Section {
        offset: 0,
        size: HEADER_SIZE,
    };

    let shape_table_offset = out.len();
    for entry in input.shapes.entries() {
        let vertices: Vec<[f32; 3]> = entry
            .vertices
            .iter()
            .map(|vertex| {
                [
                    vertex.longitude as f32,
                    vertex.latitude as f32,
                    vertex.elevation as f32,
                ]
            })
            .collect();
        write_shape_entry(&mut out, &vertices)?;
    }
    let shape_table = section_since(shape_table_offset, &out);

    let route_table_offset = out.len();
    let (name_offsets, names) = string_blob(input.routes.iter().map(Route::display_name))?;
    for (route, name_offset) in input.routes.iter().zip(name_offsets) {
        let record = RouteRecord {
            name_offset: U32::new(name_offset),
            mode: route.mode.as_byte(),
            color: route.color,
        };
        out.extend_from_slice(record.as_bytes());
    }
    out.extend_from_slice(&to_u32("route string blob length", names.len())?.to_le_bytes());
    out.extend_from_slice(&names);
    let route_table = section_since(route_table_offset, &out);

    let headsign_table_offset = out.len();
    let (headsign_offsets, headsigns) = string_blob(input.headsigns.iter())?;
    for offset in headsign_offsets {
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend_from_slice(&to_u32("headsign string blob length", headsigns.len())?.to_le_bytes());
    out.extend_from_slice(&headsigns);
    let headsign_table = section_since(headsign_table_offset, &out);

    let payloads = chunk_payloads(input)?;

    let chunk_index_offset = out.len();
    let mut chunk_offset = chunk_index_offset + CHUNK_COUNT * CHUNK_INDEX_ENTRY_SIZE;
    let mut chunks = vec![];
    for (hour, payload, trips) in &payloads {
        let entry = ChunkIndexEntry {
            hour: U32::new(*hour),
            offset: U32::new(to_u32("chunk offset", chunk_offset)?),
            length: U32::new(to_u32("chunk length", payload.len())?),
        };
        out.extend_from_slice(entry.as_bytes());
        chunks.push(ChunkLayout {
            hour: *hour,
            offset: chunk_offset,
            size: payload.len(),
            trips: *trips,
        });
        chunk_offset += payload.len();
    }
    let chunk_index = section_since(chunk_index_offset, &out);

    for ((_, payload, _), chunk) in payloads.iter().zip(&chunks) {
        if out.len() != chunk.offset {
            return Err(ContainerError::LayoutMismatch {
                section: "chunk payload",
                expected: chunk.offset,
                actual: out.len(),
            });
        }
        out.extend_from_slice(payload);
    }
    if out.len() != chunk_offset {
        return Err(ContainerError::LayoutMismatch {
            section: "end of file",
            expected: chunk_offset,
            actual: out.len(),
        });
    }

    let file_header = FileHeader {
        magic: MAGIC,
        version: U32::new(FORMAT_VERSION),
        shape_count: U32::new(to_u32("shape count", input.shapes.len())?),
        route_count: U32::new(to_u32("route count", input.routes.len())?),
        headsign_count: U32::new(to_u32("headsign count", input.headsigns.len())?),
        chunk_count: U32::new(to_u32("chunk count", chunks.len())?),
        shape_table_offset: U32::new(to_u32("shape table offset", shape_table.offset)?),
        route_table_offset: U32::new(to_u32("route table offset", route_table.offset)?),
    };
    out[..HEADER_SIZE].copy_from_slice(file_header.as_bytes());

    let layout = Layout {
        shape_count: input.shapes.len(),
        route_count: input.routes.len(),
        headsign_count: input.headsigns.len(),
        header,
        shape_table,
        route_table,
        headsign_table,
        chunk_index,
        chunks,
        total_size: out.len(),
    };
    Ok(EncodedContainer { bytes: out, layout })
}

fn section_since(offset: usize, out: &[u8]) -> Section {
    Section {
        offset,
        size: out.len() - offset,
    }
}

/// One payload per hour bucket, in hour order, with its trip count. Empty buckets get an
/// empty payload.
fn chunk_payloads(input: &ContainerInput<'_>) -> Result<Vec<(u32, Vec<u8>, usize)>, ContainerError> {
    let mut buckets: Vec<Vec<&EncodedTrip>> = vec![vec![]; CHUNK_COUNT];
    for trip in input.trips {
        let hour = hour_bucket(trip.start_time());
        buckets[(hour - MIN_HOUR) as usize].push(trip);
    }

    let mut payloads = vec![];
    for (hour, trips) in (MIN_HOUR..=MAX_HOUR).zip(buckets) {
        let mut payload = vec![];
        if !trips.is_empty() {
            payload.extend_from_slice(&to_u32("chunk trip count", trips.len())?.to_le_bytes());
            for trip in &trips {
                write_trip(&mut payload, input, trip)?;
            }
        }
        payloads.push((hour, payload, trips.len()));
    }
    Ok(payloads)
}

fn write_trip(
    payload: &mut Vec<u8>,
    input: &ContainerInput<'_>,
    trip: &EncodedTrip,
) -> Result<(), ContainerError> {
    let shape = input
        .shapes
        .get(trip.shape_index)
        .ok_or(ContainerError::InvalidIndex {
            table: "shape",
            index: trip.shape_index,
            len: input.shapes.len(),
        })?;
    if trip.route_index >= input.routes.len() {
        return Err(ContainerError::InvalidIndex {
            table: "route",
            index: trip.route_index,
            len: input.routes.len(),
        });
    }
    if trip.headsign_index >= input.headsigns.len() {
        return Err(ContainerError::InvalidIndex {
            table: "headsign",
            index: trip.headsign_index,
            len: input.headsigns.len(),
        });
    }
    if trip.timestamps.len() != shape.vertices.len() {
        return Err(ContainerError::TimestampCountMismatch {
            timestamps: trip.timestamps.len(),
            vertices: shape.vertices.len(),
        });
    }

    let record = TripRecord {
        shape_index: U32::new(to_u32("shape index", trip.shape_index)?),
        route_index: U16::new(to_u16("route index", trip.route_index)?),
        headsign_index: U16::new(to_u16("headsign index", trip.headsign_index)?),
        timestamp_count: U32::new(to_u32("timestamp count", trip.timestamps.len())?),
        start_time: U32::new(trip.start_time()),
        reserved: U32::new(0),
    };
    payload.extend_from_slice(record.as_bytes());
    for timestamp in &trip.timestamps {
        payload.extend_from_slice(&timestamp.to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolate::Waypoint;
    use crate::schedule::{RouteID, TransitMode};
    use ustr::ustr;

    fn path(start: u32, points: usize, lon: f64) -> Vec<Waypoint> {
        (0..points)
            .map(|i| Waypoint {
                longitude: lon,
                latitude: 52.0 + i as f64 * 0.01,
                elevation: 30.0,
                timestamp: start + i as u32 * 60,
            })
            .collect()
    }

    fn routes() -> Vec<Route> {
        vec![Route {
            id: RouteID(ustr("r1")),
            mode: TransitMode::Tram,
            short_name: Some("M10".to_string()),
            long_name: None,
            color: [0xD7, 0x26, 0x1E],
        }]
    }

    fn encode_paths(paths: &[Vec<Waypoint>]) -> EncodedContainer {
        let mut shapes = ShapeTable::new();
        let mut headsigns = StringTable::new();
        let headsign_index = headsigns.intern("Hauptbahnhof");
        let trips: Vec<EncodedTrip> = paths
            .iter()
            .map(|path| EncodedTrip {
                shape_index: shapes.intern(path).unwrap(),
                route_index: 0,
                headsign_index,
                timestamps: path.iter().map(|w| w.timestamp).collect(),
            })
            .collect();
        let routes = routes();
        encode(&ContainerInput {
            shapes: &shapes,
            routes: &routes,
            headsigns: &headsigns,
            trips: &trips,
        })
        .unwrap()
    }

    #[test]
    fn hour_buckets_do_not_wrap() {
        assert_eq!(hour_bucket(97_200), 27);
        assert_eq!(hour_bucket(0), MIN_HOUR);
        assert_eq!(hour_bucket(28_800), 8);
        assert_eq!(hour_bucket(107_999), MAX_HOUR);
    }

    #[test]
    fn string_table_deduplicates() {
        let mut table = StringTable::new();
        assert_eq!(table.intern("a"), 0);
        assert_eq!(table.intern("b"), 1);
        assert_eq!(table.intern("a"), 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.iter().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn layout_is_contiguous() {
        let encoded = encode_paths(&[path(28_800, 3, 13.0), path(97_200, 2, 13.5)]);
        let layout = &encoded.layout;
        assert_eq!(layout.shape_table.offset, HEADER_SIZE);
        assert_eq!(layout.route_table.offset, layout.shape_table.end());
        assert_eq!(layout.headsign_table.offset, layout.route_table.end());
        assert_eq!(layout.chunk_index.offset, layout.headsign_table.end());
        assert_eq!(
            layout.chunk_index.size,
            CHUNK_COUNT * CHUNK_INDEX_ENTRY_SIZE
        );
        // Two shapes: (4 + 3 * 12) + (4 + 2 * 12).
        assert_eq!(layout.shape_table.size, 68);
        // One record, blob length, "M10\0".
        assert_eq!(layout.route_table.size, 8 + 4 + 4);

        let mut expected_offset = layout.shared_prefix_size();
        for chunk in &layout.chunks {
            assert!((MIN_HOUR..=MAX_HOUR).contains(&chunk.hour));
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.size;
        }
        assert_eq!(expected_offset, encoded.bytes.len());
        assert_eq!(layout.total_size, encoded.bytes.len());
    }

    #[test]
    fn chunk_sizes_match_their_trips() {
        let encoded = encode_paths(&[path(28_800, 3, 13.0), path(29_000, 4, 13.1)]);
        let chunk = &encoded.layout.chunks[(8 - MIN_HOUR) as usize];
        assert_eq!(chunk.hour, 8);
        assert_eq!(chunk.trips, 2);
        assert_eq!(chunk.size, 4 + (TRIP_RECORD_SIZE + 3 * 4) + (TRIP_RECORD_SIZE + 4 * 4));
        let empty = &encoded.layout.chunks[0];
        assert_eq!((empty.size, empty.trips), (0, 0));
    }

    #[test]
    fn header_fields() {
        let encoded = encode_paths(&[path(28_800, 3, 13.0)]);
        let bytes = &encoded.bytes;
        assert_eq!(&bytes[0..4], b"TPLB");
        let read = |offset: usize| {
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
        };
        assert_eq!(read(4), FORMAT_VERSION);
        assert_eq!(read(8), 1);
        assert_eq!(read(12), 1);
        assert_eq!(read(16), 1);
        assert_eq!(read(20), CHUNK_COUNT as u32);
        assert_eq!(read(24), HEADER_SIZE as u32);
        assert_eq!(read(28) as usize, encoded.layout.route_table.offset);
    }

    #[test]
    fn mismatched_timestamps_abort_the_encode() {
        let mut shapes = ShapeTable::new();
        let headsigns = {
            let mut table = StringTable::new();
            table.intern("");
            table
        };
        let shape_index = shapes.intern(&path(28_800, 3, 13.0)).unwrap();
        let trips = [EncodedTrip {
            shape_index,
            route_index: 0,
            headsign_index: 0,
            timestamps: vec![28_800, 28_900],
        }];
        let routes = routes();
        let result = encode(&ContainerInput {
            shapes: &shapes,
            routes: &routes,
            headsigns: &headsigns,
            trips: &trips,
        });
        assert!(matches!(
            result,
            Err(ContainerError::TimestampCountMismatch {
                timestamps: 2,
                vertices: 3
            })
        ));

        let trips = [EncodedTrip {
            route_index: 5,
            ..trips[0].clone()
        }];
        let result = encode(&ContainerInput {
            shapes: &shapes,
            routes: &routes,
            headsigns: &headsigns,
            trips: &trips,
        });
        assert!(matches!(
            result,
            Err(ContainerError::InvalidIndex { table: "route", .. })
        ));
    }
}
