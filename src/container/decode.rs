//! Client side of the container: parses the shared prefix and individual chunks.

use std::ops::Range;

use serde::Serialize;
use zerocopy::{LE, U32};

use super::format::*;
use super::ContainerError;
use crate::schedule::TransitMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRoute {
    pub name: String,
    pub mode: TransitMode,
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkEntry {
    pub hour: u32,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedTrip {
    pub shape_index: usize,
    pub route_index: usize,
    pub headsign_index: usize,
    pub start_time: u32,
    pub timestamps: Vec<u32>,
}

/// Everything before the first chunk payload.
#[derive(Debug, Clone)]
pub struct ContainerIndex {
    pub header: FileHeader,
    /// Longitude, latitude and elevation of every shape point.
    pub shapes: Vec<Vec<[f32; 3]>>,
    pub routes: Vec<DecodedRoute>,
    pub headsigns: Vec<String>,
    pub chunks: Vec<ChunkEntry>,
    pub shared_prefix_size: usize,
}

impl ContainerIndex {
    /// Parses the shared prefix. `bytes` may be the whole file or just the prefix.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut reader = ByteReader::new(bytes, 0);
        let header: FileHeader = reader.read()?;
        if header.magic != MAGIC {
            return Err(ContainerError::BadMagic(header.magic));
        }
        if header.version.get() != FORMAT_VERSION {
            return Err(ContainerError::UnsupportedVersion(header.version.get()));
        }

        let mut reader = ByteReader::new(bytes, header.shape_table_offset.get() as usize);
        let shapes = (0..header.shape_count.get())
            .map(|_| read_shape_entry(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;

        let route_table_offset = header.route_table_offset.get() as usize;
        if reader.offset() != route_table_offset {
            return Err(ContainerError::LayoutMismatch {
                section: "route table",
                expected: route_table_offset,
                actual: reader.offset(),
            });
        }
        let records = (0..header.route_count.get())
            .map(|_| reader.read::<RouteRecord>())
            .collect::<Result<Vec<_>, _>>()?;
        let blob_len = reader.read_u32()? as usize;
        let blob = reader.take(blob_len)?;
        let routes = records
            .iter()
            .map(|record| {
                Ok(DecodedRoute {
                    name: read_string(blob, record.name_offset.get() as usize)?,
                    mode: TransitMode::from_byte(record.mode),
                    color: record.color,
                })
            })
            .collect::<Result<Vec<_>, ContainerError>>()?;

        let name_offsets = (0..header.headsign_count.get())
            .map(|_| reader.read_u32())
            .collect::<Result<Vec<_>, _>>()?;
        let blob_len = reader.read_u32()? as usize;
        let blob = reader.take(blob_len)?;
        let headsigns = name_offsets
            .into_iter()
            .map(|offset| read_string(blob, offset as usize))
            .collect::<Result<Vec<_>, _>>()?;

        let chunks = (0..header.chunk_count.get())
            .map(|_| {
                let entry: ChunkIndexEntry = reader.read()?;
                Ok(ChunkEntry {
                    hour: entry.hour.get(),
                    offset: entry.offset.get() as usize,
                    length: entry.length.get() as usize,
                })
            })
            .collect::<Result<Vec<_>, ContainerError>>()?;

        Ok(ContainerIndex {
            header,
            shapes,
            routes,
            headsigns,
            chunks,
            shared_prefix_size: reader.offset(),
        })
    }

    pub fn chunk_for_hour(&self, hour: u32) -> Option<&ChunkEntry> {
        self.chunks.iter().find(|chunk| chunk.hour == hour)
    }

    /// Byte range to request for the chunk of `hour`.
    pub fn chunk_range(&self, hour: u32) -> Result<Range<usize>, ContainerError> {
        let chunk = self
            .chunk_for_hour(hour)
            .ok_or(ContainerError::InvalidHour(hour))?;
        Ok(chunk.offset..chunk.offset + chunk.length)
    }

    /// Decodes the trips of `hour` from the whole file and checks them against the tables.
    pub fn trips_in_hour(&self, bytes: &[u8], hour: u32) -> Result<Vec<DecodedTrip>, ContainerError> {
        let range = self.chunk_range(hour)?;
        let payload = bytes.get(range.clone()).ok_or(ContainerError::Truncated {
            offset: range.start,
            needed: range.len(),
        })?;
        let trips = decode_chunk(payload)?;
        for trip in &trips {
            self.check_trip(trip)?;
        }
        Ok(trips)
    }

    fn check_trip(&self, trip: &DecodedTrip) -> Result<(), ContainerError> {
        let shape = self
            .shapes
            .get(trip.shape_index)
            .ok_or(ContainerError::InvalidIndex {
                table: "shape",
                index: trip.shape_index,
                len: self.shapes.len(),
            })?;
        if trip.route_index >= self.routes.len() {
            return Err(ContainerError::InvalidIndex {
                table: "route",
                index: trip.route_index,
                len: self.routes.len(),
            });
        }
        if trip.headsign_index >= self.headsigns.len() {
            return Err(ContainerError::InvalidIndex {
                table: "headsign",
                index: trip.headsign_index,
                len: self.headsigns.len(),
            });
        }
        if trip.timestamps.len() != shape.len() {
            return Err(ContainerError::TimestampCountMismatch {
                timestamps: trip.timestamps.len(),
                vertices: shape.len(),
            });
        }
        Ok(())
    }
}

/// Decodes one chunk payload on its own. An empty payload is an empty hour.
pub fn decode_chunk(payload: &[u8]) -> Result<Vec<DecodedTrip>, ContainerError> {
    if payload.is_empty() {
        return Ok(vec![]);
    }
    let mut reader = ByteReader::new(payload, 0);
    let count = reader.read_u32()?;
    let mut trips = vec![];
    for _ in 0..count {
        let record: TripRecord = reader.read()?;
        let timestamps = (0..record.timestamp_count.get())
            .map(|_| reader.read::<U32<LE>>().map(|value| value.get()))
            .collect::<Result<Vec<_>, _>>()?;
        trips.push(DecodedTrip {
            shape_index: record.shape_index.get() as usize,
            route_index: usize::from(record.route_index.get()),
            headsign_index: usize::from(record.headsign_index.get()),
            start_time: record.start_time.get(),
            timestamps,
        });
    }
    if !reader.is_at_end() {
        return Err(ContainerError::LayoutMismatch {
            section: "chunk payload end",
            expected: payload.len(),
            actual: reader.offset(),
        });
    }
    Ok(trips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{encode, ContainerInput, EncodedTrip, StringTable};
    use crate::dedup::ShapeTable;
    use crate::interpolate::Waypoint;
    use crate::schedule::{Route, RouteID};
    use approx::assert_relative_eq;
    use ustr::ustr;

    fn path(start: u32, lon: f64) -> Vec<Waypoint> {
        (0..3)
            .map(|i| Waypoint {
                longitude: lon,
                latitude: 48.1 + i as f64 * 0.001,
                elevation: 520.0,
                timestamp: start + i * 90,
            })
            .collect()
    }

    fn encoded() -> Vec<u8> {
        let routes = vec![
            Route {
                id: RouteID(ustr("u2")),
                mode: TransitMode::Subway,
                short_name: Some("U2".to_string()),
                long_name: None,
                color: [0xDD, 0x3D, 0x4D],
            },
            Route {
                id: RouteID(ustr("x1")),
                mode: TransitMode::Unknown,
                short_name: None,
                long_name: Some("Airport Express".to_string()),
                color: [0x80, 0x80, 0x80],
            },
        ];
        let mut shapes = ShapeTable::new();
        let mut headsigns = StringTable::new();
        let mut trips = vec![];
        for (start, lon, route_index, headsign) in [
            (30_000, 11.5, 0, "Messestadt Ost"),
            (31_000, 11.6, 1, "Flughafen"),
            (97_200, 11.5, 0, "Messestadt Ost"),
        ] {
            let path = path(start, lon);
            trips.push(EncodedTrip {
                shape_index: shapes.intern(&path).unwrap(),
                route_index,
                headsign_index: headsigns.intern(headsign),
                timestamps: path.iter().map(|w| w.timestamp).collect(),
            });
        }
        encode(&ContainerInput {
            shapes: &shapes,
            routes: &routes,
            headsigns: &headsigns,
            trips: &trips,
        })
        .unwrap()
        .bytes
    }

    #[test]
    fn parses_the_shared_prefix() {
        let bytes = encoded();
        let index = ContainerIndex::parse(&bytes).unwrap();
        assert_eq!(index.shapes.len(), 2);
        assert_relative_eq!(index.shapes[1][0][0], 11.6f32);
        assert_relative_eq!(index.shapes[0][2][2], 520.0f32);
        assert_eq!(index.routes[0].name, "U2");
        assert_eq!(index.routes[1].name, "Airport Express");
        assert_eq!(index.routes[1].mode, TransitMode::Unknown);
        assert_eq!(index.headsigns, ["Messestadt Ost", "Flughafen"]);
        assert_eq!(index.chunks.len(), CHUNK_COUNT);

        // The prefix alone is enough to parse the index.
        let prefix = ContainerIndex::parse(&bytes[..index.shared_prefix_size]).unwrap();
        assert_eq!(prefix.chunks, index.chunks);
    }

    #[test]
    fn chunks_decode_independently() {
        let bytes = encoded();
        let index = ContainerIndex::parse(&bytes).unwrap();

        let morning = index.trips_in_hour(&bytes, 8).unwrap();
        assert_eq!(morning.len(), 2);
        assert_eq!(morning[0].timestamps, [30_000, 30_090, 30_180]);
        assert_eq!(morning[1].route_index, 1);
        assert_eq!(morning[1].headsign_index, 1);

        let late = index.chunk_range(27).unwrap();
        let trips = decode_chunk(&bytes[late]).unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].start_time, 97_200);
        assert_eq!(trips[0].shape_index, 0);

        assert!(index.trips_in_hour(&bytes, 12).unwrap().is_empty());
        assert!(matches!(
            index.chunk_range(3),
            Err(ContainerError::InvalidHour(3))
        ));
    }

    #[test]
    fn rejects_foreign_and_truncated_input() {
        let mut bytes = encoded();
        assert!(matches!(
            ContainerIndex::parse(&bytes[..20]),
            Err(ContainerError::Truncated { .. })
        ));
        bytes[4] = 9;
        assert!(matches!(
            ContainerIndex::parse(&bytes),
            Err(ContainerError::UnsupportedVersion(9))
        ));
        bytes[0] = b'X';
        assert!(matches!(
            ContainerIndex::parse(&bytes),
            Err(ContainerError::BadMagic(_))
        ));
    }

    #[test]
    fn trailing_bytes_in_a_chunk_are_an_error() {
        let bytes = encoded();
        let index = ContainerIndex::parse(&bytes).unwrap();
        let mut payload = bytes[index.chunk_range(27).unwrap()].to_vec();
        payload.push(0);
        assert!(matches!(
            decode_chunk(&payload),
            Err(ContainerError::LayoutMismatch { .. })
        ));
    }
}
