//! On-disk records of the playback container.
//!
//! All integers are little-endian. The file is laid out as
//!
//! ```text
//! header (32 bytes)
//! shape table      shape_count × { point_count u32, point_count × (lon, lat, elevation) f32 }
//! route table      route_count × RouteRecord, blob_len u32, NUL-terminated names
//! headsign table   headsign_count × name_offset u32, blob_len u32, NUL-terminated names
//! chunk index      chunk_count × ChunkIndexEntry, one per hour bucket
//! chunk payloads   in hour order; trip_count u32, then per trip a TripRecord and its timestamps
//! ```
//!
//! Every offset is absolute from the start of the file.

use std::mem::size_of;

use zerocopy::{FromBytes, IntoBytes, F32, LE, U16, U32};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::ContainerError;

pub const MAGIC: [u8; 4] = *b"TPLB";
pub const FORMAT_VERSION: u32 = 1;

/// First hour bucket. Trips starting earlier are clamped into it.
pub const MIN_HOUR: u32 = 4;
/// Last hour bucket (03:00 of the next day). Trips starting later are clamped into it.
pub const MAX_HOUR: u32 = 27;
pub const CHUNK_COUNT: usize = (MAX_HOUR - MIN_HOUR + 1) as usize;

pub const HEADER_SIZE: usize = 32;
pub const ROUTE_RECORD_SIZE: usize = 8;
pub const CHUNK_INDEX_ENTRY_SIZE: usize = 12;
pub const TRIP_RECORD_SIZE: usize = 20;
pub const SHAPE_VERTEX_SIZE: usize = 12;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: U32<LE>,
    pub shape_count: U32<LE>,
    pub route_count: U32<LE>,
    pub headsign_count: U32<LE>,
    pub chunk_count: U32<LE>,
    pub shape_table_offset: U32<LE>,
    pub route_table_offset: U32<LE>,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RouteRecord {
    /// Offset of the display name in the route string blob.
    pub name_offset: U32<LE>,
    pub mode: u8,
    pub color: [u8; 3],
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ChunkIndexEntry {
    pub hour: U32<LE>,
    pub offset: U32<LE>,
    pub length: U32<LE>,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TripRecord {
    pub shape_index: U32<LE>,
    pub route_index: U16<LE>,
    pub headsign_index: U16<LE>,
    pub timestamp_count: U32<LE>,
    /// First timestamp of the trip, seconds since the start of the service day.
    pub start_time: U32<LE>,
    /// Always zero for now.
    pub reserved: U32<LE>,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct ShapeVertexRecord {
    pub longitude: F32<LE>,
    pub latitude: F32<LE>,
    pub elevation: F32<LE>,
}

impl From<[f32; 3]> for ShapeVertexRecord {
    fn from([longitude, latitude, elevation]: [f32; 3]) -> Self {
        ShapeVertexRecord {
            longitude: F32::new(longitude),
            latitude: F32::new(latitude),
            elevation: F32::new(elevation),
        }
    }
}

impl From<&ShapeVertexRecord> for [f32; 3] {
    fn from(record: &ShapeVertexRecord) -> Self {
        [record.longitude.get(), record.latitude.get(), record.elevation.get()]
    }
}

const _: () = assert!(size_of::<FileHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<RouteRecord>() == ROUTE_RECORD_SIZE);
const _: () = assert!(size_of::<ChunkIndexEntry>() == CHUNK_INDEX_ENTRY_SIZE);
const _: () = assert!(size_of::<TripRecord>() == TRIP_RECORD_SIZE);
const _: () = assert!(size_of::<ShapeVertexRecord>() == SHAPE_VERTEX_SIZE);

pub(crate) fn to_u32(field: &'static str, value: usize) -> Result<u32, ContainerError> {
    u32::try_from(value).map_err(|_| ContainerError::FieldOverflow { field, value })
}

pub(crate) fn to_u16(field: &'static str, value: usize) -> Result<u16, ContainerError> {
    u16::try_from(value).map_err(|_| ContainerError::FieldOverflow { field, value })
}

pub fn write_shape_entry(out: &mut Vec<u8>, vertices: &[[f32; 3]]) -> Result<(), ContainerError> {
    out.extend_from_slice(&to_u32("shape point count", vertices.len())?.to_le_bytes());
    let records: Vec<ShapeVertexRecord> = vertices.iter().copied().map(Into::into).collect();
    out.extend_from_slice(records.as_bytes());
    Ok(())
}

pub fn read_shape_entry(reader: &mut ByteReader<'_>) -> Result<Vec<[f32; 3]>, ContainerError> {
    let offset = reader.offset();
    let count = reader.read_u32()? as usize;
    let needed = count.checked_mul(SHAPE_VERTEX_SIZE).ok_or(ContainerError::Truncated {
        offset,
        needed: usize::MAX,
    })?;
    let bytes = reader.take(needed)?;
    let records = <[ShapeVertexRecord]>::ref_from_bytes(bytes)
        .map_err(|_| ContainerError::Truncated { offset, needed })?;
    Ok(records.iter().map(<[f32; 3]>::from).collect())
}

/// Concatenates NUL-terminated strings, returning each string's offset and the blob.
///
/// Interior NUL characters would end a string early, so they are dropped.
pub fn string_blob<'s>(
    strings: impl IntoIterator<Item = &'s str>,
) -> Result<(Vec<u32>, Vec<u8>), ContainerError> {
    let mut offsets = vec![];
    let mut blob = vec![];
    for string in strings {
        offsets.push(to_u32("string offset", blob.len())?);
        blob.extend(string.bytes().filter(|&byte| byte != 0));
        blob.push(0);
    }
    Ok((offsets, blob))
}

pub fn read_string(blob: &[u8], offset: usize) -> Result<String, ContainerError> {
    let tail = blob.get(offset..).ok_or(ContainerError::Truncated {
        offset,
        needed: 1,
    })?;
    let end = tail
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(ContainerError::UnterminatedString { offset })?;
    Ok(std::str::from_utf8(&tail[..end])?.to_string())
}

/// Forward-only cursor over a byte slice that tracks absolute offsets.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8], offset: usize) -> Self {
        ByteReader { bytes, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], ContainerError> {
        let truncated = ContainerError::Truncated {
            offset: self.offset,
            needed: len,
        };
        let end = self.offset.checked_add(len).ok_or(truncated.clone())?;
        let slice = self.bytes.get(self.offset..end).ok_or(truncated)?;
        self.offset = end;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, ContainerError> {
        let value: U32<LE> = self.read()?;
        Ok(value.get())
    }

    pub fn read<T: FromBytes>(&mut self) -> Result<T, ContainerError> {
        let offset = self.offset;
        let bytes = self.take(size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| ContainerError::Truncated {
            offset,
            needed: size_of::<T>(),
        })
    }

    pub fn is_at_end(&self) -> bool {
        self.offset >= self.bytes.len()
    }
}
