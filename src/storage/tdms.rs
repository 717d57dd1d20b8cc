//! Minimal TDMS segment writer and reader.
//!
//! Implements the subset of the TDMS 2.0 container the snapshot service
//! needs: one segment per file, little-endian, non-interleaved f64 channel
//! data under a single group, with typed per-channel properties (including
//! the `wf_*` waveform metadata viewers use to reconstruct the time axis).
//! The reader exists for round-trip tests and offline tooling.

use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};
use std::path::Path;

/// Lead-in table-of-contents flags.
const TOC_META_DATA: u32 = 1 << 1;
const TOC_NEW_OBJ_LIST: u32 = 1 << 2;
const TOC_RAW_DATA: u32 = 1 << 3;

/// TDMS 2.0 version tag.
const TDMS_VERSION: u32 = 4713;

/// Data-type codes used by this writer.
const TYPE_I32: u32 = 0x03;
const TYPE_U32: u32 = 0x07;
const TYPE_U64: u32 = 0x08;
const TYPE_F64: u32 = 0x0A;
const TYPE_STRING: u32 = 0x20;
const TYPE_BOOL: u32 = 0x21;
const TYPE_TIMESTAMP: u32 = 0x44;

/// Seconds between the TDMS epoch (1904-01-01) and the Unix epoch.
const EPOCH_1904_OFFSET: i64 = 2_082_844_800;

#[derive(Debug, thiserror::Error)]
pub enum TdmsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed tdms file: {0}")]
    Malformed(String),

    #[error("unsupported tdms feature: {0}")]
    Unsupported(String),
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum TdmsValue {
    I32(i32),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Time(DateTime<Utc>),
}

/// One channel: raw f64 samples plus its property list.
#[derive(Debug, Clone, Default)]
pub struct TdmsChannel {
    pub name: String,
    pub data: Vec<f64>,
    pub properties: Vec<(String, TdmsValue)>,
}

impl TdmsChannel {
    pub fn property(&self, name: &str) -> Option<&TdmsValue> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// One parsed segment.
#[derive(Debug, Clone)]
pub struct TdmsSegment {
    pub group: String,
    pub channels: Vec<TdmsChannel>,
}

// ============================================================================
// Writer
// ============================================================================

/// Write one segment holding `channels` under `group`.
pub fn write_segment(path: &Path, group: &str, channels: &[TdmsChannel]) -> Result<(), TdmsError> {
    let meta = build_metadata(group, channels);
    let raw_len: usize = channels.iter().map(|c| c.data.len() * 8).sum();

    let mut file = std::fs::File::create(path)?;
    file.write_all(b"TDSm")?;
    write_u32(&mut file, TOC_META_DATA | TOC_NEW_OBJ_LIST | TOC_RAW_DATA)?;
    write_u32(&mut file, TDMS_VERSION)?;
    write_u64(&mut file, (meta.len() + raw_len) as u64)?;
    write_u64(&mut file, meta.len() as u64)?;
    file.write_all(&meta)?;
    for channel in channels {
        for &sample in &channel.data {
            file.write_all(&sample.to_le_bytes())?;
        }
    }
    file.flush()?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn build_metadata(group: &str, channels: &[TdmsChannel]) -> Vec<u8> {
    let mut out = Vec::new();
    // Objects: root, group, then one per channel.
    push_u32(&mut out, 2 + channels.len() as u32);

    push_string(&mut out, "/");
    push_u32(&mut out, 0xFFFF_FFFF); // no raw data
    push_u32(&mut out, 0); // no properties

    push_string(&mut out, &format!("/'{}'", escape(group)));
    push_u32(&mut out, 0xFFFF_FFFF);
    push_u32(&mut out, 0);

    for channel in channels {
        push_string(
            &mut out,
            &format!("/'{}'/'{}'", escape(group), escape(&channel.name)),
        );
        // Raw data index: length (20), dtype, dimension, value count.
        push_u32(&mut out, 20);
        push_u32(&mut out, TYPE_F64);
        push_u32(&mut out, 1);
        push_u64(&mut out, channel.data.len() as u64);

        push_u32(&mut out, channel.properties.len() as u32);
        for (name, value) in &channel.properties {
            push_string(&mut out, name);
            push_value(&mut out, value);
        }
    }
    out
}

fn escape(name: &str) -> String {
    name.replace('\'', "''")
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn push_value(out: &mut Vec<u8>, value: &TdmsValue) {
    match value {
        TdmsValue::I32(v) => {
            push_u32(out, TYPE_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        TdmsValue::U32(v) => {
            push_u32(out, TYPE_U32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        TdmsValue::U64(v) => {
            push_u32(out, TYPE_U64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        TdmsValue::F64(v) => {
            push_u32(out, TYPE_F64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        TdmsValue::Bool(v) => {
            push_u32(out, TYPE_BOOL);
            out.push(u8::from(*v));
        }
        TdmsValue::Str(v) => {
            push_u32(out, TYPE_STRING);
            push_string(out, v);
        }
        TdmsValue::Time(ts) => {
            push_u32(out, TYPE_TIMESTAMP);
            let (fractions, seconds) = to_tdms_time(*ts);
            push_u64(out, fractions);
            out.extend_from_slice(&seconds.to_le_bytes());
        }
    }
}

/// TDMS timestamps: positive fractions of a second (2⁻⁶⁴) then seconds
/// since 1904-01-01T00:00:00 UTC.
fn to_tdms_time(ts: DateTime<Utc>) -> (u64, i64) {
    let seconds = ts.timestamp() + EPOCH_1904_OFFSET;
    let nanos = u128::from(ts.timestamp_subsec_nanos());
    let fractions = ((nanos << 64) / 1_000_000_000) as u64;
    (fractions, seconds)
}

fn from_tdms_time(fractions: u64, seconds: i64) -> DateTime<Utc> {
    let unix = seconds - EPOCH_1904_OFFSET;
    let nanos = ((u128::from(fractions) * 1_000_000_000) >> 64) as u32;
    Utc.timestamp_opt(unix, nanos).single().unwrap_or_default()
}

// ============================================================================
// Reader
// ============================================================================

/// Read a single-segment TDMS file written by [`write_segment`].
pub fn read_segment(path: &Path) -> Result<TdmsSegment, TdmsError> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut cursor = Cursor::new(&buf);

    let tag = cursor.take(4)?;
    if tag != b"TDSm" {
        return Err(TdmsError::Malformed("missing TDSm tag".into()));
    }
    let toc = cursor.u32()?;
    let _version = cursor.u32()?;
    let _next_segment = cursor.u64()?;
    let raw_offset = cursor.u64()? as usize;
    if toc & TOC_META_DATA == 0 {
        return Err(TdmsError::Unsupported("segment without metadata".into()));
    }
    let meta_end = cursor.pos + raw_offset;

    let object_count = cursor.u32()?;
    let mut group = String::new();
    let mut channels: Vec<(TdmsChannel, u64)> = Vec::new();

    for _ in 0..object_count {
        let path_str = cursor.string()?;
        let raw_index = cursor.u32()?;
        let mut value_count = 0u64;
        if raw_index != 0xFFFF_FFFF {
            if raw_index == 0 {
                return Err(TdmsError::Unsupported(
                    "raw index reuse across segments".into(),
                ));
            }
            let dtype = cursor.u32()?;
            if dtype != TYPE_F64 {
                return Err(TdmsError::Unsupported(format!(
                    "channel data type {dtype:#x}"
                )));
            }
            let dim = cursor.u32()?;
            if dim != 1 {
                return Err(TdmsError::Malformed(format!("array dimension {dim}")));
            }
            value_count = cursor.u64()?;
        }

        let prop_count = cursor.u32()?;
        let mut properties = Vec::with_capacity(prop_count as usize);
        for _ in 0..prop_count {
            let name = cursor.string()?;
            let value = cursor.value()?;
            properties.push((name, value));
        }

        match parse_path(&path_str) {
            ObjectPath::Root => {}
            ObjectPath::Group(g) => group = g,
            ObjectPath::Channel(g, name) => {
                if group.is_empty() {
                    group = g;
                }
                channels.push((
                    TdmsChannel {
                        name,
                        data: Vec::new(),
                        properties,
                    },
                    value_count,
                ));
            }
        }
    }

    if cursor.pos != meta_end {
        return Err(TdmsError::Malformed(format!(
            "metadata length mismatch: {} != {}",
            cursor.pos, meta_end
        )));
    }

    // Raw data: non-interleaved, in object order.
    for (channel, count) in &mut channels {
        let mut data = Vec::with_capacity(*count as usize);
        for _ in 0..*count {
            data.push(cursor.f64()?);
        }
        channel.data = data;
    }

    Ok(TdmsSegment {
        group,
        channels: channels.into_iter().map(|(c, _)| c).collect(),
    })
}

enum ObjectPath {
    Root,
    Group(String),
    Channel(String, String),
}

fn parse_path(path: &str) -> ObjectPath {
    if path == "/" {
        return ObjectPath::Root;
    }
    let parts: Vec<String> = path
        .split("/'")
        .skip(1)
        .map(|p| p.trim_end_matches('\'').replace("''", "'"))
        .collect();
    match parts.len() {
        1 => ObjectPath::Group(parts[0].clone()),
        _ => ObjectPath::Channel(parts[0].clone(), parts[1].clone()),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TdmsError> {
        if self.pos + n > self.buf.len() {
            return Err(TdmsError::Malformed("unexpected end of file".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, TdmsError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, TdmsError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, TdmsError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn i64(&mut self) -> Result<i64, TdmsError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    fn f64(&mut self) -> Result<f64, TdmsError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn string(&mut self) -> Result<String, TdmsError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TdmsError::Malformed(format!("invalid utf-8 string: {e}")))
    }

    fn value(&mut self) -> Result<TdmsValue, TdmsError> {
        let dtype = self.u32()?;
        Ok(match dtype {
            TYPE_I32 => TdmsValue::I32(self.i32()?),
            TYPE_U32 => TdmsValue::U32(self.u32()?),
            TYPE_U64 => TdmsValue::U64(self.u64()?),
            TYPE_F64 => TdmsValue::F64(self.f64()?),
            TYPE_BOOL => TdmsValue::Bool(self.take(1)?[0] != 0),
            TYPE_STRING => TdmsValue::Str(self.string()?),
            TYPE_TIMESTAMP => {
                let fractions = self.u64()?;
                let seconds = self.i64()?;
                TdmsValue::Time(from_tdms_time(fractions, seconds))
            }
            other => {
                return Err(TdmsError::Unsupported(format!(
                    "property type {other:#x}"
                )))
            }
        })
    }
}
