//! Compact flag-driven binary codec for per-part file attributes.
//!
//! A part record starts with a flags byte selecting which well-known
//! fields follow (size, modification timestamp, CRC, text value, nested
//! subtrees), then carries the remaining attributes as a NUL-terminated
//! name/value list. Integers are big-endian; strings are NUL-terminated.
//! `@fileCrc` is preferred over `@crc` and only one of the two is ever
//! written. The well-known attribute names and `@num` never appear in the
//! generic tail; the decoder reattaches the leading `@` the tail drops.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDateTime};

use crate::tree::{read_cstr, write_cstr, PropTree, Result};

const PAF_HAS_SIZE: u8 = 0x01;
const PAF_HAS_DATE: u8 = 0x02;
const PAF_HAS_CRC: u8 = 0x04;
const PAF_HAS_VAL: u8 = 0x08;
const PAF_HAS_SUB: u8 = 0x10;
const PAF_HAS_FILECRC: u8 = 0x20;

const MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn parse_modified(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text.trim(), MODIFIED_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

fn render_modified(secs: i64) -> Option<String> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.format(MODIFIED_FORMAT).to_string())
}

/// Serializes one part record into `out`.
pub fn serialize_part_attr(out: &mut Vec<u8>, part: &PropTree) {
    let size = part.attr_u64("@size");
    let modified = part.attr("@modified").and_then(parse_modified);
    let mut flags = 0u8;
    if size.is_some() {
        flags |= PAF_HAS_SIZE;
    }
    if modified.is_some() {
        flags |= PAF_HAS_DATE;
    }
    if part.has_attr("@fileCrc") {
        flags |= PAF_HAS_FILECRC;
    } else if part.has_attr("@crc") {
        flags |= PAF_HAS_CRC;
    }
    if part.value().is_some() {
        flags |= PAF_HAS_VAL;
    }
    if part.has_children() {
        flags |= PAF_HAS_SUB;
    }
    out.push(flags);
    if let Some(size) = size {
        out.extend_from_slice(&size.to_be_bytes());
    }
    if let Some(secs) = modified {
        out.extend_from_slice(&secs.to_be_bytes());
    }
    if flags & PAF_HAS_FILECRC != 0 {
        out.extend_from_slice(&part.attr_i32("@fileCrc").unwrap_or(0).to_be_bytes());
    } else if flags & PAF_HAS_CRC != 0 {
        out.extend_from_slice(&part.attr_i32("@crc").unwrap_or(0).to_be_bytes());
    }
    if let Some(val) = part.value() {
        write_cstr(out, val);
    }
    if flags & PAF_HAS_SUB != 0 {
        for child in part.children() {
            write_cstr(out, child.name());
            child.serialize(out);
        }
        write_cstr(out, ""); // child terminator
    }
    for (name, value) in part.attrs() {
        let name = name.strip_prefix('@').unwrap_or(name);
        if matches!(name, "size" | "modified" | "crc" | "fileCrc" | "num") {
            continue;
        }
        write_cstr(out, name);
        write_cstr(out, value);
    }
    write_cstr(out, ""); // attribute terminator
}

/// Decodes one part record from `src`.
pub fn deserialize_part_attr(src: &mut impl Read) -> Result<PropTree> {
    let mut part = PropTree::new("Part");
    let flags = src.read_u8()?;
    if flags & PAF_HAS_SIZE != 0 {
        part.set_attr("@size", src.read_u64::<BigEndian>()?.to_string());
    }
    if flags & PAF_HAS_DATE != 0 {
        let secs = src.read_i64::<BigEndian>()?;
        if let Some(text) = render_modified(secs) {
            part.set_attr("@modified", text);
        }
    }
    if flags & PAF_HAS_FILECRC != 0 {
        part.set_attr("@fileCrc", src.read_i32::<BigEndian>()?.to_string());
    } else if flags & PAF_HAS_CRC != 0 {
        part.set_attr("@crc", src.read_i32::<BigEndian>()?.to_string());
    }
    if flags & PAF_HAS_VAL != 0 {
        part.set_value(read_cstr(src)?);
    }
    if flags & PAF_HAS_SUB != 0 {
        loop {
            let name = read_cstr(src)?;
            if name.is_empty() {
                break;
            }
            part.add_child(PropTree::deserialize(name, src)?);
        }
    }
    loop {
        let name = read_cstr(src)?;
        if name.is_empty() {
            break;
        }
        let value = read_cstr(src)?;
        // decoder reattaches the '@' the encoder drops
        part.set_attr(&name, value);
    }
    Ok(part)
}

/// Streaming decoder over a buffer of concatenated part records.
///
/// Parts are re-numbered through `@num` starting at 1 in encounter order;
/// iteration stops when the buffer is exhausted.
pub struct PartAttrReader {
    src: Cursor<Vec<u8>>,
    num: u32,
}

impl PartAttrReader {
    /// Takes ownership of the serialized buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self { src: Cursor::new(data), num: 0 }
    }
}

impl Iterator for PartAttrReader {
    type Item = Result<PropTree>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.src.position() >= self.src.get_ref().len() as u64 {
            return None;
        }
        self.num += 1;
        Some(deserialize_part_attr(&mut self.src).map(|mut part| {
            part.set_attr("@num", self.num.to_string());
            part
        }))
    }
}
