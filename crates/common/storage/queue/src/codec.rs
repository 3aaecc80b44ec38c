// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Page encoding.
//!
//! A page is stored as one blob:
//!
//! ```text
//! ┌────────────┬─────────┬─────────────┬──────────────────┬───────────┐
//! │ magic "SPLP"│ version │ count (u32) │ records ...      │ crc (u32) │
//! └────────────┴─────────┴─────────────┴──────────────────┴───────────┘
//! ```
//!
//! Integers are little-endian; the CRC covers every byte before it. How a
//! single record is laid out is up to the [`PageCodec`] implementation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{crc::page_checksum, record::Record};

pub(crate) const PAGE_MAGIC: &[u8; 4] = b"SPLP";
pub(crate) const PAGE_VERSION: u8 = 1;
const PAGE_HEADER_SIZE: usize = PAGE_MAGIC.len() + 1 + 4;
const PAGE_TRAILER_SIZE: usize = 4;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CodecError {
    #[snafu(display("Page truncated: needed {needed} bytes, {available} available"))]
    Truncated { needed: usize, available: usize },

    #[snafu(display("Not a page: bad magic"))]
    BadMagic,

    #[snafu(display("Unsupported page version {version}"))]
    UnsupportedVersion { version: u8 },

    #[snafu(display("Page checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"))]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[snafu(display("{remaining} unexpected bytes after the last record"))]
    TrailingBytes { remaining: usize },

    #[snafu(display("Field {field} is not valid UTF-8: {source}"))]
    InvalidUtf8 {
        field:  &'static str,
        source: std::str::Utf8Error,
    },

    #[snafu(display("Page holds no records"))]
    EmptyPage,

    #[snafu(display("Field {field} is {len} bytes, limit is {max}"))]
    FieldTooLarge {
        field: &'static str,
        len:   usize,
        max:   usize,
    },
}

/// Serializes an ordered list of records into one page blob and back.
pub trait PageCodec: Send + Sync + 'static {
    type Record: Send + 'static;

    fn encode(&self, records: &[Self::Record]) -> Result<Bytes, CodecError>;

    /// Must reject malformed input rather than return a partial page.
    fn decode(&self, page: &[u8]) -> Result<Vec<Self::Record>, CodecError>;
}

/// Records are raw byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl PageCodec for BytesCodec {
    type Record = Bytes;

    fn encode(&self, records: &[Bytes]) -> Result<Bytes, CodecError> {
        let body: usize = records.iter().map(|r| 4 + r.len()).sum();
        encode_page(records, body, |record, buf| {
            put_u32_prefixed(buf, "payload", record)
        })
    }

    fn decode(&self, page: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        decode_page(page, |cursor| {
            take_u32_prefixed(cursor).map(Bytes::copy_from_slice)
        })
    }
}

/// Records are [`Record`]s: three short tag strings and a payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl PageCodec for RecordCodec {
    type Record = Record;

    fn encode(&self, records: &[Record]) -> Result<Bytes, CodecError> {
        let body: usize = records
            .iter()
            .map(|r| {
                2 * 3 + 4 + r.data_type().len() + r.coding().len() + r.compress().len()
                    + r.payload().len()
            })
            .sum();
        encode_page(records, body, |record, buf| {
            put_u16_prefixed(buf, "data_type", record.data_type().as_bytes())?;
            put_u16_prefixed(buf, "coding", record.coding().as_bytes())?;
            put_u16_prefixed(buf, "compress", record.compress().as_bytes())?;
            put_u32_prefixed(buf, "payload", record.payload())
        })
    }

    fn decode(&self, page: &[u8]) -> Result<Vec<Record>, CodecError> {
        decode_page(page, |cursor| {
            let data_type = take_utf8(cursor, "data_type")?;
            let coding = take_utf8(cursor, "coding")?;
            let compress = take_utf8(cursor, "compress")?;
            let payload = Bytes::copy_from_slice(take_u32_prefixed(cursor)?);
            Ok(Record::builder()
                .data_type(data_type)
                .coding(coding)
                .compress(compress)
                .payload(payload)
                .build())
        })
    }
}

fn encode_page<T>(
    records: &[T],
    body_hint: usize,
    mut put: impl FnMut(&T, &mut BytesMut) -> Result<(), CodecError>,
) -> Result<Bytes, CodecError> {
    let count = u32::try_from(records.len()).ok().context(FieldTooLargeSnafu {
        field: "record count",
        len:   records.len(),
        max:   u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(PAGE_HEADER_SIZE + body_hint + PAGE_TRAILER_SIZE);
    buf.put_slice(PAGE_MAGIC);
    buf.put_u8(PAGE_VERSION);
    buf.put_u32_le(count);
    for record in records {
        put(record, &mut buf)?;
    }
    let crc = page_checksum(&buf);
    buf.put_u32_le(crc);

    Ok(buf.freeze())
}

fn decode_page<T>(
    page: &[u8],
    mut take: impl FnMut(&mut &[u8]) -> Result<T, CodecError>,
) -> Result<Vec<T>, CodecError> {
    ensure!(
        page.len() >= PAGE_HEADER_SIZE + PAGE_TRAILER_SIZE,
        TruncatedSnafu {
            needed:    PAGE_HEADER_SIZE + PAGE_TRAILER_SIZE,
            available: page.len(),
        }
    );
    ensure!(page.starts_with(PAGE_MAGIC), BadMagicSnafu);

    let (body, mut trailer) = page.split_at(page.len() - PAGE_TRAILER_SIZE);
    let stored = trailer.get_u32_le();
    let computed = page_checksum(body);
    ensure!(
        stored == computed,
        ChecksumMismatchSnafu { stored, computed }
    );

    let mut cursor = &body[PAGE_MAGIC.len()..];
    let version = cursor.get_u8();
    ensure!(
        version == PAGE_VERSION,
        UnsupportedVersionSnafu { version }
    );
    let count = cursor.get_u32_le() as usize;
    ensure!(count > 0, EmptyPageSnafu);

    // Every record takes at least one byte, which bounds a hostile count.
    let mut records = Vec::with_capacity(count.min(cursor.len()));
    for _ in 0..count {
        records.push(take(&mut cursor)?);
    }
    ensure!(
        cursor.is_empty(),
        TrailingBytesSnafu {
            remaining: cursor.len(),
        }
    );

    Ok(records)
}

fn put_u16_prefixed(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).ok().context(FieldTooLargeSnafu {
        field,
        len: data.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16_le(len);
    buf.put_slice(data);
    Ok(())
}

fn put_u32_prefixed(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(data.len()).ok().context(FieldTooLargeSnafu {
        field,
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    buf.put_u32_le(len);
    buf.put_slice(data);
    Ok(())
}

fn take_exact<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    ensure!(
        cursor.len() >= len,
        TruncatedSnafu {
            needed:    len,
            available: cursor.len(),
        }
    );
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head)
}

fn take_u16_prefixed<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let mut len = take_exact(cursor, 2)?;
    let len = len.get_u16_le() as usize;
    take_exact(cursor, len)
}

fn take_u32_prefixed<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let mut len = take_exact(cursor, 4)?;
    let len = len.get_u32_le() as usize;
    take_exact(cursor, len)
}

fn take_utf8(cursor: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let raw = take_u16_prefixed(cursor)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .context(InvalidUtf8Snafu { field })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::builder()
                .data_type("metrics")
                .coding("json")
                .payload(r#"{"cpu":0.5}"#)
                .build(),
            Record::from_payload(Bytes::new()),
            Record::builder()
                .compress("zstd")
                .payload(vec![0u8, 1, 2, 255])
                .build(),
        ]
    }

    #[test]
    fn test_record_codec_preserves_order_and_tags() {
        let records = sample_records();
        let page = RecordCodec.encode(&records).unwrap();
        assert!(page.starts_with(PAGE_MAGIC));
        assert_eq!(RecordCodec.decode(&page).unwrap(), records);
    }

    #[test]
    fn test_bytes_codec_preserves_order() {
        let records: Vec<Bytes> = (0..50).map(|i| Bytes::from(format!("msg-{i:03}"))).collect();
        let page = BytesCodec.encode(&records).unwrap();
        assert_eq!(BytesCodec.decode(&page).unwrap(), records);
    }

    #[test]
    fn test_empty_page_rejected_on_decode() {
        let page = BytesCodec.encode(&[]).unwrap();
        assert_eq!(BytesCodec.decode(&page), Err(CodecError::EmptyPage));
    }

    #[test_case(0 ; "empty input")]
    #[test_case(5 ; "header only")]
    #[test_case(16 ; "cut inside first record")]
    fn test_truncated_page_rejected(keep: usize) {
        let page = BytesCodec.encode(&[Bytes::from("abcdefgh")]).unwrap();
        assert!(BytesCodec.decode(&page[..keep]).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut page = BytesCodec.encode(&[Bytes::from("x")]).unwrap().to_vec();
        page[0] = b'X';
        assert_eq!(BytesCodec.decode(&page), Err(CodecError::BadMagic));
    }

    #[test]
    fn test_corruption_detected_by_checksum() {
        let mut page = RecordCodec.encode(&sample_records()).unwrap().to_vec();
        let mid = page.len() / 2;
        page[mid] ^= 0xFF;
        assert!(matches!(
            RecordCodec.decode(&page),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_count_larger_than_body_is_truncation() {
        let mut buf = BytesMut::new();
        buf.put_slice(PAGE_MAGIC);
        buf.put_u8(PAGE_VERSION);
        buf.put_u32_le(3);
        buf.put_u32_le(1);
        buf.put_u8(b'a');
        let crc = page_checksum(&buf);
        buf.put_u32_le(crc);

        assert!(matches!(
            BytesCodec.decode(&buf),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_tag_rejected_on_encode() {
        let record = Record::builder()
            .data_type("x".repeat(u16::MAX as usize + 1))
            .build();
        assert!(matches!(
            RecordCodec.encode(&[record]),
            Err(CodecError::FieldTooLarge {
                field: "data_type",
                ..
            })
        ));
    }
}
