// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    arena::BufferArena,
    coding::DecodeError,
    le_buffer::LeBuffer,
    row::Row,
    schema::{millis_to_time, Column, ColumnType, Decimal, Meta, Value, TAG_BLOB, TAG_OBJECT},
    Error,
};
use byteorder::{ByteOrder, LittleEndian};
use chrono::Datelike;
use num_bigint::BigInt;

/// Buffers pooled per codec, enough for a small batch of in-flight rows.
const ARENA_SLICES: usize = 16;

/// Bidirectional codec between a [`Row`] and its packed byte form.
///
/// The encoding is self-describing: a column count, then per column a
/// type tag (0 for null) and a little-endian payload. Encode buffers come
/// out of a per-codec arena and go back via [`RowCodec::release`].
pub struct RowCodec {
    meta: Meta,
    arena: BufferArena,
    row_bytes: usize,

    /// EXACT mode: reject variable-length values over their declared width
    exact: bool,
}

impl RowCodec {
    /// Creates a codec for a schema.
    ///
    /// # Errors
    ///
    /// Fails when the arena cannot be sized for the schema.
    pub fn new(meta: Meta) -> crate::Result<Self> {
        let row_bytes = meta.row_bytes();
        let arena = BufferArena::new(row_bytes, ARENA_SLICES)?;

        Ok(Self {
            meta,
            arena,
            row_bytes,
            exact: true,
        })
    }

    /// Worst-case encoded row size for this schema.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// The schema this codec encodes for.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Encodes a row into an arena buffer, flipped and ready to read.
    ///
    /// # Errors
    ///
    /// Fails when the value count does not match the schema, or a
    /// variable-length value exceeds its declared width in EXACT mode.
    pub fn format(&self, row: &Row) -> crate::Result<LeBuffer> {
        if row.len() != self.meta.columns.len() {
            return Err(Error::Format(format!(
                "row has {} values, schema {:?} has {} columns",
                row.len(),
                self.meta.name,
                self.meta.columns.len(),
            )));
        }

        let mut buf = self.arena.borrow(self.row_bytes);

        let result = self.format_into(row, &mut buf);
        if let Err(e) = result {
            self.arena.give_back(buf);
            return Err(e);
        }

        buf.flip();
        Ok(buf)
    }

    fn format_into(&self, row: &Row, buf: &mut LeBuffer) -> crate::Result<()> {
        buf.put_u16(u16::try_from(self.meta.columns.len()).map_err(|_| {
            Error::Format(format!("schema {:?} has too many columns", self.meta.name))
        })?)
        .map_err(Error::from)?;

        for (column, value) in self.meta.columns.iter().zip(&row.values) {
            self.encode_value(column, value, buf)?;
        }

        Ok(())
    }

    /// Returns an encode buffer to the codec's pool.
    pub fn release(&self, buf: LeBuffer) {
        self.arena.give_back(buf);
    }

    pub(crate) fn encode_value(
        &self,
        column: &Column,
        value: &Value,
        buf: &mut LeBuffer,
    ) -> crate::Result<()> {
        if value.is_null() {
            buf.put_u16(0).map_err(Error::from)?;
            return Ok(());
        }

        // Values that do not inhabit the column type yet are cast first
        let cast;
        let value = if value.type_of() == column.ctype {
            value
        } else {
            cast = value.clone().cast(column.ctype, column.precision)?;
            if cast.is_null() {
                buf.put_u16(0).map_err(Error::from)?;
                return Ok(());
            }
            &cast
        };

        buf.put_u16(u16::from(column.ctype)).map_err(Error::from)?;

        let overflow = |size: usize| Error::Overflow {
            column: column.name.clone(),
            size,
            max: column.width,
        };

        match value {
            Value::Null => unreachable!("null was handled above"),
            Value::Zero => {}
            Value::Int(v) => buf.put_i32(*v).map_err(Error::from)?,
            Value::UInt(v) => buf.put_u32(*v).map_err(Error::from)?,
            Value::Int8(v) => buf.put_u8(*v as u8).map_err(Error::from)?,
            Value::UInt8(v) => buf.put_u8(*v).map_err(Error::from)?,
            Value::Int16(v) => buf.put_i16(*v).map_err(Error::from)?,
            Value::UInt16(v) => buf.put_u16(*v).map_err(Error::from)?,
            Value::Int64(v) => buf.put_i64(*v).map_err(Error::from)?,
            Value::Double(v) => buf.put_f64(*v).map_err(Error::from)?,
            Value::Float(v) => buf.put_f32(*v).map_err(Error::from)?,
            Value::Str(s) => {
                let bytes = s.as_bytes();
                if self.exact && bytes.len() > column.width {
                    return Err(overflow(bytes.len()));
                }
                self.put_var(buf, bytes, column)?;
            }
            Value::Bytes(b) => {
                if self.exact && b.len() > column.width {
                    return Err(overflow(b.len()));
                }
                self.put_var(buf, b, column)?;
            }
            Value::Decimal(d) => {
                let bytes = d.rescale(column.precision).unscaled().to_signed_bytes_le();
                if self.exact && bytes.len() > column.width {
                    return Err(overflow(bytes.len()));
                }
                self.put_var(buf, &bytes, column)?;
            }
            Value::Date(d) => {
                let year = u32::try_from(d.year())
                    .map_err(|_| Error::Format(format!("cannot encode year {}", d.year())))?;
                let packed = (year * 12 + d.month() - 1) * 31 + (d.day() - 1);
                buf.put_u24(packed).map_err(Error::from)?;
            }
            Value::Time(t) => buf.put_i64(t.timestamp_millis()).map_err(Error::from)?,
            Value::Uuid(u) => {
                let v = u.as_u128();
                buf.put_u64((v >> 64) as u64).map_err(Error::from)?;
                buf.put_u64(v as u64).map_err(Error::from)?;
            }
            Value::Ipv6(ip) => {
                let v = u128::from(*ip);
                buf.put_u64((v >> 64) as u64).map_err(Error::from)?;
                buf.put_u64(v as u64).map_err(Error::from)?;
            }
        }

        Ok(())
    }

    fn put_var(&self, buf: &mut LeBuffer, bytes: &[u8], column: &Column) -> crate::Result<()> {
        let len = u16::try_from(bytes.len()).map_err(|_| Error::Overflow {
            column: column.name.clone(),
            size: bytes.len(),
            max: usize::from(u16::MAX),
        })?;

        buf.put_u16(len).map_err(Error::from)?;
        buf.put_slice(bytes).map_err(Error::from)?;
        Ok(())
    }

    /// Decodes one row.
    ///
    /// Tag 0 yields null regardless of the column type.
    ///
    /// # Errors
    ///
    /// Truncated buffers and unknown tags are decode failures; BLOB and
    /// OBJECT tags are rejected as unsupported.
    pub fn parse(&self, bytes: &[u8]) -> crate::Result<Row> {
        let mut pos = 0;
        self.parse_at(bytes, &mut pos)
    }

    /// Decodes up to `max_rows` consecutive rows, feeding each to the
    /// consumer until it returns `false` or the buffer is exhausted.
    ///
    /// Returns the number of rows consumed.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RowCodec::parse`]; consumer errors propagate.
    pub fn parse_batch(
        &self,
        bytes: &[u8],
        max_rows: usize,
        consumer: &mut dyn FnMut(Row) -> crate::Result<bool>,
    ) -> crate::Result<usize> {
        let mut pos = 0;
        let mut count = 0;

        while count < max_rows && pos + 2 <= bytes.len() {
            // A zero column count is trailing padding, not a row
            #[allow(clippy::indexing_slicing)]
            if LittleEndian::read_u16(&bytes[pos..pos + 2]) == 0 {
                break;
            }

            let row = self.parse_at(bytes, &mut pos)?;
            count += 1;

            if !consumer(row)? {
                break;
            }
        }

        Ok(count)
    }

    fn parse_at(&self, bytes: &[u8], pos: &mut usize) -> crate::Result<Row> {
        let count = usize::from(get_u16(bytes, pos)?);

        if count != self.meta.columns.len() {
            return Err(Error::Decode(DecodeError::InvalidHeader(
                "row column count does not match schema",
            )));
        }

        let mut values = Vec::with_capacity(count);

        for column in &self.meta.columns {
            values.push(self.decode_value(column, bytes, pos)?);
        }

        Ok(Row::new(values))
    }

    fn decode_value(
        &self,
        column: &Column,
        bytes: &[u8],
        pos: &mut usize,
    ) -> crate::Result<Value> {
        let tag = get_u16(bytes, pos)?;

        if tag == 0 {
            return Ok(Value::Null);
        }
        if tag == TAG_BLOB || tag == TAG_OBJECT {
            return Err(Error::Unsupported("BLOB and OBJECT column types"));
        }

        let ctype = ColumnType::try_from(tag)
            .map_err(|()| Error::Decode(DecodeError::InvalidTag(("column type", tag))))?;

        Ok(match ctype {
            ColumnType::Null => Value::Null,
            ColumnType::Zero => Value::Zero,
            ColumnType::Int => Value::Int(LittleEndian::read_i32(take(bytes, pos, 4)?)),
            ColumnType::UInt => Value::UInt(LittleEndian::read_u32(take(bytes, pos, 4)?)),
            ColumnType::Int8 => Value::Int8(take(bytes, pos, 1)?[0] as i8),
            ColumnType::UInt8 => Value::UInt8(take(bytes, pos, 1)?[0]),
            ColumnType::Int16 => Value::Int16(LittleEndian::read_i16(take(bytes, pos, 2)?)),
            ColumnType::UInt16 => Value::UInt16(LittleEndian::read_u16(take(bytes, pos, 2)?)),
            ColumnType::Int64 => Value::Int64(LittleEndian::read_i64(take(bytes, pos, 8)?)),
            ColumnType::Double => Value::Double(LittleEndian::read_f64(take(bytes, pos, 8)?)),
            ColumnType::Float => Value::Float(LittleEndian::read_f32(take(bytes, pos, 4)?)),
            ColumnType::String => {
                let len = usize::from(get_u16(bytes, pos)?);
                let raw = take(bytes, pos, len)?;
                let s = std::str::from_utf8(raw).map_err(DecodeError::from)?;
                Value::Str(s.to_owned())
            }
            ColumnType::Bytes => {
                let len = usize::from(get_u16(bytes, pos)?);
                Value::Bytes(take(bytes, pos, len)?.to_vec())
            }
            ColumnType::Decimal => {
                let len = usize::from(get_u16(bytes, pos)?);
                let raw = take(bytes, pos, len)?;
                Value::Decimal(Decimal::new(decode_unscaled(raw), column.precision))
            }
            ColumnType::Date => {
                let raw = take(bytes, pos, 3)?;

                #[allow(clippy::indexing_slicing)]
                let packed =
                    u32::from(raw[0]) | (u32::from(raw[1]) << 8) | (u32::from(raw[2]) << 16);
                let day = packed % 31 + 1;
                let month = (packed / 31) % 12 + 1;
                let year = packed / (31 * 12);

                let date = chrono::NaiveDate::from_ymd_opt(
                    i32::try_from(year).unwrap_or(i32::MAX),
                    month,
                    day,
                )
                .ok_or(Error::Decode(DecodeError::InvalidHeader("packed date")))?;

                Value::Date(date)
            }
            ColumnType::Time => {
                let ms = LittleEndian::read_i64(take(bytes, pos, 8)?);
                millis_to_time(ms)?
            }
            ColumnType::Uuid => {
                let hi = LittleEndian::read_u64(take(bytes, pos, 8)?);
                let lo = LittleEndian::read_u64(take(bytes, pos, 8)?);
                Value::Uuid(uuid::Uuid::from_u128((u128::from(hi) << 64) | u128::from(lo)))
            }
            ColumnType::Ipv6 => {
                let hi = LittleEndian::read_u64(take(bytes, pos, 8)?);
                let lo = LittleEndian::read_u64(take(bytes, pos, 8)?);
                Value::Ipv6(std::net::Ipv6Addr::from(
                    (u128::from(hi) << 64) | u128::from(lo),
                ))
            }
        })
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = pos
        .checked_add(len)
        .ok_or(DecodeError::UnexpectedEof)?;

    let slice = bytes.get(*pos..end).ok_or(DecodeError::UnexpectedEof)?;
    *pos = end;
    Ok(slice)
}

fn get_u16(bytes: &[u8], pos: &mut usize) -> Result<u16, DecodeError> {
    Ok(LittleEndian::read_u16(take(bytes, pos, 2)?))
}

/// Assembles an unscaled decimal from its LSB-first two's-complement form.
///
/// Values up to 8 bytes build a sign-extended `i64`, up to 16 bytes an
/// `i128`; anything longer goes through the big integer constructor.
fn decode_unscaled(raw: &[u8]) -> BigInt {
    if raw.is_empty() {
        return BigInt::from(0);
    }

    let negative = raw.last().is_some_and(|b| b & 0x80 != 0);

    if raw.len() <= 8 {
        let mut v: i64 = if negative { -1 } else { 0 };
        for &b in raw.iter().rev() {
            v = (v << 8) | i64::from(b);
        }
        BigInt::from(v)
    } else if raw.len() <= 16 {
        let mut v: i128 = if negative { -1 } else { 0 };
        for &b in raw.iter().rev() {
            v = (v << 8) | i128::from(b);
        }
        BigInt::from(v)
    } else {
        BigInt::from_signed_bytes_le(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Meta;
    use chrono::NaiveDate;
    use std::net::Ipv6Addr;
    use test_log::test;

    fn full_meta() -> crate::Result<Meta> {
        Meta::new(
            "everything",
            vec![
                Column::new("c_int", ColumnType::Int),
                Column::new("c_uint", ColumnType::UInt),
                Column::new("c_int8", ColumnType::Int8),
                Column::new("c_uint8", ColumnType::UInt8),
                Column::new("c_int16", ColumnType::Int16),
                Column::new("c_uint16", ColumnType::UInt16),
                Column::new("c_int64", ColumnType::Int64),
                Column::new("c_double", ColumnType::Double),
                Column::new("c_float", ColumnType::Float),
                Column::new("c_str", ColumnType::String).with_width(16),
                Column::decimal("c_dec", 18, 2),
                Column::new("c_bytes", ColumnType::Bytes).with_width(8),
                Column::new("c_date", ColumnType::Date),
                Column::new("c_time", ColumnType::Time),
                Column::new("c_uuid", ColumnType::Uuid),
                Column::new("c_ipv6", ColumnType::Ipv6),
            ],
            &["c_int64"],
        )
    }

    fn full_row() -> crate::Result<Row> {
        Ok(Row::new(vec![
            Value::Int(-42),
            Value::UInt(3_000_000_000),
            Value::Int8(-5),
            Value::UInt8(200),
            Value::Int16(-1_000),
            Value::UInt16(50_000),
            Value::Int64(i64::MIN / 3),
            Value::Double(3.25),
            Value::Float(-0.5),
            Value::Str("hello".into()),
            Value::Decimal(Decimal::parse("12.50")?),
            Value::Bytes(vec![1, 2, 3]),
            Value::Date(NaiveDate::from_ymd_opt(2026, 8, 1).expect("valid date")),
            Value::Int64(1_722_470_400_123).cast(ColumnType::Time, 0)?,
            Value::Uuid(uuid::Uuid::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677)),
            Value::Ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        ]))
    }

    #[test]
    fn codec_round_trip_all_types() -> crate::Result<()> {
        let codec = RowCodec::new(full_meta()?)?;
        let row = full_row()?;

        let buf = codec.format(&row)?;
        let decoded = codec.parse(buf.as_read_slice())?;
        codec.release(buf);

        assert_eq!(row.values, decoded.values);
        Ok(())
    }

    #[test]
    fn codec_preserves_nulls() -> crate::Result<()> {
        let meta = full_meta()?;
        let codec = RowCodec::new(meta.clone())?;
        let row = Row::nulls(&meta);

        let buf = codec.format(&row)?;
        let decoded = codec.parse(buf.as_read_slice())?;
        codec.release(buf);

        assert!(decoded.values.iter().all(Value::is_null));
        Ok(())
    }

    #[test]
    fn codec_rejects_wrong_arity() -> crate::Result<()> {
        let codec = RowCodec::new(full_meta()?)?;
        let row = Row::new(vec![Value::Int64(1)]);

        assert!(matches!(codec.format(&row), Err(Error::Format(_))));
        Ok(())
    }

    #[test]
    fn codec_rejects_oversized_string() -> crate::Result<()> {
        let meta = Meta::new(
            "t",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("s", ColumnType::String).with_width(4),
            ],
            &["id"],
        )?;
        let codec = RowCodec::new(meta)?;

        let row = Row::new(vec![Value::Int64(1), Value::Str("too long".into())]);
        assert!(matches!(
            codec.format(&row),
            Err(Error::Overflow { .. })
        ));

        Ok(())
    }

    #[test]
    fn codec_rejects_unknown_and_reserved_tags() -> crate::Result<()> {
        let meta = Meta::new(
            "t",
            vec![Column::new("id", ColumnType::Int64)],
            &["id"],
        )?;
        let codec = RowCodec::new(meta)?;

        // column count 1, then a reserved BLOB tag
        let mut bytes = vec![1, 0];
        bytes.extend_from_slice(&TAG_BLOB.to_le_bytes());
        assert!(matches!(
            codec.parse(&bytes),
            Err(Error::Unsupported(_))
        ));

        let mut bytes = vec![1, 0];
        bytes.extend_from_slice(&999u16.to_le_bytes());
        assert!(matches!(codec.parse(&bytes), Err(Error::Decode(_))));

        Ok(())
    }

    #[test]
    fn codec_truncation_is_an_error() -> crate::Result<()> {
        let codec = RowCodec::new(full_meta()?)?;
        let row = full_row()?;

        let buf = codec.format(&row)?;
        let whole = buf.as_read_slice().to_vec();
        codec.release(buf);

        assert!(codec.parse(&whole[..whole.len() / 2]).is_err());
        Ok(())
    }

    #[test]
    fn parse_batch_reads_consecutive_rows() -> crate::Result<()> {
        let codec = RowCodec::new(full_meta()?)?;
        let row = full_row()?;

        let buf = codec.format(&row)?;
        let one = buf.as_read_slice().to_vec();
        codec.release(buf);

        let mut batch = one.clone();
        batch.extend_from_slice(&one);
        batch.extend_from_slice(&one);

        let mut seen = 0;
        let n = codec.parse_batch(&batch, 10, &mut |r| {
            assert_eq!(row.values, r.values);
            seen += 1;
            Ok(true)
        })?;

        assert_eq!(3, n);
        assert_eq!(3, seen);

        // max_rows stops early
        let n = codec.parse_batch(&batch, 2, &mut |_| Ok(true))?;
        assert_eq!(2, n);

        // consumer can stop the batch
        let n = codec.parse_batch(&batch, 10, &mut |_| Ok(false))?;
        assert_eq!(1, n);

        Ok(())
    }

    #[test]
    fn decimal_wire_form_is_lsb_first() -> crate::Result<()> {
        let meta = Meta::new(
            "t",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::decimal("d", 18, 2),
            ],
            &["id"],
        )?;
        let codec = RowCodec::new(meta)?;

        let row = Row::new(vec![
            Value::Int64(1),
            Value::Decimal(Decimal::parse("12.50")?),
        ]);

        let buf = codec.format(&row)?;
        let bytes = buf.as_read_slice().to_vec();
        codec.release(buf);

        // skip count, id tag+payload, decimal tag, then length
        let p = 2 + (2 + 8) + 2;
        let len = usize::from(u16::from_le_bytes([bytes[p], bytes[p + 1]]));

        // 1250 = 0x04E2, LSB first
        assert_eq!(2, len);
        assert_eq!(&[0xE2, 0x04], &bytes[p + 2..p + 4]);

        Ok(())
    }

    #[test]
    fn decimal_decode_paths_agree() {
        for value in [
            BigInt::from(0),
            BigInt::from(-1),
            BigInt::from(i64::MAX),
            BigInt::from(i64::MIN),
            BigInt::from(i64::MAX) * BigInt::from(i64::MAX),
            -(BigInt::from(i64::MAX) * BigInt::from(i64::MAX) * BigInt::from(1_000_000i64)),
        ] {
            let wire = value.to_signed_bytes_le();
            assert_eq!(value, decode_unscaled(&wire), "{value}");
        }
    }
}
