// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{schema::ColumnType, Error};
use chrono::{DateTime, NaiveDate, Utc};
use num_bigint::BigInt;
use std::{cmp::Ordering, net::Ipv6Addr};
use uuid::Uuid;

/// Arbitrary-precision decimal: an unscaled integer plus a scale.
///
/// `12.50` is `unscaled = 1250, scale = 2`. The wire form of the unscaled
/// value is two's-complement, least-significant byte first.
#[derive(Clone, Debug)]
pub struct Decimal {
    unscaled: BigInt,
    scale: u32,
}

impl Decimal {
    /// Creates a decimal from an unscaled value and scale.
    #[must_use]
    pub fn new(unscaled: BigInt, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    /// Creates a decimal from an `i64` unscaled value and scale.
    #[must_use]
    pub fn from_unscaled_i64(unscaled: i64, scale: u32) -> Self {
        Self::new(BigInt::from(unscaled), scale)
    }

    /// The unscaled value.
    #[must_use]
    pub fn unscaled(&self) -> &BigInt {
        &self.unscaled
    }

    /// Digits to the right of the decimal point.
    #[must_use]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Returns this value at another scale.
    ///
    /// Widening multiplies by powers of ten; narrowing truncates toward
    /// zero.
    #[must_use]
    pub fn rescale(&self, scale: u32) -> Self {
        match scale.cmp(&self.scale) {
            Ordering::Equal => self.clone(),
            Ordering::Greater => {
                let factor = power_of_ten(scale - self.scale);
                Self::new(&self.unscaled * factor, scale)
            }
            Ordering::Less => {
                let factor = power_of_ten(self.scale - scale);
                Self::new(&self.unscaled / factor, scale)
            }
        }
    }

    /// Parses a plain decimal literal like `-12.50`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] on anything that is not
    /// `[-]digits[.digits]`.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let bad = || Error::Format(format!("invalid decimal literal {text:?}"));

        let (sign, digits) = match text.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", text.strip_prefix('+').unwrap_or(text)),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }

        let unscaled: BigInt = format!("{sign}{int_part}{frac_part}")
            .parse()
            .map_err(|_| bad())?;

        let scale = u32::try_from(frac_part.len()).map_err(|_| bad())?;

        Ok(Self::new(unscaled, scale))
    }

    /// Converts to the nearest `f64`.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Truncates to an `i64`, dropping any fractional digits.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] when the integral part does not fit.
    pub fn to_i64(&self) -> crate::Result<i64> {
        let whole = self.rescale(0);

        i64::try_from(&whole.unscaled)
            .map_err(|_| Error::Format(format!("decimal {self} does not fit into 64 bits")))
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }

        let negative = self.unscaled.sign() == num_bigint::Sign::Minus;
        let digits = self.unscaled.magnitude().to_string();
        let scale = self.scale as usize;

        let sign = if negative { "-" } else { "" };

        if digits.len() <= scale {
            write!(f, "{sign}0.{digits:0>scale$}")
        } else {
            let (int_part, frac_part) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int_part}.{frac_part}")
        }
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let scale = self.scale.max(other.scale);
        self.rescale(scale).unscaled == other.rescale(scale).unscaled
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let scale = self.scale.max(other.scale);
        Some(self.rescale(scale).unscaled.cmp(&other.rescale(scale).unscaled))
    }
}

/// A single typed value of a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null of any column type
    Null,

    /// Zero-width placeholder
    Zero,

    /// 32-bit signed integer
    Int(i32),

    /// 32-bit unsigned integer
    UInt(u32),

    /// 8-bit signed integer
    Int8(i8),

    /// 8-bit unsigned integer
    UInt8(u8),

    /// 16-bit signed integer
    Int16(i16),

    /// 16-bit unsigned integer
    UInt16(u16),

    /// 64-bit signed integer
    Int64(i64),

    /// 64-bit IEEE float
    Double(f64),

    /// 32-bit IEEE float
    Float(f32),

    /// UTF-8 string
    Str(String),

    /// Arbitrary-precision decimal
    Decimal(Decimal),

    /// Raw bytes
    Bytes(Vec<u8>),

    /// Calendar date
    Date(NaiveDate),

    /// Instant with millisecond precision
    Time(DateTime<Utc>),

    /// UUID
    Uuid(Uuid),

    /// IPv6 address
    Ipv6(Ipv6Addr),
}

impl Value {
    /// The column type this value inhabits.
    #[must_use]
    pub fn type_of(&self) -> ColumnType {
        match self {
            Self::Null => ColumnType::Null,
            Self::Zero => ColumnType::Zero,
            Self::Int(_) => ColumnType::Int,
            Self::UInt(_) => ColumnType::UInt,
            Self::Int8(_) => ColumnType::Int8,
            Self::UInt8(_) => ColumnType::UInt8,
            Self::Int16(_) => ColumnType::Int16,
            Self::UInt16(_) => ColumnType::UInt16,
            Self::Int64(_) => ColumnType::Int64,
            Self::Double(_) => ColumnType::Double,
            Self::Float(_) => ColumnType::Float,
            Self::Str(_) => ColumnType::String,
            Self::Decimal(_) => ColumnType::Decimal,
            Self::Bytes(_) => ColumnType::Bytes,
            Self::Date(_) => ColumnType::Date,
            Self::Time(_) => ColumnType::Time,
            Self::Uuid(_) => ColumnType::Uuid,
            Self::Ipv6(_) => ColumnType::Ipv6,
        }
    }

    /// Whether this is the null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn to_decimal(&self) -> crate::Result<Decimal> {
        match self {
            Self::Int(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::UInt(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::Int8(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::UInt8(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::Int16(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::UInt16(v) => Ok(Decimal::from_unscaled_i64(i64::from(*v), 0)),
            Self::Int64(v) => Ok(Decimal::from_unscaled_i64(*v, 0)),
            Self::Double(v) => Decimal::parse(&format!("{v}")),
            Self::Float(v) => Decimal::parse(&format!("{v}")),
            Self::Str(s) => Decimal::parse(s.trim()),
            Self::Decimal(d) => Ok(d.clone()),
            other => Err(Error::Format(format!(
                "cannot interpret {:?} as a number",
                other.type_of()
            ))),
        }
    }

    fn to_i64_checked(&self, target: ColumnType) -> crate::Result<i64> {
        let d = self.to_decimal()?;

        if d.scale() > 0 {
            // Fractional digits are dropped when casting to an integer type
            return d.rescale(0).to_i64();
        }

        d.to_i64().map_err(|_| {
            Error::Format(format!("value does not fit into {}", target.schema_name()))
        })
    }

    /// Casts this value to a column type, routing through a decimal
    /// intermediary when the families differ.
    ///
    /// Empty strings become null for numeric targets. Dates, times, UUIDs
    /// and IPv6 addresses parse from their canonical text forms.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] when the value cannot represent the
    /// target type.
    #[allow(clippy::too_many_lines)]
    pub fn cast(self, target: ColumnType, precision: u32) -> crate::Result<Self> {
        if self.is_null() || target == ColumnType::Null {
            return Ok(Self::Null);
        }
        if target == ColumnType::Zero {
            return Ok(Self::Zero);
        }
        if self.type_of() == target && target != ColumnType::Decimal {
            return Ok(self);
        }

        if let Self::Str(s) = &self {
            if s.trim().is_empty() && target.is_numeric() {
                return Ok(Self::Null);
            }
        }

        let out_of_range =
            |t: ColumnType| Error::Format(format!("value does not fit into {}", t.schema_name()));

        match target {
            ColumnType::Int => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::Int(
                    i32::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::UInt => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::UInt(
                    u32::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::Int8 => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::Int8(
                    i8::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::UInt8 => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::UInt8(
                    u8::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::Int16 => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::Int16(
                    i16::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::UInt16 => {
                let v = self.to_i64_checked(target)?;
                Ok(Self::UInt16(
                    u16::try_from(v).map_err(|_| out_of_range(target))?,
                ))
            }
            ColumnType::Int64 => Ok(Self::Int64(self.to_i64_checked(target)?)),
            ColumnType::Double => match self {
                Self::Double(v) => Ok(Self::Double(v)),
                Self::Float(v) => Ok(Self::Double(f64::from(v))),
                other => Ok(Self::Double(other.to_decimal()?.to_f64())),
            },
            ColumnType::Float => match self {
                Self::Float(v) => Ok(Self::Float(v)),
                Self::Double(v) => Ok(Self::Float(v as f32)),
                other => Ok(Self::Float(other.to_decimal()?.to_f64() as f32)),
            },
            ColumnType::Decimal => Ok(Self::Decimal(self.to_decimal()?.rescale(precision))),
            ColumnType::String => Ok(Self::Str(self.to_string())),
            ColumnType::Bytes => match self {
                Self::Bytes(b) => Ok(Self::Bytes(b)),
                Self::Str(s) => Ok(Self::Bytes(s.into_bytes())),
                other => Err(Error::Format(format!(
                    "cannot cast {:?} to BYTES",
                    other.type_of()
                ))),
            },
            ColumnType::Date => match self {
                Self::Date(d) => Ok(Self::Date(d)),
                Self::Time(t) => Ok(Self::Date(t.date_naive())),
                Self::Str(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(Self::Date)
                    .map_err(|_| Error::Format(format!("invalid date literal {s:?}"))),
                other => Err(Error::Format(format!(
                    "cannot cast {:?} to DATE",
                    other.type_of()
                ))),
            },
            ColumnType::Time => match self {
                Self::Time(t) => Ok(Self::Time(t)),
                Self::Int64(ms) => millis_to_time(ms),
                Self::Str(s) => parse_time(s.trim()),
                other => Err(Error::Format(format!(
                    "cannot cast {:?} to TIME",
                    other.type_of()
                ))),
            },
            ColumnType::Uuid => match self {
                Self::Uuid(u) => Ok(Self::Uuid(u)),
                Self::Str(s) => Uuid::parse_str(s.trim())
                    .map(Self::Uuid)
                    .map_err(|_| Error::Format(format!("invalid uuid literal {s:?}"))),
                other => Err(Error::Format(format!(
                    "cannot cast {:?} to UUID",
                    other.type_of()
                ))),
            },
            ColumnType::Ipv6 => match self {
                Self::Ipv6(ip) => Ok(Self::Ipv6(ip)),
                Self::Str(s) => s
                    .trim()
                    .parse()
                    .map(Self::Ipv6)
                    .map_err(|_| Error::Format(format!("invalid ipv6 literal {s:?}"))),
                other => Err(Error::Format(format!(
                    "cannot cast {:?} to IPV6",
                    other.type_of()
                ))),
            },
            ColumnType::Null | ColumnType::Zero => Ok(Self::Null),
        }
    }

    /// Orders two values of the same column type.
    ///
    /// Nulls sort first; floats use total ordering; mismatched types fall
    /// back to their tag order.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::Zero, Self::Zero) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::UInt(a), Self::UInt(b)) => a.cmp(b),
            (Self::Int8(a), Self::Int8(b)) => a.cmp(b),
            (Self::UInt8(a), Self::UInt8(b)) => a.cmp(b),
            (Self::Int16(a), Self::Int16(b)) => a.cmp(b),
            (Self::UInt16(a), Self::UInt16(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Ipv6(a), Self::Ipv6(b)) => a.cmp(b),
            (a, b) => u16::from(a.type_of()).cmp(&u16::from(b.type_of())),
        }
    }
}

fn power_of_ten(exponent: u32) -> BigInt {
    (0..exponent).fold(BigInt::from(1), |acc, _| acc * 10)
}

pub(crate) fn millis_to_time(ms: i64) -> crate::Result<Value> {
    DateTime::from_timestamp_millis(ms)
        .map(Value::Time)
        .ok_or_else(|| Error::Format(format!("epoch milliseconds {ms} out of range")))
}

fn parse_time(s: &str) -> crate::Result<Value> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(Value::Time(t.with_timezone(&Utc)));
    }

    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|t| Value::Time(t.and_utc()))
        .map_err(|_| Error::Format(format!("invalid time literal {s:?}")))
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Zero => write!(f, "0"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Ipv6(ip) => write!(f, "{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn decimal_parse_and_display() -> crate::Result<()> {
        for (text, unscaled, scale) in [
            ("12.50", 1250, 2),
            ("-0.01", -1, 2),
            ("15", 15, 0),
            ("0.001", 1, 3),
        ] {
            let d = Decimal::parse(text)?;
            assert_eq!(&BigInt::from(unscaled), d.unscaled(), "{text}");
            assert_eq!(scale, d.scale(), "{text}");
            assert_eq!(text.trim_start_matches('+'), d.to_string(), "{text}");
        }

        assert!(Decimal::parse("").is_err());
        assert!(Decimal::parse("1.2.3").is_err());
        assert!(Decimal::parse("abc").is_err());

        Ok(())
    }

    #[test]
    fn decimal_rescale() -> crate::Result<()> {
        let d = Decimal::parse("12.5")?;
        assert_eq!(Decimal::parse("12.50")?, d.rescale(2));
        assert_eq!(Decimal::parse("12")?, d.rescale(0));
        assert_eq!(d, d.rescale(4));
        Ok(())
    }

    #[test]
    fn cast_string_to_numbers() -> crate::Result<()> {
        assert_eq!(
            Value::Int64(42),
            Value::Str("42".into()).cast(ColumnType::Int64, 0)?
        );
        assert_eq!(
            Value::Int16(-7),
            Value::Str("-7".into()).cast(ColumnType::Int16, 0)?
        );
        assert_eq!(
            Value::Decimal(Decimal::parse("0.01")?),
            Value::Str("0.01".into()).cast(ColumnType::Decimal, 2)?
        );

        // empty string becomes null for numeric targets
        assert_eq!(Value::Null, Value::Str(String::new()).cast(ColumnType::Int, 0)?);

        // out of range is an error
        assert!(Value::Str("300".into()).cast(ColumnType::Int8, 0).is_err());

        Ok(())
    }

    #[test]
    fn cast_widening_integers() -> crate::Result<()> {
        assert_eq!(
            Value::Int64(200),
            Value::UInt8(200).cast(ColumnType::Int64, 0)?
        );
        assert_eq!(Value::Int(80), Value::Int16(80).cast(ColumnType::Int, 0)?);
        Ok(())
    }

    #[test]
    fn cast_temporal_and_misc() -> crate::Result<()> {
        let d = Value::Str("2026-08-01".into()).cast(ColumnType::Date, 0)?;
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(2026, 8, 1).expect("valid date")),
            d
        );

        let t = Value::Int64(1_000).cast(ColumnType::Time, 0)?;
        if let Value::Time(t) = t {
            assert_eq!(1_000, t.timestamp_millis());
        } else {
            panic!("expected a time value");
        }

        let u = Value::Str("6ec0bd7f-11c0-43da-975e-2a8ad9ebae0b".into())
            .cast(ColumnType::Uuid, 0)?;
        assert!(matches!(u, Value::Uuid(_)));

        let ip = Value::Str("::1".into()).cast(ColumnType::Ipv6, 0)?;
        assert_eq!(Value::Ipv6(Ipv6Addr::LOCALHOST), ip);

        Ok(())
    }

    #[test]
    fn null_survives_any_cast() -> crate::Result<()> {
        for tag in 0..18u16 {
            let t = ColumnType::try_from(tag).expect("tag is assigned");
            assert_eq!(Value::Null, Value::Null.cast(t, 0)?);
        }
        Ok(())
    }

    #[test]
    fn compare_orders_nulls_first() {
        assert_eq!(
            Ordering::Less,
            Value::Null.compare(&Value::Int64(i64::MIN))
        );
        assert_eq!(Ordering::Equal, Value::Null.compare(&Value::Null));
        assert_eq!(
            Ordering::Greater,
            Value::Int64(0).compare(&Value::Int64(-1))
        );
    }
}
