// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{schema::Value, Error};

/// Wire tags of the BLOB and OBJECT types of the original format.
///
/// Both are recognized so they can be rejected with a proper error instead
/// of a corruption report.
pub(crate) const TAG_BLOB: u16 = 18;
pub(crate) const TAG_OBJECT: u16 = 19;

/// Column type of a table schema.
///
/// The numeric wire tag of each type doubles as the per-value type marker
/// in the row encoding, with tag 0 (`Null`) standing in for a null value
/// of any column type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ColumnType {
    /// Null marker; also the per-value tag for a null of any type
    Null,

    /// Zero-width placeholder type
    Zero,

    /// 32-bit signed integer
    Int,

    /// 32-bit unsigned integer (stored as its bit pattern)
    UInt,

    /// 8-bit signed integer
    Int8,

    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit signed integer
    Int16,

    /// 16-bit unsigned integer
    UInt16,

    /// 64-bit signed integer
    Int64,

    /// 64-bit IEEE float
    Double,

    /// 32-bit IEEE float
    Float,

    /// UTF-8 string with a declared maximum byte length
    String,

    /// Arbitrary-precision decimal with a declared scale
    Decimal,

    /// Raw bytes with a declared maximum length
    Bytes,

    /// Calendar date, packed into 3 bytes
    Date,

    /// Instant, stored as epoch milliseconds
    Time,

    /// UUID, stored as two 64-bit halves
    Uuid,

    /// IPv6 address, stored as two 64-bit halves
    Ipv6,
}

impl From<ColumnType> for u16 {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Null => 0,
            ColumnType::Zero => 1,
            ColumnType::Int => 2,
            ColumnType::UInt => 3,
            ColumnType::Int8 => 4,
            ColumnType::UInt8 => 5,
            ColumnType::Int16 => 6,
            ColumnType::UInt16 => 7,
            ColumnType::Int64 => 8,
            ColumnType::Double => 9,
            ColumnType::Float => 10,
            ColumnType::String => 11,
            ColumnType::Decimal => 12,
            ColumnType::Bytes => 13,
            ColumnType::Date => 14,
            ColumnType::Time => 15,
            ColumnType::Uuid => 16,
            ColumnType::Ipv6 => 17,
        }
    }
}

impl TryFrom<u16> for ColumnType {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Zero),
            2 => Ok(Self::Int),
            3 => Ok(Self::UInt),
            4 => Ok(Self::Int8),
            5 => Ok(Self::UInt8),
            6 => Ok(Self::Int16),
            7 => Ok(Self::UInt16),
            8 => Ok(Self::Int64),
            9 => Ok(Self::Double),
            10 => Ok(Self::Float),
            11 => Ok(Self::String),
            12 => Ok(Self::Decimal),
            13 => Ok(Self::Bytes),
            14 => Ok(Self::Date),
            15 => Ok(Self::Time),
            16 => Ok(Self::Uuid),
            17 => Ok(Self::Ipv6),
            _ => Err(()),
        }
    }
}

impl ColumnType {
    /// Natural byte width of fixed-size types, `None` for variable-length ones.
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Null | Self::Zero => Some(0),
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Date => Some(3),
            Self::Int | Self::UInt | Self::Float => Some(4),
            Self::Int64 | Self::Double | Self::Time => Some(8),
            Self::Uuid | Self::Ipv6 => Some(16),
            Self::String | Self::Decimal | Self::Bytes => None,
        }
    }

    /// Whether payloads of this type carry a 2-byte length prefix.
    #[must_use]
    pub fn is_variable(self) -> bool {
        self.fixed_width().is_none()
    }

    /// Whether the type belongs to the numeric cast family.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Int
                | Self::UInt
                | Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::UInt16
                | Self::Int64
                | Self::Double
                | Self::Float
                | Self::Decimal
        )
    }

    /// Schema name, as written in the sidecar file.
    #[must_use]
    pub fn schema_name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Zero => "ZERO",
            Self::Int => "INT",
            Self::UInt => "UINT",
            Self::Int8 => "INT8",
            Self::UInt8 => "UINT8",
            Self::Int16 => "INT16",
            Self::UInt16 => "UINT16",
            Self::Int64 => "INT64",
            Self::Double => "DOUBLE",
            Self::Float => "FLOAT",
            Self::String => "STRING",
            Self::Decimal => "DECIMAL",
            Self::Bytes => "BYTES",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Uuid => "UUID",
            Self::Ipv6 => "IPV6",
        }
    }

    /// Parses a schema type name (case-insensitive).
    ///
    /// # Errors
    ///
    /// BLOB and OBJECT are rejected as unsupported; anything else unknown
    /// is a format error.
    pub fn from_schema_name(name: &str) -> crate::Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NULL" => Ok(Self::Null),
            "ZERO" => Ok(Self::Zero),
            "INT" | "INT32" => Ok(Self::Int),
            "UINT" | "UINT32" => Ok(Self::UInt),
            "INT8" => Ok(Self::Int8),
            "UINT8" => Ok(Self::UInt8),
            "INT16" => Ok(Self::Int16),
            "UINT16" => Ok(Self::UInt16),
            "INT64" => Ok(Self::Int64),
            "DOUBLE" => Ok(Self::Double),
            "FLOAT" => Ok(Self::Float),
            "STRING" | "VARCHAR" => Ok(Self::String),
            "DECIMAL" => Ok(Self::Decimal),
            "BYTES" => Ok(Self::Bytes),
            "DATE" => Ok(Self::Date),
            "TIME" | "TIMESTAMP" => Ok(Self::Time),
            "UUID" => Ok(Self::Uuid),
            "IPV6" => Ok(Self::Ipv6),
            "BLOB" | "OBJECT" => Err(Error::Unsupported("BLOB and OBJECT column types")),
            other => Err(Error::Format(format!("unknown column type {other:?}"))),
        }
    }
}

/// One column of a table schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    /// Normalized (lower-case) column name
    pub name: String,

    /// Column type
    pub ctype: ColumnType,

    /// Maximum payload bytes for a value of this column
    pub width: usize,

    /// Decimal scale digits (DECIMAL columns only)
    pub precision: u32,

    /// Whether nulls are rejected
    pub not_null: bool,

    /// Default value, already cast to the column type
    pub default: Option<Value>,

    /// Free-form comment
    pub comment: Option<String>,
}

impl Column {
    /// Creates a column of the given type with its natural width.
    ///
    /// Variable-length types start with a zero width and need
    /// [`Column::with_width`] (or the DECIMAL constructor) before use.
    #[must_use]
    pub fn new(name: &str, ctype: ColumnType) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            ctype,
            width: ctype.fixed_width().unwrap_or(0),
            precision: 0,
            not_null: false,
            default: None,
            comment: None,
        }
    }

    /// Creates a DECIMAL column from total digits and scale.
    ///
    /// The worst-case byte width is derived from the digit count.
    #[must_use]
    pub fn decimal(name: &str, digits: u32, scale: u32) -> Self {
        let mut c = Self::new(name, ColumnType::Decimal);
        c.width = Self::decimal_width(digits);
        c.precision = scale;
        c
    }

    /// Worst-case unscaled-value byte width for a digit count.
    #[must_use]
    pub fn decimal_width(digits: u32) -> usize {
        digits as usize / 2 + 3
    }

    /// Sets the declared maximum byte width.
    #[must_use]
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Sets the default value, casting it to the column type.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be cast.
    pub fn with_default(mut self, value: Value) -> crate::Result<Self> {
        self.default = Some(value.cast(self.ctype, self.precision)?);
        Ok(self)
    }

    /// Sets the column comment.
    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_owned());
        self
    }

    /// Worst-case encoded cost of one value of this column:
    /// 2 tag bytes, a 2-byte length prefix for variable-length types,
    /// and the declared width.
    #[must_use]
    pub fn encoded_cost(&self) -> usize {
        2 + if self.ctype.is_variable() { 2 } else { 0 } + self.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn column_type_tags_round_trip() {
        for tag in 0..18u16 {
            let t = ColumnType::try_from(tag).expect("tag is assigned");
            assert_eq!(tag, u16::from(t));
        }

        assert!(ColumnType::try_from(TAG_BLOB).is_err());
        assert!(ColumnType::try_from(TAG_OBJECT).is_err());
        assert!(ColumnType::try_from(999).is_err());
    }

    #[test]
    fn column_type_names_round_trip() -> crate::Result<()> {
        for tag in 0..18u16 {
            let t = ColumnType::try_from(tag).expect("tag is assigned");
            assert_eq!(t, ColumnType::from_schema_name(t.schema_name())?);
        }
        Ok(())
    }

    #[test]
    fn blob_and_object_are_rejected() {
        assert!(matches!(
            ColumnType::from_schema_name("BLOB"),
            Err(crate::Error::Unsupported(_))
        ));
        assert!(matches!(
            ColumnType::from_schema_name("object"),
            Err(crate::Error::Unsupported(_))
        ));
    }

    #[test]
    fn encoded_cost_includes_length_prefix() {
        let s = Column::new("name", ColumnType::String).with_width(32);
        assert_eq!(2 + 2 + 32, s.encoded_cost());

        let i = Column::new("id", ColumnType::Int64);
        assert_eq!(2 + 8, i.encoded_cost());

        let d = Column::decimal("amount", 18, 2);
        assert_eq!(2, d.precision);
        assert_eq!(2 + 2 + d.width, d.encoded_cost());
    }

    #[test]
    fn names_are_normalized() {
        let c = Column::new("UserName", ColumnType::String).with_width(8);
        assert_eq!("username", c.name);
    }
}
