//! PostgreSQL type identifiers and text-format value decoding.
//!
//! The simple query protocol always returns values in text format, so every
//! decoder here parses the server's textual output for its type.
//! Reference: https://www.postgresql.org/docs/current/datatype.html

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::ser::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // Pseudo-type for untyped literals (`SELECT 'x'`)
    pub const UNKNOWN: Oid = Oid(705);

    // Money
    pub const MONEY: Oid = Oid(790);

    // String types
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // Network types
    pub const INET: Oid = Oid(869);
    pub const CIDR: Oid = Oid(650);
    pub const MACADDR: Oid = Oid(829);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // Array types (some common ones)
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Name of a built-in type, as it appears in `pg_type.typname`.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            16 => "bool",
            17 => "bytea",
            18 => "char",
            19 => "name",
            20 => "int8",
            21 => "int2",
            22 => "int2vector",
            23 => "int4",
            24 => "regproc",
            25 => "text",
            26 => "oid",
            27 => "tid",
            28 => "xid",
            29 => "cid",
            30 => "oidvector",
            114 => "json",
            142 => "xml",
            143 => "_xml",
            194 => "pg_node_tree",
            199 => "_json",
            600 => "point",
            601 => "lseg",
            602 => "path",
            603 => "box",
            604 => "polygon",
            628 => "line",
            650 => "cidr",
            651 => "_cidr",
            700 => "float4",
            701 => "float8",
            705 => "unknown",
            718 => "circle",
            774 => "macaddr8",
            790 => "money",
            791 => "_money",
            829 => "macaddr",
            869 => "inet",
            1000 => "_bool",
            1001 => "_bytea",
            1002 => "_char",
            1003 => "_name",
            1005 => "_int2",
            1007 => "_int4",
            1009 => "_text",
            1014 => "_bpchar",
            1015 => "_varchar",
            1016 => "_int8",
            1021 => "_float4",
            1022 => "_float8",
            1028 => "_oid",
            1033 => "aclitem",
            1040 => "_macaddr",
            1041 => "_inet",
            1042 => "bpchar",
            1043 => "varchar",
            1082 => "date",
            1083 => "time",
            1114 => "timestamp",
            1115 => "_timestamp",
            1182 => "_date",
            1183 => "_time",
            1184 => "timestamptz",
            1185 => "_timestamptz",
            1186 => "interval",
            1187 => "_interval",
            1231 => "_numeric",
            1266 => "timetz",
            1270 => "_timetz",
            1560 => "bit",
            1561 => "_bit",
            1562 => "varbit",
            1563 => "_varbit",
            1700 => "numeric",
            1790 => "refcursor",
            2202 => "regprocedure",
            2205 => "regclass",
            2206 => "regtype",
            2249 => "record",
            2275 => "cstring",
            2276 => "any",
            2277 => "anyarray",
            2278 => "void",
            2279 => "trigger",
            2950 => "uuid",
            2951 => "_uuid",
            3220 => "pg_lsn",
            3614 => "tsvector",
            3615 => "tsquery",
            3734 => "regconfig",
            3802 => "jsonb",
            3807 => "_jsonb",
            3904 => "int4range",
            3906 => "numrange",
            3908 => "tsrange",
            3910 => "tstzrange",
            3912 => "daterange",
            3926 => "int8range",
            4072 => "jsonpath",
            4089 => "regnamespace",
            4096 => "regrole",
            _ => return None,
        };
        Some(name)
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary-precision decimal, kept exactly as the server printed it.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Json(JsonValue),
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) | PgValue::Numeric(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer variant widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            PgValue::Int2(v) => Some(v as i64),
            PgValue::Int4(v) => Some(v as i64),
            PgValue::Int8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            PgValue::Float4(v) => Some(v as f64),
            PgValue::Float8(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PgValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Decode a value from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::Decode(format!("invalid UTF-8 for {}: {}", type_label(oid), e)))?;

        match oid {
            Oid::BOOL => match text {
                "t" | "true" => Ok(PgValue::Bool(true)),
                "f" | "false" => Ok(PgValue::Bool(false)),
                _ => Err(invalid(oid, text)),
            },

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|_| invalid(oid, text)),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|_| invalid(oid, text)),

            // oid is unsigned 32-bit, widened so it always fits.
            Oid::INT8 | Oid::OID_TYPE => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|_| invalid(oid, text)),

            Oid::FLOAT4 => parse_float(text)
                .map(|v| PgValue::Float4(v as f32))
                .ok_or_else(|| invalid(oid, text)),

            Oid::FLOAT8 => parse_float(text)
                .map(PgValue::Float8)
                .ok_or_else(|| invalid(oid, text)),

            Oid::NUMERIC => {
                if is_numeric_literal(text) {
                    Ok(PgValue::Numeric(text.to_string()))
                } else {
                    Err(invalid(oid, text))
                }
            }

            Oid::BYTEA => decode_bytea(text)
                .map(PgValue::Bytea)
                .ok_or_else(|| invalid(oid, text)),

            Oid::UUID => Uuid::parse_str(text)
                .map(PgValue::Uuid)
                .map_err(|_| invalid(oid, text)),

            Oid::DATE => match text {
                "infinity" | "-infinity" => Ok(PgValue::Text(text.to_string())),
                _ => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(PgValue::Date)
                    .map_err(|_| invalid(oid, text)),
            },

            Oid::TIME => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map(PgValue::Time)
                .map_err(|_| invalid(oid, text)),

            Oid::TIMESTAMP => match text {
                "infinity" | "-infinity" => Ok(PgValue::Text(text.to_string())),
                _ => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(PgValue::Timestamp)
                    .map_err(|_| invalid(oid, text)),
            },

            // Server prints the offset as `+HH`, `+HH:MM` or `+HH:MM:SS`.
            Oid::TIMESTAMPTZ => match text {
                "infinity" | "-infinity" => Ok(PgValue::Text(text.to_string())),
                _ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(PgValue::TimestampTz)
                    .map_err(|_| invalid(oid, text)),
            },

            Oid::JSON | Oid::JSONB => serde_json::from_str(text)
                .map(PgValue::Json)
                .map_err(|e| PgError::Decode(format!("invalid {}: {}", type_label(oid), e))),

            // Text types, and the default for everything without a dedicated
            // decoder (intervals, network types, arrays, enums, ...).
            _ => Ok(PgValue::Text(text.to_string())),
        }
    }
}

impl Serialize for PgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PgValue::Null => serializer.serialize_none(),
            PgValue::Bool(v) => serializer.serialize_bool(*v),
            PgValue::Int2(v) => serializer.serialize_i16(*v),
            PgValue::Int4(v) => serializer.serialize_i32(*v),
            PgValue::Int8(v) => serializer.serialize_i64(*v),
            PgValue::Float4(v) => serializer.serialize_f32(*v),
            PgValue::Float8(v) => serializer.serialize_f64(*v),
            PgValue::Numeric(s) | PgValue::Text(s) => serializer.serialize_str(s),
            PgValue::Bytea(b) => serializer.serialize_bytes(b),
            PgValue::Uuid(u) => u.serialize(serializer),
            PgValue::Date(d) => d.serialize(serializer),
            PgValue::Time(t) => t.serialize(serializer),
            PgValue::Timestamp(ts) => ts.serialize(serializer),
            PgValue::TimestampTz(ts) => ts.serialize(serializer),
            PgValue::Json(v) => v.serialize(serializer),
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn type_label(oid: Oid) -> String {
    oid.name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("oid {}", oid.0))
}

fn invalid(oid: Oid, text: &str) -> PgError {
    PgError::Decode(format!("invalid {} value: {:?}", type_label(oid), text))
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse::<f64>().ok(),
    }
}

/// Digits with an optional sign, decimal point and exponent, or `NaN`/`Infinity`.
fn is_numeric_literal(text: &str) -> bool {
    if matches!(text, "NaN" | "Infinity" | "-Infinity") {
        return true;
    }
    let digits = text.strip_prefix(&['-', '+'][..]).unwrap_or(text);
    let (mantissa, exponent) = match digits.split_once(&['e', 'E'][..]) {
        Some((m, e)) => (m, Some(e)),
        None => (digits, None),
    };
    let mantissa_ok = !mantissa.is_empty()
        && mantissa.chars().filter(|&c| c == '.').count() <= 1
        && mantissa.chars().any(|c| c.is_ascii_digit())
        && mantissa.chars().all(|c| c.is_ascii_digit() || c == '.');
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(&['-', '+'][..]).unwrap_or(e);
        !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
    });
    mantissa_ok && exponent_ok
}

/// bytea output: hex format (`\x0a0b`, the default since 9.0) or the legacy
/// escape format (`\\`, `\ooo` octal escapes, everything else literal).
fn decode_bytea(text: &str) -> Option<Vec<u8>> {
    if let Some(hex) = text.strip_prefix("\\x") {
        if !hex.is_ascii() || hex.len() % 2 != 0 {
            return None;
        }
        return (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect();
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let octal = text.get(i + 1..i + 4)?;
            out.push(u8::from_str_radix(octal, 8).ok()?);
            i += 4;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_oid_names() {
        assert_eq!(Oid::INT4.name(), Some("int4"));
        assert_eq!(Oid::TIMESTAMPTZ.name(), Some("timestamptz"));
        assert_eq!(Oid::UNKNOWN.name(), Some("unknown"));
        assert_eq!(Oid(16_500).name(), None);
    }

    #[test]
    fn test_scalar_decoding() {
        assert_eq!(PgValue::decode_text(Oid::BOOL, b"t").unwrap(), PgValue::Bool(true));
        assert_eq!(PgValue::decode_text(Oid::BOOL, b"f").unwrap(), PgValue::Bool(false));
        assert_eq!(PgValue::decode_text(Oid::INT2, b"-7").unwrap(), PgValue::Int2(-7));
        assert_eq!(PgValue::decode_text(Oid::INT4, b"1").unwrap(), PgValue::Int4(1));
        assert_eq!(
            PgValue::decode_text(Oid::INT8, b"9223372036854775807").unwrap(),
            PgValue::Int8(i64::MAX)
        );
        assert_eq!(
            PgValue::decode_text(Oid::OID_TYPE, b"4294967295").unwrap(),
            PgValue::Int8(4_294_967_295)
        );
        assert_eq!(
            PgValue::decode_text(Oid::TEXT, b"hello").unwrap(),
            PgValue::Text("hello".to_string())
        );
        assert_eq!(
            PgValue::decode_text(Oid::UNKNOWN, b"x").unwrap(),
            PgValue::Text("x".to_string())
        );
    }

    #[test]
    fn test_float_special_values() {
        match PgValue::decode_text(Oid::FLOAT8, b"NaN").unwrap() {
            PgValue::Float8(v) => assert!(v.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            PgValue::decode_text(Oid::FLOAT8, b"-Infinity").unwrap(),
            PgValue::Float8(f64::NEG_INFINITY)
        );
        assert_eq!(
            PgValue::decode_text(Oid::FLOAT4, b"1.5").unwrap(),
            PgValue::Float4(1.5)
        );
    }

    #[test]
    fn test_numeric_keeps_precision() {
        assert_eq!(
            PgValue::decode_text(Oid::NUMERIC, b"12345678901234567890.000000001").unwrap(),
            PgValue::Numeric("12345678901234567890.000000001".to_string())
        );
        assert!(PgValue::decode_text(Oid::NUMERIC, b"1e-5").is_ok());
        assert!(PgValue::decode_text(Oid::NUMERIC, b"1.2.3").is_err());
    }

    #[test]
    fn test_invalid_integer_is_decode_error() {
        let err = PgValue::decode_text(Oid::INT4, b"abc").unwrap_err();
        assert!(matches!(err, PgError::Decode(_)));
        assert!(err.to_string().contains("int4"));
    }

    #[test]
    fn test_bytea_formats() {
        assert_eq!(
            PgValue::decode_text(Oid::BYTEA, b"\\xdeadbeef").unwrap(),
            PgValue::Bytea(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(
            PgValue::decode_text(Oid::BYTEA, b"a\\\\b\\001").unwrap(),
            PgValue::Bytea(vec![b'a', b'\\', b'b', 1])
        );
        assert!(PgValue::decode_text(Oid::BYTEA, b"\\xabc").is_err());
    }

    #[test]
    fn test_uuid_decoding() {
        let value =
            PgValue::decode_text(Oid::UUID, b"550e8400-e29b-41d4-a716-446655440000").unwrap();
        match value {
            PgValue::Uuid(u) => assert_eq!(u.to_string(), "550e8400-e29b-41d4-a716-446655440000"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_datetime_decoding() {
        match PgValue::decode_text(Oid::DATE, b"2024-02-29").unwrap() {
            PgValue::Date(d) => assert_eq!((d.year(), d.month(), d.day()), (2024, 2, 29)),
            other => panic!("unexpected {:?}", other),
        }

        match PgValue::decode_text(Oid::TIMESTAMP, b"2024-01-02 03:04:05.123456").unwrap() {
            PgValue::Timestamp(ts) => {
                assert_eq!(ts.hour(), 3);
                assert_eq!(ts.nanosecond(), 123_456_000);
            }
            other => panic!("unexpected {:?}", other),
        }

        match PgValue::decode_text(Oid::TIMESTAMPTZ, b"2024-01-02 03:04:05+02").unwrap() {
            PgValue::TimestampTz(ts) => assert_eq!(ts.offset().local_minus_utc(), 7200),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"infinity").unwrap(),
            PgValue::Text("infinity".to_string())
        );
    }

    #[test]
    fn test_json_decoding() {
        let value = PgValue::decode_text(Oid::JSONB, br#"{"a": [1, 2]}"#).unwrap();
        assert_eq!(value, PgValue::Json(serde_json::json!({"a": [1, 2]})));
    }

    #[test]
    fn test_unknown_types_fall_back_to_text() {
        assert_eq!(
            PgValue::decode_text(Oid::INTERVAL, b"1 day 02:00:00").unwrap(),
            PgValue::Text("1 day 02:00:00".to_string())
        );
        assert_eq!(
            PgValue::decode_text(Oid(16_500), b"happy").unwrap(),
            PgValue::Text("happy".to_string())
        );
    }

    #[test]
    fn test_value_serializes_to_json() {
        let json = serde_json::to_value(PgValue::Int4(7)).unwrap();
        assert_eq!(json, serde_json::json!(7));
        assert_eq!(serde_json::to_value(PgValue::Null).unwrap(), JsonValue::Null);
    }
}
