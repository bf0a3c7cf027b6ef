//! Path segments and their typed converters.
//!
//! A route pattern is split on `/` into segments. Each segment is either a
//! literal or a `{name}`, `{name:type}` or `{name:type:format}` variable.
//! Conversion is a fallible parse: a value that does not convert simply fails
//! the match for that route.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use super::PatternError;
use crate::context::ParamValue;

/// Formats tried, in order, for `{name:datetime}` without an explicit format.
const DEFAULT_DATETIME_FORMATS: [&str; 3] =
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// The converter attached to a variable segment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Converter {
    String,
    Int,
    Double,
    /// Holds the chrono format translated from the pattern, if one was given.
    DateTime(Option<String>),
    Path,
}

impl Converter {
    fn from_kind(segment: &str, kind: &str, format: Option<&str>) -> Result<Self, PatternError> {
        let converter = match kind {
            "string" => Self::String,
            "int" => Self::Int,
            "double" => Self::Double,
            "datetime" => return Ok(Self::DateTime(format.map(translate_format))),
            "path" => Self::Path,
            other => {
                return Err(PatternError::UnknownType {
                    segment: segment.to_owned(),
                    kind: other.to_owned(),
                });
            }
        };

        if format.is_some() {
            return Err(PatternError::UnexpectedFormat {
                segment: segment.to_owned(),
            });
        }
        Ok(converter)
    }

    /// Converts one decoded path part, or returns `None` when it does not parse.
    pub(crate) fn convert(&self, raw: &str) -> Option<ParamValue> {
        match self {
            Self::String => Some(ParamValue::String(raw.to_owned())),
            Self::Path => Some(ParamValue::Path(raw.to_owned())),
            Self::Int => raw.parse().ok().map(ParamValue::Int),
            Self::Double => raw.parse().ok().map(ParamValue::Double),
            Self::DateTime(format) => parse_datetime(raw, format.as_deref()).map(ParamValue::DateTime),
        }
    }
}

/// One compiled `/`-delimited piece of a path template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Literal(String),
    Variable { name: String, converter: Converter },
}

impl Segment {
    /// Compiles a single segment of a route pattern.
    pub(crate) fn parse(segment: &str) -> Result<Self, PatternError> {
        let opens = segment.starts_with('{');
        let closes = segment.ends_with('}');

        if opens && closes && segment.len() >= 2 {
            let inner = &segment[1..segment.len() - 1];
            let mut parts = inner.splitn(3, ':');
            let name = parts.next().unwrap_or_default();
            let kind = parts.next().unwrap_or("string");
            let format = parts.next();

            if name.is_empty() || name.contains(['{', '}']) || kind.contains(['{', '}']) {
                return Err(PatternError::InvalidVariable {
                    segment: segment.to_owned(),
                });
            }

            let converter = Converter::from_kind(segment, kind, format)?;
            return Ok(Self::Variable {
                name: name.to_owned(),
                converter,
            });
        }

        if opens || closes {
            return Err(PatternError::InvalidVariable {
                segment: segment.to_owned(),
            });
        }
        if segment.contains(['{', '}']) {
            return Err(PatternError::InvalidLiteral {
                segment: segment.to_owned(),
            });
        }

        Ok(Self::Literal(segment.to_owned()))
    }

    pub(crate) fn is_greedy(&self) -> bool {
        matches!(
            self,
            Self::Variable {
                converter: Converter::Path,
                ..
            }
        )
    }

    pub(crate) fn variable_name(&self) -> Option<&str> {
        match self {
            Self::Variable { name, .. } => Some(name),
            Self::Literal(_) => None,
        }
    }
}

fn parse_datetime(raw: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    match format {
        Some(format) => NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(raw, format)
                    .ok()
                    .map(|date| date.and_time(NaiveTime::MIN))
            }),
        None => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.naive_local())
            .or_else(|| {
                DEFAULT_DATETIME_FORMATS
                    .iter()
                    .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            })
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .map(|date| date.and_time(NaiveTime::MIN))
            }),
    }
}

/// Translates a custom date/time pattern (`yyyyMMdd`, `dd-MM-yyyy HH:mm`, ...)
/// into a chrono format string. Unrecognized characters are literals; text in
/// single quotes is copied verbatim.
fn translate_format(pattern: &str) -> String {
    const TOKENS: [(&str, &str); 17] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MMMM", "%B"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("M", "%m"),
        ("dd", "%d"),
        ("d", "%d"),
        ("HH", "%H"),
        ("H", "%H"),
        ("hh", "%I"),
        ("h", "%I"),
        ("mm", "%M"),
        ("m", "%M"),
        ("ss", "%S"),
        ("s", "%S"),
        ("tt", "%p"),
    ];

    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;

    'outer: while let Some(c) = rest.chars().next() {
        if c == '\'' {
            let quoted = &rest[1..];
            let end = quoted.find('\'').unwrap_or(quoted.len());
            push_literal(&mut out, &quoted[..end]);
            rest = quoted.get(end + 1..).unwrap_or("");
            continue;
        }
        if let Some(digits) = rest.strip_prefix("fff") {
            out.push_str("%3f");
            rest = digits;
            continue;
        }
        for (token, chrono) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(chrono);
                rest = tail;
                continue 'outer;
            }
        }
        push_literal(&mut out, &rest[..c.len_utf8()]);
        rest = &rest[c.len_utf8()..];
    }

    out
}

fn push_literal(out: &mut String, literal: &str) {
    for c in literal.chars() {
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(segment: &str) -> Converter {
        match Segment::parse(segment).unwrap() {
            Segment::Variable { converter, .. } => converter,
            other => panic!("expected variable, got {other:?}"),
        }
    }

    #[test]
    fn literal_segment() {
        assert_eq!(Segment::parse("users").unwrap(), Segment::Literal("users".into()));
        assert_eq!(Segment::parse("").unwrap(), Segment::Literal(String::new()));
    }

    #[test]
    fn untyped_variable_is_string() {
        assert_eq!(
            Segment::parse("{name}").unwrap(),
            Segment::Variable {
                name: "name".into(),
                converter: Converter::String
            }
        );
    }

    #[test]
    fn typed_variables() {
        assert_eq!(variable("{id:int}"), Converter::Int);
        assert_eq!(variable("{x:double}"), Converter::Double);
        assert_eq!(variable("{rest:path}"), Converter::Path);
        assert_eq!(variable("{when:datetime}"), Converter::DateTime(None));
        assert_eq!(
            variable("{day:datetime:yyyyMMdd}"),
            Converter::DateTime(Some("%Y%m%d".into()))
        );
    }

    #[test]
    fn malformed_segments_are_rejected() {
        assert!(matches!(
            Segment::parse("{id:uuid}"),
            Err(PatternError::UnknownType { kind, .. }) if kind == "uuid"
        ));
        assert!(matches!(Segment::parse("{id"), Err(PatternError::InvalidVariable { .. })));
        assert!(matches!(Segment::parse("id}"), Err(PatternError::InvalidVariable { .. })));
        assert!(matches!(Segment::parse("{}"), Err(PatternError::InvalidVariable { .. })));
        assert!(matches!(Segment::parse("a{b"), Err(PatternError::InvalidLiteral { .. })));
        assert!(matches!(
            Segment::parse("{id:int:000}"),
            Err(PatternError::UnexpectedFormat { .. })
        ));
    }

    #[test]
    fn int_conversion_is_fallible() {
        assert_eq!(Converter::Int.convert("42"), Some(ParamValue::Int(42)));
        assert_eq!(Converter::Int.convert("-7"), Some(ParamValue::Int(-7)));
        assert_eq!(Converter::Int.convert("4x2"), None);
        assert_eq!(Converter::Int.convert(""), None);
        assert_eq!(Converter::Double.convert("2.5"), Some(ParamValue::Double(2.5)));
        assert_eq!(Converter::Double.convert("two"), None);
    }

    #[test]
    fn datetime_with_custom_format() {
        let converter = variable("{day:datetime:yyyyMMdd}");
        let expected = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_time(NaiveTime::MIN);
        assert_eq!(converter.convert("20231231"), Some(ParamValue::DateTime(expected)));
        assert_eq!(converter.convert("2023-12-31"), None);
    }

    #[test]
    fn datetime_format_may_contain_colons() {
        let converter = variable("{at:datetime:yyyy-MM-dd HH:mm}");
        let expected = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(
            converter.convert("2021-06-01 09:30"),
            Some(ParamValue::DateTime(expected))
        );
    }

    #[test]
    fn datetime_default_formats() {
        let converter = Converter::DateTime(None);
        assert!(converter.convert("2020-01-02").is_some());
        assert!(converter.convert("2020-01-02T03:04:05").is_some());
        assert!(converter.convert("2020-01-02T03:04:05Z").is_some());
        assert!(converter.convert("yesterday").is_none());
    }

    #[test]
    fn format_translation() {
        assert_eq!(translate_format("dd/MM/yyyy"), "%d/%m/%Y");
        assert_eq!(translate_format("HH:mm:ss.fff"), "%H:%M:%S.%3f");
        assert_eq!(translate_format("yyyy'T'HH"), "%YT%H");
        assert_eq!(translate_format("100%"), "100%%");
    }
}
