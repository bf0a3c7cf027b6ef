//! Compiled path templates.
//!
//! Matching is linear and never backtracks: the request path is split on `/`
//! and compared pairwise with the template's segments. A greedy `path`
//! segment, which must be last, swallows every remaining part.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use super::segment::Segment;
use crate::context::RouteParams;

/// Configuration errors raised while compiling a route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("path `{path}` must start with `/`")]
    NotAbsolute { path: String },

    #[error("invalid variable segment `{segment}`")]
    InvalidVariable { segment: String },

    #[error("unknown segment type `{kind}` in `{segment}`")]
    UnknownType { segment: String, kind: String },

    #[error("only `datetime` segments accept a format, found one in `{segment}`")]
    UnexpectedFormat { segment: String },

    #[error("literal segment `{segment}` contains `{{` or `}}`")]
    InvalidLiteral { segment: String },

    #[error("greedy segment `{segment}` must be the last segment of the pattern")]
    PathNotLast { segment: String },

    #[error("variable `{name}` appears more than once")]
    DuplicateName { name: String },
}

/// An immutable, compiled route pattern such as `/users/{id:int}/files/{rest:path}`.
///
/// # Examples
///
/// ```
/// use switchyard::router::PathTemplate;
///
/// let template = PathTemplate::parse("/files/{rest:path}").unwrap();
/// let params = template.matches("/files/a/b/c", false).unwrap().unwrap();
/// assert_eq!(params.get_str("rest"), Some("a/b/c"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PathTemplate {
    pattern: String,
    segments: Vec<Segment>,
    ends_with_slash: bool,
}

impl PathTemplate {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern is not absolute, contains a
    /// malformed or unknown-typed variable, repeats a variable name, or places
    /// a `path` segment anywhere but last.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let Some(body) = pattern.strip_prefix('/') else {
            return Err(PatternError::NotAbsolute {
                path: pattern.to_owned(),
            });
        };

        let (body, ends_with_slash) = match body.strip_suffix('/') {
            Some(trimmed) => (trimmed, true),
            None => (body, false),
        };

        let segments = body
            .split('/')
            .map(Segment::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let mut names = HashSet::new();
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_greedy() && index + 1 != segments.len() {
                return Err(PatternError::PathNotLast {
                    segment: body.split('/').nth(index).unwrap_or_default().to_owned(),
                });
            }
            if let Some(name) = segment.variable_name() {
                if !names.insert(name) {
                    return Err(PatternError::DuplicateName {
                        name: name.to_owned(),
                    });
                }
            }
        }

        Ok(Self {
            pattern: pattern.to_owned(),
            segments,
            ends_with_slash,
        })
    }

    /// The pattern this template was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern ends with `/`.
    pub fn ends_with_slash(&self) -> bool {
        self.ends_with_slash
    }

    /// Matches a concrete request path against this template.
    ///
    /// Returns `Ok(Some(params))` on a match and `Ok(None)` otherwise. Literal
    /// segments compare exactly, or ASCII/Unicode case-insensitively when
    /// `ignore_case` is set; variable segments run their converter, and a
    /// value that fails to convert is simply a non-match.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::NotAbsolute`] if `path` does not start with `/`.
    pub fn matches(&self, path: &str, ignore_case: bool) -> Result<Option<RouteParams>, PatternError> {
        let Some(mut rest) = path.strip_prefix('/') else {
            return Err(PatternError::NotAbsolute {
                path: path.to_owned(),
            });
        };

        let greedy_tail = self.segments.last().is_some_and(Segment::is_greedy);

        // Trailing-slash reconciliation; a greedy tail keeps the slash.
        if !greedy_tail {
            match rest.strip_suffix('/') {
                Some(trimmed) if self.ends_with_slash => rest = trimmed,
                Some(_) => return Ok(None),
                None if self.ends_with_slash => return Ok(None),
                None => {}
            }
        } else if self.ends_with_slash && !rest.ends_with('/') {
            return Ok(None);
        }

        let mut parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < self.segments.len() {
            return Ok(None);
        }

        let mut params = RouteParams::new();

        if parts.len() > self.segments.len() {
            let index = self.segments.len() - 1;
            let Some(Segment::Variable { name, converter }) =
                self.segments.last().filter(|s| s.is_greedy())
            else {
                return Ok(None);
            };
            let joined = parts[index..].join("/");
            let Some(value) = decode(&joined).and_then(|d| converter.convert(&d)) else {
                return Ok(None);
            };
            params.insert(name.clone(), value);
            parts.truncate(index);
        }

        for (part, segment) in parts.iter().zip(&self.segments) {
            let Some(decoded) = decode(part) else {
                return Ok(None);
            };
            match segment {
                Segment::Literal(literal) => {
                    if !literal_eq(literal, &decoded, ignore_case) {
                        return Ok(None);
                    }
                }
                Segment::Variable { name, converter } => match converter.convert(&decoded) {
                    Some(value) => params.insert(name.clone(), value),
                    None => return Ok(None),
                },
            }
        }

        Ok(Some(params))
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn decode(part: &str) -> Option<Cow<'_, str>> {
    urlencoding::decode(part).ok()
}

fn literal_eq(literal: &str, part: &str, ignore_case: bool) -> bool {
    if ignore_case {
        literal
            .chars()
            .flat_map(char::to_lowercase)
            .eq(part.chars().flat_map(char::to_lowercase))
    } else {
        literal == part
    }
}
