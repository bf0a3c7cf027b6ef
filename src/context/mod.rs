//! Per-request context: the value every middleware and handler receives.
//!
//! A [`Context`] bundles three things with very different lifetimes:
//!
//! - the parsed inbound [`Request`] (owned by this request),
//! - the [`RouteParams`] extracted by the matched path template (fresh per match),
//! - a handle to the server-wide [`ServerState`] (shared by every request for the
//!   lifetime of the server).
//!
//! Middleware can hand data to downstream layers through the per-request
//! [`Extensions`] map.

mod state;

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use chrono::NaiveDateTime;

use crate::Request;

pub use state::ServerState;

/// Type-erased request extensions map: used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A typed value captured by a variable path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// `{name}` or `{name:string}`.
    String(String),
    /// `{name:int}`.
    Int(i64),
    /// `{name:double}`.
    Double(f64),
    /// `{name:datetime}` or `{name:datetime:format}`.
    DateTime(NaiveDateTime),
    /// `{name:path}`: the greedy remainder of the path, slashes included.
    Path(String),
}

impl ParamValue {
    /// Returns the textual value of `string` and `path` parameters.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Path(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// Path parameters extracted from the matched route, keyed by variable name.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct RouteParams {
    map: HashMap<String, ParamValue>,
}

impl RouteParams {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value for `name`
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.map.insert(name.into(), value);
    }

    /// Get a typed value by variable name
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.map.get(name)
    }

    /// Shorthand for `string` and `path` parameters.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    /// Shorthand for `int` parameters.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    /// Shorthand for `double` parameters.
    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_double()
    }

    /// Shorthand for `datetime` parameters.
    pub fn get_datetime(&self, name: &str) -> Option<NaiveDateTime> {
        self.get(name)?.as_datetime()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The per-request value passed through the middleware chain to the handler.
pub struct Context {
    request: Request,
    params: RouteParams,
    state: ServerState,
    extensions: Extensions,
}

impl Context {
    /// Bundle a parsed request with its route parameters and the server state.
    pub fn new(request: Request, params: RouteParams, state: ServerState) -> Self {
        Self {
            request,
            params,
            state,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable access for middleware that rewrites the request (e.g. headers)
    /// before calling the continuation.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn params(&self) -> &RouteParams {
        &self.params
    }

    /// The server-wide shared state. Access is not serialized by the server.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Decode the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn extensions_round_trip_by_type() {
        #[derive(Debug, PartialEq)]
        struct UserId(u32);

        let mut ext = Extensions::new();
        ext.insert(UserId(9));
        ext.insert("label");
        assert_eq!(ext.get::<UserId>(), Some(&UserId(9)));
        assert_eq!(ext.get::<&str>(), Some(&"label"));
        assert_eq!(ext.remove::<UserId>(), Some(UserId(9)));
        assert!(ext.get::<UserId>().is_none());
    }

    #[test]
    fn typed_param_accessors() {
        let mut params = RouteParams::new();
        params.insert("name", ParamValue::String("ada".into()));
        params.insert("age", ParamValue::Int(36));
        params.insert("ratio", ParamValue::Double(0.5));

        assert_eq!(params.get_str("name"), Some("ada"));
        assert_eq!(params.get_int("age"), Some(36));
        assert_eq!(params.get_double("ratio"), Some(0.5));
        // Wrong type is not coerced.
        assert_eq!(params.get_int("name"), None);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn param_display() {
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(13, 5, 0)
            .unwrap();
        assert_eq!(ParamValue::DateTime(dt).to_string(), "2024-02-29T13:05:00");
        assert_eq!(ParamValue::Int(-3).to_string(), "-3");
        assert_eq!(ParamValue::Path("a/b".into()).to_string(), "a/b");
    }

    #[test]
    fn context_decodes_json_body() {
        #[derive(Deserialize)]
        struct Payload {
            name: String,
        }

        let req = request(
            "POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 14\r\n\r\n{\"name\":\"bob\"}",
        );
        let ctx = Context::new(req, RouteParams::new(), ServerState::new());
        let payload: Payload = ctx.json().unwrap();
        assert_eq!(payload.name, "bob");
    }
}
