//! Request parameter parsing and response metadata headers.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use warpgrid_alloc::{ApiError, QueryMeta, QueryOptions, WriteRequest};

/// Header carrying the caller's token.
pub const TOKEN_HEADER: &str = "x-warpgrid-token";
pub const INDEX_HEADER: &str = "x-warpgrid-index";
pub const LAST_CONTACT_HEADER: &str = "x-warpgrid-lastcontact";
pub const KNOWN_LEADER_HEADER: &str = "x-warpgrid-knownleader";

/// Query string and headers of one request.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    query: HashMap<String, String>,
    token: String,
}

impl RequestParams {
    pub fn new(query: HashMap<String, String>, headers: &HeaderMap) -> Self {
        let header_token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let token = if header_token.is_empty() {
            query.get("token").cloned().unwrap_or_default()
        } else {
            header_token.to_string()
        };
        Self { query, token }
    }

    /// A single query parameter, empty when absent.
    pub fn get(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Token from the header, or the `token` query parameter.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Read options. Malformed `index`, `wait` or `timeout` is a bad request.
    pub fn query_options(&self) -> Result<QueryOptions, ApiError> {
        let min_query_index = match self.query.get("index") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request("Failed to parse index"))?,
            None => 0,
        };
        Ok(QueryOptions {
            region: self.get("region").to_string(),
            namespace: self.get("namespace").to_string(),
            prefix: self.get("prefix").to_string(),
            allow_stale: self
                .query
                .get("stale")
                .is_some_and(|v| v != "false"),
            min_query_index,
            max_query_time_ms: self.duration_ms("wait")?,
            timeout_ms: self.duration_ms("timeout")?,
            auth_token: self.token.clone(),
        })
    }

    /// Write options.
    pub fn write_request(&self) -> Result<WriteRequest, ApiError> {
        Ok(WriteRequest {
            region: self.get("region").to_string(),
            namespace: self.get("namespace").to_string(),
            auth_token: self.token.clone(),
            idempotency_token: self.get("idempotency_token").to_string(),
            timeout_ms: self.duration_ms("timeout")?,
        })
    }

    fn duration_ms(&self, key: &str) -> Result<u64, ApiError> {
        match self.query.get(key) {
            Some(raw) => parse_duration(raw)
                .and_then(|d| u64::try_from(d.as_millis()).ok())
                .ok_or_else(|| ApiError::bad_request(format!("Failed to parse {key}"))),
            None => Ok(0),
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
///
/// Returns `None` for malformed or overflowing values.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Set the query metadata headers.
pub fn set_meta(headers: &mut HeaderMap, meta: &QueryMeta) {
    set_index(headers, meta.index);
    headers.insert(LAST_CONTACT_HEADER, HeaderValue::from(meta.last_contact_ms));
    headers.insert(
        KNOWN_LEADER_HEADER,
        HeaderValue::from_static(if meta.known_leader { "true" } else { "false" }),
    );
}

pub fn set_index(headers: &mut HeaderMap, index: u64) {
    headers.insert(INDEX_HEADER, HeaderValue::from(index));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)], headers: HeaderMap) -> RequestParams {
        let query = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestParams::new(query, &headers)
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("307445734561825861m"), None);
    }

    #[test]
    fn query_options_from_params() {
        let p = params(
            &[
                ("region", "global"),
                ("namespace", "prod"),
                ("prefix", "ab"),
                ("stale", ""),
                ("index", "42"),
                ("wait", "5s"),
                ("timeout", "250ms"),
            ],
            HeaderMap::new(),
        );
        let opts = p.query_options().unwrap();
        assert_eq!(opts.region, "global");
        assert_eq!(opts.namespace, "prod");
        assert_eq!(opts.prefix, "ab");
        assert!(opts.allow_stale);
        assert_eq!(opts.min_query_index, 42);
        assert_eq!(opts.max_query_time_ms, 5000);
        assert_eq!(opts.timeout_ms, 250);
    }

    #[test]
    fn bad_index_is_bad_request() {
        let p = params(&[("index", "x")], HeaderMap::new());
        let err = p.query_options().unwrap_err();
        assert_eq!(err.code, 400);
    }

    #[test]
    fn overflowing_durations_are_bad_request() {
        for (key, value) in [
            ("timeout", "307445734561825861m"),
            ("wait", "18446744073709551615s"),
        ] {
            let p = params(&[(key, value)], HeaderMap::new());
            let err = p.query_options().unwrap_err();
            assert_eq!(err.code, 400, "{key}={value}");
            assert!(err.message.contains(key));
        }
    }

    #[test]
    fn header_token_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("from-header"));
        let p = params(&[("token", "from-query")], headers);
        assert_eq!(p.token(), "from-header");

        let p = params(&[("token", "from-query")], HeaderMap::new());
        assert_eq!(p.token(), "from-query");
        assert_eq!(p.query_options().unwrap().auth_token, "from-query");
    }

    #[test]
    fn meta_headers_are_set() {
        let mut headers = HeaderMap::new();
        set_meta(
            &mut headers,
            &QueryMeta {
                index: 7,
                last_contact_ms: 12,
                known_leader: true,
            },
        );
        assert_eq!(headers[INDEX_HEADER], "7");
        assert_eq!(headers[LAST_CONTACT_HEADER], "12");
        assert_eq!(headers[KNOWN_LEADER_HEADER], "true");
    }
}
