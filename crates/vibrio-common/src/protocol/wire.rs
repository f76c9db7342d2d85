//! Wire-level call and response types exchanged with the engine.

use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Path of the engine's readiness endpoint.
pub const STATUS_PATH: &str = "/api/status";

static BOUNDARY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fully encoded HTTP call against the engine, relative to its base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<CallBody>,
    /// Safe to resend after a connection failure or timeout.
    pub idempotent: bool,
    /// Beatmap addressed by id, used to map a 404 onto `BeatmapNotFound`.
    pub beatmap_id: Option<u32>,
}

impl EngineCall {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            idempotent: true,
            beatmap_id: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Calculation uploads have no side effects and are marked idempotent.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: CallBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn for_beatmap(mut self, beatmap_id: u32) -> Self {
        self.beatmap_id = Some(beatmap_id);
        self
    }

    pub fn status() -> Self {
        Self::get(STATUS_PATH)
    }

    pub fn beatmap_status(beatmap_id: u32) -> Self {
        Self::get(format!("/api/beatmaps/{}/status", beatmap_id)).for_beatmap(beatmap_id)
    }

    pub fn beatmap(beatmap_id: u32) -> Self {
        Self::get(format!("/api/beatmaps/{}", beatmap_id)).for_beatmap(beatmap_id)
    }

    pub fn clear_cache() -> Self {
        Self::delete("/api/beatmaps/cache")
    }

    /// Path plus percent-encoded query string.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        format!("{}?{}", self.path, query.join("&"))
    }

    /// First query value for `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Request body with its content type.
#[derive(Debug, Clone, PartialEq)]
pub struct CallBody {
    pub content_type: String,
    pub bytes: Bytes,
}

/// Builder for `multipart/form-data` file uploads.
///
/// The boundary is chosen when the body is built and never occurs inside any
/// part's content.
#[derive(Debug, Clone)]
pub struct Multipart {
    token: String,
    parts: Vec<FilePart>,
}

#[derive(Debug, Clone)]
struct FilePart {
    name: String,
    filename: String,
    content: Bytes,
}

impl Multipart {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let counter = BOUNDARY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::with_token(format!("{:016x}{:08x}", nanos, counter))
    }

    pub(crate) fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            parts: Vec::new(),
        }
    }

    /// Adds a file part. `name` and `filename` are quoted as given and must
    /// not contain `"` or line breaks.
    pub fn file(mut self, name: &str, filename: &str, content: Bytes) -> Self {
        self.parts.push(FilePart {
            name: name.to_string(),
            filename: filename.to_string(),
            content,
        });
        self
    }

    fn boundary(&self) -> String {
        let mut boundary = format!("vibrio-{}", self.token);
        let mut salt = 0u32;
        while self
            .parts
            .iter()
            .any(|part| contains(&part.content, boundary.as_bytes()))
        {
            salt += 1;
            boundary = format!("vibrio-{}-{}", self.token, salt);
        }
        boundary
    }

    pub fn into_body(self) -> CallBody {
        let boundary = self.boundary();
        let mut body = Vec::new();
        for part in &self.parts {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    part.name, part.filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(&part.content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        CallBody {
            content_type: format!("multipart/form-data; boundary={}", boundary),
            bytes: Bytes::from(body),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

/// Status and fully read body of an engine response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body as text, lossily decoded, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}
