//! Body classification and decoding.
//!
//! Turns an HTTP message body into a typed [`ParsedBody`]. Classification runs
//! on headers first so that multipart, HTML, streams, known binary formats and
//! oversized bodies are never read. Everything else is decompressed according
//! to `content-encoding`, decoded as UTF-8 and parsed as JSON when possible.
//!
//! Classification never fails: every error degrades to `NOT_JSON`.

use crate::error::ParseError;
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::sync::OnceLock;

pub const DEFAULT_SIZE_LIMIT: usize = 10 * 1024 * 1024;

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Content types that are never decoded as JSON.
static NOT_JSON_TYPES: OnceLock<Vec<Regex>> = OnceLock::new();

fn not_json_types() -> &'static [Regex] {
    NOT_JSON_TYPES.get_or_init(|| {
        [
            r"^image/.*",
            r"^application/(octet-stream|pdf|zip|x-rar-compressed|msword|vnd\.ms-excel|javascript|x-www-form-urlencoded)$",
            r"^application/vnd\.openxmlformats-officedocument\.(wordprocessingml\.document|spreadsheetml\.sheet|presentationml\.presentation)$",
            r"^text/(css|csv|html|xml|plain)$",
            r"^video/mp4$",
            r"^audio/mpeg$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).unwrap())
        .collect()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyType {
    NoBody,
    Multipart,
    Html,
    Stream,
    NotJson,
    TooBig,
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedBody {
    #[serde(rename = "type")]
    pub body_type: BodyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

impl ParsedBody {
    fn no_body() -> Self {
        Self {
            body_type: BodyType::NoBody,
            body: None,
            content_type: None,
            size: Some(0),
        }
    }

    /// The decoded body as JSON, `null` when nothing was decoded.
    pub fn value(&self) -> Value {
        self.body.clone().unwrap_or(Value::Null)
    }
}

/// Header-derived facts shared by every classification branch.
#[derive(Debug, Clone)]
struct Meta {
    content_type: String,
    encoding: Option<String>,
    content_length: Option<u64>,
}

impl Meta {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name| {
            headers
                .get(name)
                .and_then(|v: &hyper::header::HeaderValue| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        Self {
            content_type: header(CONTENT_TYPE).unwrap_or_default(),
            encoding: header(CONTENT_ENCODING).map(|e| e.to_ascii_lowercase()),
            content_length: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        }
    }

    fn result(&self, body_type: BodyType) -> ParsedBody {
        ParsedBody {
            body_type,
            body: None,
            content_type: Some(self.content_type.clone()),
            size: self.content_length,
        }
    }
}

/// Stateless body classifier with a decoded-size cap.
#[derive(Debug, Clone, Copy)]
pub struct BodyClassifier {
    size_limit: usize,
}

impl Default for BodyClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_LIMIT)
    }
}

impl BodyClassifier {
    pub fn new(size_limit: usize) -> Self {
        Self { size_limit }
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Classify a buffered body.
    pub fn classify_bytes(&self, headers: &HeaderMap, body: &[u8]) -> ParsedBody {
        if body.is_empty() {
            return ParsedBody::no_body();
        }

        let meta = Meta::from_headers(headers);
        if let Some(short_circuit) = self.precheck(&meta) {
            return short_circuit;
        }
        self.decode(&meta, body)
    }

    /// Classify a streamed body. Header checks run before any frame is read,
    /// and at most `size_limit` raw bytes are buffered.
    pub async fn classify<B>(&self, headers: &HeaderMap, body: B) -> ParsedBody
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if body.is_end_stream() {
            return ParsedBody::no_body();
        }

        let meta = Meta::from_headers(headers);
        if let Some(short_circuit) = self.precheck(&meta) {
            return short_circuit;
        }

        match Limited::new(body, self.size_limit).collect().await {
            Ok(collected) => {
                let raw = collected.to_bytes();
                if raw.is_empty() {
                    return ParsedBody::no_body();
                }
                self.decode(&meta, &raw)
            }
            Err(e) => {
                if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                    meta.result(BodyType::TooBig)
                } else {
                    tracing::debug!("Failed to read body: {}", e);
                    meta.result(BodyType::NotJson)
                }
            }
        }
    }

    fn precheck(&self, meta: &Meta) -> Option<ParsedBody> {
        let content_type = meta.content_type.as_str();

        if content_type.starts_with("multipart/form-data") {
            return Some(meta.result(BodyType::Multipart));
        }
        if content_type.starts_with("text/html") {
            return Some(meta.result(BodyType::Html));
        }
        if content_type.contains("stream") {
            return Some(meta.result(BodyType::Stream));
        }
        if not_json_types().iter().any(|re| re.is_match(content_type)) {
            return Some(meta.result(BodyType::NotJson));
        }
        if meta
            .content_length
            .map(|len| len > self.size_limit as u64)
            .unwrap_or(false)
        {
            return Some(meta.result(BodyType::TooBig));
        }
        None
    }

    fn decode(&self, meta: &Meta, raw: &[u8]) -> ParsedBody {
        let decoded = match self.decompress(meta.encoding.as_deref(), raw) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return meta.result(BodyType::TooBig),
            Err(e) => {
                tracing::debug!("Body classified as NOT_JSON: {}", e);
                return meta.result(BodyType::NotJson);
            }
        };

        let text = String::from_utf8_lossy(&decoded).into_owned();
        let size = meta.content_length.or(Some(decoded.len() as u64));

        if meta.content_type.starts_with("text/plain") {
            return ParsedBody {
                body_type: BodyType::Text,
                body: Some(Value::String(text)),
                content_type: Some(meta.content_type.clone()),
                size,
            };
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(json) => ParsedBody {
                body_type: BodyType::Json,
                body: Some(json),
                content_type: Some(meta.content_type.clone()),
                size,
            },
            Err(_) => ParsedBody {
                body_type: BodyType::NotJson,
                body: Some(Value::String(text)),
                content_type: Some(meta.content_type.clone()),
                size,
            },
        }
    }

    /// Inflate according to `content-encoding`. `Ok(None)` means the decoded
    /// body exceeds the size limit.
    fn decompress(&self, encoding: Option<&str>, raw: &[u8]) -> Result<Option<Vec<u8>>, ParseError> {
        let reader: Box<dyn Read + '_> = match encoding {
            Some("gzip") | Some("compress") | Some("deflate") => {
                if raw.starts_with(&[0x1f, 0x8b]) {
                    Box::new(MultiGzDecoder::new(raw))
                } else {
                    Box::new(ZlibDecoder::new(raw))
                }
            }
            Some("br") => Box::new(brotli::Decompressor::new(raw, BROTLI_BUFFER_SIZE)),
            _ => {
                if raw.len() > self.size_limit {
                    return Ok(None);
                }
                return Ok(Some(raw.to_vec()));
            }
        };

        let mut decoded = Vec::new();
        reader
            .take(self.size_limit as u64 + 1)
            .read_to_end(&mut decoded)?;

        if decoded.len() > self.size_limit {
            return Ok(None);
        }
        Ok(Some(decoded))
    }
}
