//! Per-request state shared between filters and handlers.
//!
//! A [`RequestContext`] owns the request halves (header parts plus the
//! not-yet-read body) and a response slot. The body is read at most once and
//! cached; every terminal writer races for the single response slot, and
//! exactly one wins. Losers get [`Error::ResponseWritten`] and a warning in
//! the log, never a crash.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError, RwLock};

use axum::body::Body;
use axum::http::header::{
    CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED, LOCATION,
};
use axum::http::{Method, StatusCode, Uri, request::Parts};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::errors::{Error, Result};

pub const APPLICATION_JSON: &str = "application/json; charset=utf-8";
pub const TEXT_HTML: &str = "text/html; charset=utf-8";
pub const SERVER_HEADER: &str = "gantry";

/// The uniform REST envelope: `{"code": …, "message": …, "data": …}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    pub message: String,
    pub data: T,
}

struct ResponseSlot {
    writable: bool,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct RequestContext {
    parts: Parts,
    peer_addr: Option<SocketAddr>,
    body_source: tokio::sync::Mutex<Option<Body>>,
    body: tokio::sync::OnceCell<Bytes>,
    path_params: RwLock<HashMap<String, String>>,
    response: Mutex<ResponseSlot>,
}

impl RequestContext {
    pub fn new(parts: Parts, body: Body, peer_addr: Option<SocketAddr>) -> Self {
        RequestContext {
            parts,
            peer_addr,
            body_source: tokio::sync::Mutex::new(Some(body)),
            body: tokio::sync::OnceCell::new(),
            path_params: RwLock::new(HashMap::new()),
            response: Mutex::new(ResponseSlot {
                writable: true,
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }),
        }
    }

    /// Build a context straight from a request, for tests and embedding.
    pub fn from_request(req: axum::extract::Request, peer_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        RequestContext::new(parts, body, peer_addr)
    }

    // ---- request accessors -------------------------------------------------

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn header(&self, key: &str) -> Option<String> {
        self.parts
            .headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn cookie(&self, key: &str) -> Option<String> {
        let raw = self.parts.headers.get(COOKIE)?.to_str().ok()?;
        raw.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == key).then(|| value.to_string())
        })
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.parts.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn path_param(&self, key: &str) -> Option<String> {
        self.path_params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn set_path_params(&self, params: HashMap<String, String>) {
        *self.path_params.write().unwrap_or_else(PoisonError::into_inner) = params;
    }

    /// The caller's address: first of `x-forwarded-for`, `x-real-ip`, the
    /// socket peer.
    pub fn remote_addr(&self) -> Option<String> {
        self.header("x-forwarded-for")
            .or_else(|| self.header("x-real-ip"))
            .or_else(|| self.peer_addr.map(|a| a.to_string()))
    }

    /// Read the request body, at most once. Concurrent callers all observe
    /// the same cached buffer.
    pub async fn body(&self) -> Result<Bytes> {
        self.body
            .get_or_try_init(|| async {
                let source = self.body_source.lock().await.take();
                let Some(source) = source else {
                    return Ok(Bytes::new());
                };
                axum::body::to_bytes(source, usize::MAX)
                    .await
                    .map_err(|err| Error::bad_request(format!("failed to read request body: {err}")))
            })
            .await
            .cloned()
    }

    /// Decode the cached body as a JSON object. An empty body yields an
    /// empty mapping.
    pub async fn json(&self) -> Result<Map<String, Value>> {
        let body = self.body().await?;
        if body.is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Decode the cached body into a typed record.
    pub async fn json_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let body = self.body().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    // ---- response metadata -------------------------------------------------

    pub fn set_header(&self, key: &str, value: &str) {
        let (Ok(name), Ok(value)) = (key.parse::<HeaderName>(), HeaderValue::from_str(value)) else {
            warn!(%key, "dropping invalid response header");
            return;
        };
        self.lock_response().headers.insert(name, value);
    }

    pub fn del_header(&self, key: &str) {
        if let Ok(name) = key.parse::<HeaderName>() {
            self.lock_response().headers.remove(name);
        }
    }

    /// Append a `Set-Cookie` header. Metadata mutators must run before the
    /// terminal write.
    pub fn set_cookie(&self, cookie: &str) {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            self.lock_response().headers.append(axum::http::header::SET_COOKIE, value);
        }
    }

    pub fn set_last_modified(&self, when: DateTime<Utc>) {
        let formatted = when.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            self.lock_response().headers.insert(LAST_MODIFIED, value);
        }
    }

    // ---- terminal writers --------------------------------------------------

    /// 200 with the given content type and payload.
    pub fn ok(&self, content_type: &str, content: impl Into<Bytes>) -> Result<()> {
        let content = content.into();
        self.write(StatusCode::OK, |slot| {
            if !content_type.is_empty() {
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    slot.headers.insert(CONTENT_TYPE, value);
                }
            }
            slot.body = content;
        })
    }

    /// Bare status code, empty body.
    pub fn code(&self, status: u16) -> Result<()> {
        self.write(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), |_| {})
    }

    /// Error status with an HTML document body.
    pub fn error(&self, status: u16, html: &str) -> Result<()> {
        let body = Bytes::from(html.to_string());
        self.write(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), |slot| {
            slot.headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_HTML));
            slot.body = body;
        })
    }

    /// 302 redirect.
    pub fn redirect(&self, path: &str) -> Result<()> {
        let location = HeaderValue::from_str(path).map_err(|_| Error::bad_request(format!("invalid redirect target: {path}")))?;
        self.write(StatusCode::FOUND, |slot| {
            slot.headers.insert(LOCATION, location);
        })
    }

    /// Serialize a value as the full JSON response.
    pub fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.ok(APPLICATION_JSON, body)
    }

    /// 304 with no body.
    pub fn write_not_modified(&self) -> Result<()> {
        self.write(StatusCode::NOT_MODIFIED, |_| {})
    }

    /// Attachment download with a suggested file name.
    pub fn download_content(&self, name: &str, content: impl Into<Bytes>) -> Result<()> {
        let content = content.into();
        let disposition = HeaderValue::from_str(&format!("attachment;filename={name}"))
            .map_err(|_| Error::bad_request(format!("invalid attachment name: {name}")))?;
        self.write(StatusCode::OK, |slot| {
            slot.headers.insert(CONTENT_DISPOSITION, disposition);
            slot.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            slot.body = content;
        })
    }

    /// Serve a file from disk, guessing the content type from the
    /// extension. A missing file turns into the 404 document.
    pub async fn serve_file(&self, path: &str) -> Result<()> {
        match tokio::fs::read(path).await {
            Ok(content) => {
                let mime = mime_guess::from_path(path).first_or_octet_stream();
                self.ok(mime.as_ref(), content)
            }
            Err(err) => {
                warn!(%path, %err, "serve_file failed");
                self.error(404, super::NOT_FOUND_VIEW)
            }
        }
    }

    /// Emit the `{code, message, data}` envelope as JSON.
    pub fn api_response<T: Serialize>(&self, code: i64, message: impl Into<String>, data: T) -> Result<()> {
        let body = serde_json::to_vec(&ApiResponse {
            code,
            message: message.into(),
            data,
        })?;
        self.ok(APPLICATION_JSON, body)
    }

    /// Input-fault shorthand: `{"code": -1, "message": …, "data": null}`
    /// with HTTP 200.
    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.api_response(-1, message, json!(null))
    }

    // ---- response state ----------------------------------------------------

    /// Whether no terminal writer has won yet.
    pub fn writable(&self) -> bool {
        self.lock_response().writable
    }

    /// The status captured by the winning writer (200 until one wins).
    pub fn captured_status(&self) -> u16 {
        self.lock_response().status.as_u16()
    }

    /// Consume the response slot into a wire response. Called once by the
    /// server after the handler returns.
    pub(crate) fn finish(&self) -> Response {
        let mut slot = self.lock_response();
        slot.writable = false;
        let mut response = Response::new(Body::from(std::mem::take(&mut slot.body)));
        *response.status_mut() = slot.status;
        *response.headers_mut() = std::mem::take(&mut slot.headers);
        response
            .headers_mut()
            .insert("server", HeaderValue::from_static(SERVER_HEADER));
        response
    }

    fn lock_response(&self) -> std::sync::MutexGuard<'_, ResponseSlot> {
        self.response.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, status: StatusCode, fill: impl FnOnce(&mut ResponseSlot)) -> Result<()> {
        let mut slot = self.lock_response();
        if !slot.writable {
            warn!(path = %self.parts.uri.path(), "response already written");
            return Err(Error::ResponseWritten);
        }
        slot.writable = false;
        slot.status = status;
        fill(&mut slot);
        Ok(())
    }
}
