//! Outbound HTTP for scripts.
//!
//! ```lua
//! fetch("https://example.com/api", {
//!   method = "POST",
//!   headers = { ["content-type"] = "application/json" },
//!   body = json.encode({ hello = "world" }),
//!   redirect = "error",   -- or "follow" (default)
//! }):next(function(res)
//!   if not res.ok then return "upstream said " .. res.status end
//!   return res:json()
//! end)
//! ```
//!
//! The request itself runs as a microtask on the invocation's job queue,
//! blocking the worker thread. Its timeout is the smaller of the configured
//! fetch timeout and the time left before the script deadline.
//!
//! Response fields: `status`, `status_text`, `ok`, `url`, `redirected`,
//! `headers` (lowercase names), `text()` and `json()`, the last two
//! returning promises.

use crate::bridge::json_to_lua;
use crate::jobs::JobQueue;
use crate::promise::Promise;
use crate::sandbox::Deadline;
use mlua::{Lua, MultiValue, Table, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use ureq::ResponseExt;
use vigil_runtime::config::FetchConfig;
use vigil_types::ErrorCode;

/// Methods a script may use.
pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{0}': only http and https are allowed")]
    InvalidUrl(String),

    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),

    #[error("unsupported redirect mode '{0}'")]
    UnsupportedRedirect(String),

    #[error("a {0} request cannot have a body")]
    BodyNotAllowed(String),

    #[error("invalid fetch options: {0}")]
    InvalidOptions(String),

    #[error("redirect not allowed: {0}")]
    RedirectNotAllowed(String),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(#[from] ureq::Error),
}

impl ErrorCode for FetchError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "FETCH_INVALID_URL",
            Self::UnsupportedMethod(_) => "FETCH_UNSUPPORTED_METHOD",
            Self::UnsupportedRedirect(_) => "FETCH_UNSUPPORTED_REDIRECT",
            Self::BodyNotAllowed(_) => "FETCH_BODY_NOT_ALLOWED",
            Self::InvalidOptions(_) => "FETCH_INVALID_OPTIONS",
            Self::RedirectNotAllowed(_) => "FETCH_REDIRECT_NOT_ALLOWED",
            Self::Timeout => "FETCH_TIMEOUT",
            Self::Transport(_) => "FETCH_TRANSPORT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    #[default]
    Follow,
    Error,
}

impl std::str::FromStr for RedirectMode {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow" => Ok(Self::Follow),
            "error" => Ok(Self::Error),
            other => Err(FetchError::UnsupportedRedirect(other.to_string())),
        }
    }
}

/// A validated outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub redirect: RedirectMode,
}

impl FetchRequest {
    /// A plain GET.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            redirect: RedirectMode::Follow,
        }
    }

    /// Reads `fetch(url, opts)` arguments.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidOptions`] if an option has the wrong
    /// type, or whatever [`FetchRequest::validate`] reports.
    pub fn from_lua(url: String, opts: Option<Table>) -> Result<Self, FetchError> {
        let mut request = Self::get(url);
        if let Some(opts) = opts {
            let invalid = |e: mlua::Error| FetchError::InvalidOptions(e.to_string());

            if let Some(method) = opts.get::<Option<String>>("method").map_err(invalid)? {
                request.method = method.to_ascii_uppercase();
            }
            if let Some(headers) = opts.get::<Option<Table>>("headers").map_err(invalid)? {
                for pair in headers.pairs::<String, String>() {
                    request.headers.push(pair.map_err(invalid)?);
                }
            }
            request.body = opts.get::<Option<String>>("body").map_err(invalid)?;
            if let Some(mode) = opts.get::<Option<String>>("redirect").map_err(invalid)? {
                request.redirect = mode.parse()?;
            }
        }
        request.validate()?;
        Ok(request)
    }

    /// Checks scheme, method and body.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), FetchError> {
        let lower = self.url.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(FetchError::InvalidUrl(self.url.clone()));
        }
        if !ALLOWED_METHODS.contains(&self.method.as_str()) {
            return Err(FetchError::UnsupportedMethod(self.method.clone()));
        }
        if self.body.is_some() && matches!(self.method.as_str(), "GET" | "HEAD") {
            return Err(FetchError::BodyNotAllowed(self.method.clone()));
        }
        Ok(())
    }
}

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub redirected: bool,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    #[must_use]
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn into_table(self, lua: &Lua) -> mlua::Result<Table> {
        let res = lua.create_table()?;
        res.set("status", self.status)?;
        res.set("status_text", self.status_text.as_str())?;
        res.set("ok", self.ok())?;
        res.set("url", self.url.as_str())?;
        res.set("redirected", self.redirected)?;

        let headers = lua.create_table()?;
        for (name, value) in &self.headers {
            headers.set(name.as_str(), value.as_str())?;
        }
        res.set("headers", headers)?;

        let body = Arc::new(self.body);

        let b = Arc::clone(&body);
        res.set(
            "text",
            lua.create_function(move |lua, _: MultiValue| {
                let p = Promise::new();
                p.fulfill(lua, Value::String(lua.create_string(&b[..])?))?;
                Ok(p)
            })?,
        )?;

        res.set(
            "json",
            lua.create_function(move |lua, _: MultiValue| {
                let p = Promise::new();
                match serde_json::from_slice::<serde_json::Value>(&body) {
                    Ok(json) => {
                        let value = json_to_lua(lua, &json).map_err(mlua::Error::external)?;
                        p.fulfill(lua, value)?;
                    }
                    Err(e) => {
                        let reason = lua.create_string(format!("invalid json body: {e}"))?;
                        p.reject(lua, Value::String(reason))?;
                    }
                }
                Ok(p)
            })?,
        )?;

        Ok(res)
    }
}

/// Sends `request` and reads the whole response.
///
/// `budget` caps the configured timeout; a zero budget fails immediately.
///
/// # Errors
///
/// Returns a [`FetchError`] for invalid requests, transport failures,
/// timeouts, disallowed redirects and oversized bodies.
pub fn perform(
    request: &FetchRequest,
    config: &FetchConfig,
    budget: Duration,
) -> Result<FetchResponse, FetchError> {
    request.validate()?;
    let timeout = config.timeout().min(budget);
    if timeout.is_zero() {
        return Err(FetchError::Timeout);
    }

    let max_redirects = match request.redirect {
        RedirectMode::Follow => config.max_redirects,
        RedirectMode::Error => 0,
    };
    let agent_config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .max_redirects(max_redirects)
        .http_status_as_error(false)
        .build();
    let agent = ureq::Agent::new_with_config(agent_config);

    let mut builder = ureq::http::Request::builder()
        .method(request.method.as_str())
        .uri(request.url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let invalid = |e: ureq::http::Error| FetchError::InvalidOptions(e.to_string());
    let sent = match &request.body {
        Some(body) => agent.run(builder.body(body.clone()).map_err(invalid)?),
        None => agent.run(builder.body(()).map_err(invalid)?),
    };

    let mut response = match sent {
        Ok(response) => response,
        Err(ureq::Error::Timeout(_)) => return Err(FetchError::Timeout),
        Err(ureq::Error::TooManyRedirects) if request.redirect == RedirectMode::Error => {
            return Err(FetchError::RedirectNotAllowed(request.url.clone()))
        }
        Err(e) => return Err(e.into()),
    };

    let status = response.status();
    if request.redirect == RedirectMode::Error && status.is_redirection() {
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?");
        return Err(FetchError::RedirectNotAllowed(format!(
            "{} to {location}",
            status.as_u16()
        )));
    }

    let final_url = response.get_uri().to_string();
    let requested = request
        .url
        .parse::<ureq::http::Uri>()
        .map(|u| u.to_string())
        .unwrap_or_else(|_| request.url.clone());

    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match response
        .body_mut()
        .with_config()
        .limit(config.max_body_bytes)
        .read_to_vec()
    {
        Ok(body) => body,
        Err(ureq::Error::Timeout(_)) => return Err(FetchError::Timeout),
        Err(e) => return Err(e.into()),
    };

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        redirected: final_url != requested,
        url: final_url,
        headers,
        body,
    })
}

/// Installs the global `fetch`.
///
/// # Errors
///
/// Returns an error if the VM cannot allocate.
pub fn register(lua: &Lua) -> mlua::Result<()> {
    let fetch = lua.create_function(|lua, (url, opts): (String, Option<Table>)| {
        let promise = Promise::new();
        match FetchRequest::from_lua(url, opts) {
            Ok(request) => {
                let target = promise.clone();
                JobQueue::of(lua)?.enqueue(Box::new(move |lua: &Lua| {
                    run_request(lua, &target, &request)
                }));
            }
            Err(e) => {
                promise.reject(lua, Value::String(lua.create_string(e.to_string())?))?;
            }
        }
        Ok(promise)
    })?;
    lua.globals().set("fetch", fetch)
}

fn run_request(lua: &Lua, target: &Promise, request: &FetchRequest) -> mlua::Result<()> {
    let config = lua
        .app_data_ref::<FetchConfig>()
        .map(|c| (*c).clone())
        .unwrap_or_default();
    let deadline = lua.app_data_ref::<Deadline>().map(|d| (*d).clone());
    let budget = deadline
        .as_ref()
        .map_or_else(|| config.timeout(), Deadline::remaining);

    debug!(method = %request.method, url = %request.url, "Script fetch");
    match perform(request, &config, budget) {
        Ok(response) => {
            debug!(status = response.status, bytes = response.body.len(), "Script fetch done");
            let table = response.into_table(lua)?;
            target.fulfill(lua, Value::Table(table))
        }
        Err(e) => {
            if let Some(deadline) = &deadline {
                deadline.check()?;
            }
            warn!(url = %request.url, code = e.code(), error = %e, "Script fetch failed");
            target.reject(lua, Value::String(lua.create_string(e.to_string())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::drain;
    use crate::promise::PromiseState;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serves one canned HTTP response on a random local port.
    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut seen = Vec::new();
                let mut buf = [0u8; 1024];
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/path")
    }

    /// Serves `/hop/0` .. `/hop/<hops>`, each redirecting to the next; the
    /// last one answers `200 done`.
    fn serve_redirect_chain(hops: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(hops + 1) {
                let Ok(mut stream) = stream else { break };
                let mut seen = Vec::new();
                let mut buf = [0u8; 1024];
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&seen);
                let hop: usize = head
                    .split_whitespace()
                    .nth(1)
                    .and_then(|path| path.strip_prefix("/hop/"))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                let response = if hop < hops {
                    format!(
                        "HTTP/1.1 302 Found\r\nLocation: /hop/{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        hop + 1
                    )
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndone".to_string()
                };
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/hop/0")
    }

    const OK_JSON: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-Custom: yes\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"n\": 4.25}";

    #[test]
    fn get_reads_status_headers_and_body() {
        let url = serve_once(OK_JSON);
        let res = perform(&FetchRequest::get(&url), &FetchConfig::default(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(res.status, 200);
        assert!(res.ok());
        assert_eq!(res.status_text, "OK");
        assert!(!res.redirected);
        assert!(res.headers.iter().any(|(k, v)| k == "x-custom" && v == "yes"));
        assert_eq!(res.body, b"{\"n\": 4.25}");
    }

    #[test]
    fn error_status_is_not_an_error() {
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
        );
        let res = perform(&FetchRequest::get(&url), &FetchConfig::default(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(res.status, 404);
        assert!(!res.ok());
    }

    #[test]
    fn redirect_error_mode_rejects_3xx() {
        let url = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let request = FetchRequest {
            redirect: RedirectMode::Error,
            ..FetchRequest::get(&url)
        };
        let err = perform(&request, &FetchConfig::default(), Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.code(), "FETCH_REDIRECT_NOT_ALLOWED");
    }

    #[test]
    fn follows_up_to_ten_redirects() {
        let url = serve_redirect_chain(10);
        let res = perform(&FetchRequest::get(&url), &FetchConfig::default(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(res.status, 200);
        assert!(res.redirected);
        assert!(res.url.ends_with("/hop/10"), "{}", res.url);
        assert_eq!(res.body, b"done");
    }

    #[test]
    fn eleventh_redirect_fails() {
        let url = serve_redirect_chain(11);
        let err = perform(&FetchRequest::get(&url), &FetchConfig::default(), Duration::from_secs(10))
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Transport(ureq::Error::TooManyRedirects)),
            "{err}"
        );
        assert_eq!(err.code(), "FETCH_TRANSPORT");
    }

    #[test]
    fn oversized_body_fails() {
        let url = serve_once(OK_JSON);
        let config = FetchConfig {
            max_body_bytes: 4,
            ..FetchConfig::default()
        };
        let err = perform(&FetchRequest::get(&url), &config, Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.code(), "FETCH_TRANSPORT");
    }

    #[test]
    fn zero_budget_times_out_without_connecting() {
        let err = perform(
            &FetchRequest::get("http://127.0.0.1:9/"),
            &FetchConfig::default(),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[test]
    fn validation() {
        assert!(matches!(
            FetchRequest::get("file:///etc/passwd").validate(),
            Err(FetchError::InvalidUrl(_))
        ));
        let trace = FetchRequest {
            method: "TRACE".into(),
            ..FetchRequest::get("http://x")
        };
        assert!(matches!(trace.validate(), Err(FetchError::UnsupportedMethod(_))));
        let get_with_body = FetchRequest {
            body: Some("x".into()),
            ..FetchRequest::get("http://x")
        };
        assert!(matches!(get_with_body.validate(), Err(FetchError::BodyNotAllowed(_))));
        assert!("manual".parse::<RedirectMode>().is_err());
    }

    #[test]
    fn options_are_read_from_lua() {
        let lua = Lua::new();
        let opts: Table = lua
            .load(r#"return { method = "post", headers = { accept = "text/plain" }, body = "hi", redirect = "error" }"#)
            .eval()
            .unwrap();
        let request = FetchRequest::from_lua("https://x.test/".into(), Some(opts)).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers, vec![("accept".to_string(), "text/plain".to_string())]);
        assert_eq!(request.body.as_deref(), Some("hi"));
        assert_eq!(request.redirect, RedirectMode::Error);
    }

    fn lua_with_queue() -> (Lua, JobQueue) {
        let lua = Lua::new();
        let queue = JobQueue::new();
        lua.set_app_data(queue.clone());
        lua.set_app_data(FetchConfig::default());
        crate::promise::register(&lua).unwrap();
        register(&lua).unwrap();
        (lua, queue)
    }

    #[test]
    fn lua_fetch_then_json() {
        let url = serve_once(OK_JSON);
        let (lua, queue) = lua_with_queue();
        lua.globals().set("URL", url).unwrap();
        let v: Value = lua
            .load("return fetch(URL):next(function(r) return r:json() end):next(function(j) return j.n end)")
            .eval()
            .unwrap();
        let p = Promise::from_lua_value(&v).unwrap();
        drain(&lua, &queue, &Deadline::after(Duration::from_secs(10)), || !p.is_pending()).unwrap();
        match p.state() {
            PromiseState::Fulfilled(Value::Number(n)) => assert!((n - 4.25).abs() < f64::EPSILON),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lua_response_reports_redirect() {
        let url = serve_redirect_chain(2);
        let (lua, queue) = lua_with_queue();
        lua.globals().set("URL", url).unwrap();
        let v: Value = lua
            .load("return fetch(URL):next(function(r) return tostring(r.redirected) .. ' ' .. r.url end)")
            .eval()
            .unwrap();
        let p = Promise::from_lua_value(&v).unwrap();
        drain(&lua, &queue, &Deadline::after(Duration::from_secs(10)), || !p.is_pending()).unwrap();
        match p.state() {
            PromiseState::Fulfilled(Value::String(s)) => {
                let s = s.to_str().unwrap().to_string();
                assert!(s.starts_with("true http://"), "{s}");
                assert!(s.ends_with("/hop/2"), "{s}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lua_fetch_bad_scheme_rejects() {
        let (lua, queue) = lua_with_queue();
        let v: Value = lua.load(r#"return fetch("ftp://x")"#).eval().unwrap();
        let p = Promise::from_lua_value(&v).unwrap();
        drain(&lua, &queue, &Deadline::after(Duration::from_secs(1)), || false).unwrap();
        assert!(matches!(p.state(), PromiseState::Rejected(_)));
    }
}
