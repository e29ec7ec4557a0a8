//! DSM Web API client.
//!
//! Every DSM call is a GET against `webapi/entry.cgi` (or `webapi/auth.cgi` for
//! authentication) with `api`, `version` and `method` query parameters, answered
//! with a JSON [`Envelope`]. [`DsmClient::call`] handles the generic part; the
//! typed helpers below it cover the handful of operations an export needs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::codes;
use crate::error::{Error, Result};
use crate::guest::GuestSnapshot;
use crate::task::TaskId;
use crate::transport::Transport;

pub const API_AUTH: &str = "SYNO.API.Auth";
pub const API_GUEST: &str = "SYNO.Virtualization.API.Guest";
pub const API_GUEST_ACTION: &str = "SYNO.Virtualization.API.Guest.Action";
pub const API_GUEST_EXPORT: &str = "SYNO.Virtualization.Guest.Action";
pub const API_TASK_INFO: &str = "SYNO.Virtualization.API.Task.Info";
pub const API_FILE_DELETE: &str = "SYNO.FileStation.Delete";

/// Session name sent on login/logout.
pub const SESSION_NAME: &str = "vmm_export";

/// The uniform DSM response wrapper.
///
/// Fields DSM adds beyond `success`/`data`/`error` are kept in `extra` so the
/// envelope can be logged exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `error` member of a failed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Envelope {
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().and_then(|e| e.code)
    }

    /// A member of `data`, if present.
    pub fn data_field(&self, name: &str) -> Option<&Value> {
        self.data.as_ref()?.get(name)
    }

    /// Compact JSON rendering for diagnostics.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Which CGI script a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Auth,
    Entry,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Endpoint::Auth => "webapi/auth.cgi",
            Endpoint::Entry => "webapi/entry.cgi",
        }
    }
}

/// A single DSM API request.
#[derive(Debug, Clone)]
pub struct Request {
    endpoint: Endpoint,
    api: &'static str,
    version: u32,
    method: &'static str,
    params: Vec<(String, String)>,
}

impl Request {
    /// Request against `entry.cgi`.
    pub fn new(api: &'static str, version: u32, method: &'static str) -> Self {
        Self {
            endpoint: Endpoint::Entry,
            api,
            version,
            method,
            params: Vec::new(),
        }
    }

    /// Request against `auth.cgi`.
    pub fn auth(method: &'static str) -> Self {
        Self {
            endpoint: Endpoint::Auth,
            ..Self::new(API_AUTH, 3, method)
        }
    }

    /// Add a method-specific query parameter.
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn api(&self) -> &'static str {
        self.api
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    fn query(&self, sid: Option<&str>) -> Vec<(String, String)> {
        let mut query = vec![
            ("api".to_string(), self.api.to_string()),
            ("version".to_string(), self.version.to_string()),
            ("method".to_string(), self.method.to_string()),
        ];
        query.extend(self.params.iter().cloned());
        if let (Endpoint::Entry, Some(sid)) = (self.endpoint, sid) {
            query.push(("_sid".to_string(), sid.to_string()));
        }
        query
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Return failed envelopes instead of turning them into [`Error::Remote`].
    pub ignore_error: bool,
    /// Per-call timeout; `None` uses the transport default.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn ignore_error() -> Self {
        Self {
            ignore_error: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Log a failed envelope: the code, every message known for it, and the raw
/// response.
pub fn log_failure(api: &str, method: &str, envelope: &Envelope) {
    let code = envelope.error_code();
    error!(api, method, code, "DSM request failed");
    if let Some(code) = code {
        for message in codes::describe(api, code) {
            error!(api, code, "Error: {message}");
        }
    }
    error!(response = %envelope.to_json(), "Full response from DSM");
}

/// Client for one DSM host.
pub struct DsmClient<T> {
    transport: T,
    base_url: String,
    sid: Option<String>,
}

impl<T: Transport> DsmClient<T> {
    /// Create a client for `dsm_url` (`host[:port]`, `http://` assumed when no
    /// scheme is given).
    pub fn new(transport: T, dsm_url: &str) -> Self {
        let trimmed = dsm_url.trim_end_matches('/');
        let base_url = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        Self {
            transport,
            base_url,
            sid: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_logged_in(&self) -> bool {
        self.sid.is_some()
    }

    /// Issue `request` and decode the envelope.
    ///
    /// Unless `options.ignore_error` is set, a `success: false` envelope is logged
    /// and returned as [`Error::Remote`].
    pub fn call(&self, request: &Request, options: CallOptions) -> Result<Envelope> {
        let url = format!("{}/{}", self.base_url, request.endpoint.path());
        debug!(api = request.api, method = request.method, "DSM request");

        let body = self
            .transport
            .get(&url, &request.query(self.sid.as_deref()), options.timeout)?;
        // DSM labels JSON as text/plain, so the body is decoded unconditionally.
        let envelope: Envelope = serde_json::from_str(&body).map_err(|e| {
            Error::decode(format!("{}.{}: {e}", request.api, request.method))
        })?;

        if options.ignore_error {
            Ok(envelope)
        } else {
            Self::check(request, envelope)
        }
    }

    /// Turn a failed envelope into a logged [`Error::Remote`].
    pub fn check(request: &Request, envelope: Envelope) -> Result<Envelope> {
        if envelope.success {
            return Ok(envelope);
        }
        log_failure(request.api, request.method, &envelope);
        Err(Error::remote(request.api, request.method, envelope))
    }

    /// Authenticate and keep the session id for subsequent calls.
    pub fn login(&mut self, account: &str, password: &str) -> Result<()> {
        let request = Request::auth("login")
            .param("account", account)
            .param("passwd", password)
            .param("format", "sid")
            .param("session", SESSION_NAME);
        let envelope = self.call(&request, CallOptions::default())?;
        let sid = envelope
            .data_field("sid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::decode("login response has no data.sid"))?;
        self.sid = Some(sid.to_string());
        Ok(())
    }

    /// End the session.
    pub fn logout(&mut self) -> Result<()> {
        let request = Request::auth("logout").param("session", SESSION_NAME);
        let url = format!("{}/{}", self.base_url, request.endpoint.path());
        let mut query = request.query(None);
        if let Some(sid) = self.sid.take() {
            query.push(("_sid".to_string(), sid));
        }
        let body = self.transport.get(&url, &query, None)?;
        let envelope: Envelope = serde_json::from_str(&body)?;
        Self::check(&request, envelope).map(|_| ())
    }

    /// List every guest known to the Virtual Machine Manager.
    ///
    /// Entries that do not carry the fields a [`GuestSnapshot`] needs are logged
    /// and skipped.
    pub fn list_guests(&self) -> Result<Vec<GuestSnapshot>> {
        let request = Request::new(API_GUEST, 1, "list");
        let envelope = self.call(&request, CallOptions::default())?;
        let guests = envelope
            .data_field("guests")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::decode("guest list response has no data.guests"))?;

        Ok(guests
            .iter()
            .filter_map(|raw| match GuestSnapshot::from_value(raw.clone()) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, guest = %raw, "Skipping undecodable guest");
                    None
                }
            })
            .collect())
    }

    pub fn power_off(&self, guest_name: &str) -> Result<()> {
        let request = Request::new(API_GUEST_ACTION, 1, "poweroff").param("guest_name", guest_name);
        self.call(&request, CallOptions::default()).map(|_| ())
    }

    /// Send a power-on. Failed envelopes are returned, not raised: the caller
    /// decides which codes are acceptable.
    pub fn power_on(&self, guest_name: &str, timeout: Duration) -> Result<Envelope> {
        let request =
            Request::new(API_GUEST_ACTION, 1, "poweron").param("guest_name", guest_name);
        self.call(&request, CallOptions::ignore_error().with_timeout(timeout))
    }

    /// Start exporting a guest to `{target_path}/{guest_name}.ova`.
    pub fn start_export(
        &self,
        guest_id: &str,
        guest_name: &str,
        target_path: &str,
    ) -> Result<TaskId> {
        let request = Request::new(API_GUEST_EXPORT, 1, "export")
            .param("target_ova_path", target_path)
            .param("ova_mode", 0)
            .param("guest_id", guest_id)
            .param("name", guest_name);
        let envelope = self.call(&request, CallOptions::default())?;
        envelope
            .data_field("task_id")
            .and_then(TaskId::from_value)
            .ok_or_else(|| Error::decode("export response has no data.task_id"))
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let request = Request::new(API_FILE_DELETE, 2, "delete").param("path", path);
        self.call(&request, CallOptions::default()).map(|_| ())
    }

    /// Fetch the status envelope of a task, failed or not.
    pub fn task_status(&self, task_id: &TaskId) -> Result<Envelope> {
        self.call(&Self::task_request(task_id), CallOptions::ignore_error())
    }

    pub fn task_request(task_id: &TaskId) -> Request {
        Request::new(API_TASK_INFO, 1, "get").param("task_id", task_id)
    }
}
