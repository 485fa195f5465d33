//! Wire protocol: request parsing, method dispatch table, and the
//! canonicalization of duck-typed parameters.
//!
//! Miners send either positional arrays (classic Stratum) or objects
//! (login-style). Both fold into one canonical record at this boundary;
//! the dispatch layer never sees the variant again.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Error code carried on every rejection triple.
pub const ERROR_CODE: i64 = -1;

/// One JSON-RPC request line from a miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Request id; echoes back on the response, null for notifications
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Array-form or object-form parameters
    #[serde(default)]
    pub params: Value,
}

/// Dispatchable methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    /// `mining.subscribe`
    Subscribe,
    /// `mining.authorize`
    Authorize,
    /// `login` (authorize plus an inline job)
    Login,
    /// `mining.submit` / `submit`
    Submit,
    /// `mining.get_transactions`
    GetTransactions,
    /// `mining.suggest_difficulty`
    SuggestDifficulty,
    /// Anything else
    Unknown(String),
}

impl From<&str> for StratumMethod {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "login" => StratumMethod::Login,
            "mining.submit" | "submit" => StratumMethod::Submit,
            "mining.get_transactions" => StratumMethod::GetTransactions,
            "mining.suggest_difficulty" => StratumMethod::SuggestDifficulty,
            _ => StratumMethod::Unknown(s.to_string()),
        }
    }
}

/// Canonical authorize/login parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeParams {
    /// The full login string, `address[.worker]`
    pub login: String,
    pub password: Option<String>,
}

impl AuthorizeParams {
    /// Folds `[worker, pass]` arrays and `{user, pass}` objects.
    pub fn parse(params: &Value) -> Result<Self, String> {
        if let Some(array) = params.as_array() {
            let login = array
                .first()
                .and_then(Value::as_str)
                .ok_or("Missing worker name")?;
            let password = array.get(1).and_then(Value::as_str).map(str::to_string);
            return Ok(AuthorizeParams {
                login: login.to_string(),
                password,
            });
        }

        if let Some(object) = params.as_object() {
            let login = object
                .get("user")
                .or_else(|| object.get("login"))
                .and_then(Value::as_str)
                .ok_or("Missing user field")?;
            let password = object
                .get("pass")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(AuthorizeParams {
                login: login.to_string(),
                password,
            });
        }

        Err("Parameters must be an array or object".to_string())
    }

    /// Splits the login string into `(address, worker)`; the worker
    /// defaults when the suffix is absent.
    pub fn identity(&self) -> Result<(String, String), String> {
        let mut parts = self.login.splitn(2, '.');
        let address = parts.next().unwrap_or_default();
        if address.is_empty() {
            return Err("Empty wallet address in login".to_string());
        }

        let worker = match parts.next() {
            Some(worker) if !worker.is_empty() => worker,
            _ => "default",
        };

        Ok((address.to_string(), worker.to_string()))
    }
}

/// Canonical share submission parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker: Option<String>,
    pub job_id: String,
    pub extra_nonce2: Option<String>,
    pub ntime: String,
    pub nonce: String,
    /// Share hash from the object form's `result` field
    pub hash: Option<String>,
}

impl SubmitParams {
    /// Folds `[worker, jobId, extraNonce2, nTime, nonce]` arrays and
    /// `{jobId, nonce, nTime, result}` objects.
    pub fn parse(params: &Value) -> Result<Self, String> {
        if let Some(array) = params.as_array() {
            if array.len() < 5 {
                return Err(format!(
                    "Submit expects 5 parameters, got {}",
                    array.len()
                ));
            }
            let field = |i: usize, name: &str| -> Result<String, String> {
                array[i]
                    .as_str()
                    .map(str::to_string)
                    .ok_or(format!("Parameter {} must be a string", name))
            };

            return Ok(SubmitParams {
                worker: Some(field(0, "worker")?),
                job_id: field(1, "jobId")?,
                extra_nonce2: Some(field(2, "extraNonce2")?),
                ntime: field(3, "nTime")?,
                nonce: field(4, "nonce")?,
                hash: None,
            });
        }

        if let Some(object) = params.as_object() {
            let field = |names: &[&str]| -> Option<String> {
                names
                    .iter()
                    .find_map(|n| object.get(*n))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };

            return Ok(SubmitParams {
                worker: field(&["worker"]),
                job_id: field(&["jobId", "job_id"]).ok_or("Missing jobId")?,
                extra_nonce2: field(&["extraNonce2", "extra_nonce2"]),
                ntime: field(&["nTime", "ntime"]).ok_or("Missing nTime")?,
                nonce: field(&["nonce"]).ok_or("Missing nonce")?,
                hash: field(&["result", "hash"]),
            });
        }

        Err("Parameters must be an array or object".to_string())
    }
}

/// Parses the single difficulty argument of `mining.suggest_difficulty`.
pub fn parse_suggested_difficulty(params: &Value) -> Result<u64, String> {
    let value = if let Some(array) = params.as_array() {
        array.first().cloned()
    } else if let Some(object) = params.as_object() {
        object.get("difficulty").cloned()
    } else {
        None
    };

    value
        .as_ref()
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().map(|f| f.max(0.0).round() as u64))
        })
        .ok_or_else(|| "Missing difficulty parameter".to_string())
}

/// Success response line.
pub fn response_ok(id: &Value, result: Value) -> String {
    json!({
        "id": id,
        "result": result,
        "error": null
    })
    .to_string()
}

/// Rejection line: `{result: null, error: [code, message, null]}`.
pub fn response_error(id: &Value, code: i64, message: &str) -> String {
    json!({
        "id": id,
        "result": null,
        "error": [code, message, null]
    })
    .to_string()
}

/// Server-initiated notification line.
pub fn notification(method: &str, params: Value) -> String {
    json!({
        "id": null,
        "method": method,
        "params": params
    })
    .to_string()
}
