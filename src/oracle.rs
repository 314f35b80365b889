use std::{fmt, time::Duration};

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::OracleSection;

/// Contract view methods the resolver knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleMethod {
    GetContentHash,
    GetTxt,
    GetA,
    GetAaaa,
}

impl OracleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleMethod::GetContentHash => "get_content_hash",
            OracleMethod::GetTxt => "get_txt",
            OracleMethod::GetA => "get_a",
            OracleMethod::GetAaaa => "get_aaaa",
        }
    }
}

impl fmt::Display for OracleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome of a contract view call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleResponse {
    pub result: Vec<u8>,
    pub logs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("oracle call {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("oracle response envelope malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Decode(#[from] OracleDecodeError),
}

/// Failure turning a contract return value into a byte buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OracleDecodeError {
    #[error("contract result is not JSON: {0}")]
    Json(String),
    #[error("contract result has unexpected shape: {0}")]
    UnexpectedShape(String),
    #[error("contract result is not valid base64: {0}")]
    Base64(String),
}

/// Remote contract query endpoint.
pub trait OracleClient: Send + Sync {
    fn call(
        &self,
        contract: &str,
        method: OracleMethod,
        args_base64: &str,
    ) -> Result<OracleResponse, OracleError>;
}

impl<T: OracleClient + ?Sized> OracleClient for std::sync::Arc<T> {
    fn call(
        &self,
        contract: &str,
        method: OracleMethod,
        args_base64: &str,
    ) -> Result<OracleResponse, OracleError> {
        (**self).call(contract, method, args_base64)
    }
}

#[derive(Serialize)]
struct AccountArgs<'a> {
    account_id: &'a str,
}

/// Base64 of `{"account_id": <id>}`, the argument every view method takes.
pub fn encode_args(account_id: &str) -> String {
    let json = serde_json::to_vec(&AccountArgs { account_id }).unwrap_or_default();
    STANDARD.encode(json)
}

/// Unwrap the JSON string / base64 layers around a contract's byte payload.
///
/// `null` is an empty buffer; any other non-string value is rejected.
pub fn decode_payload(result: &[u8]) -> Result<Vec<u8>, OracleDecodeError> {
    if result.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_slice(result).map_err(|err| OracleDecodeError::Json(err.to_string()))?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(encoded) => STANDARD
            .decode(encoded.trim())
            .map_err(|err| OracleDecodeError::Base64(err.to_string())),
        other => Err(OracleDecodeError::UnexpectedShape(json_kind(&other).into())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Issue a view call for `account_id` and decode its byte payload.
pub fn fetch_bytes<O: OracleClient + ?Sized>(
    oracle: &O,
    contract: &str,
    method: OracleMethod,
    account_id: &str,
) -> Result<Vec<u8>, OracleError> {
    let response = oracle.call(contract, method, &encode_args(account_id))?;
    if !response.logs.is_empty() {
        debug!(method = %method, account_id, logs = ?response.logs, "Oracle call emitted logs");
    }
    Ok(decode_payload(&response.result)?)
}

/// Blocking NEAR JSON-RPC client for `call_function` view queries.
pub struct NearRpcClient {
    client: Client,
    endpoint: String,
    finality: String,
}

impl NearRpcClient {
    pub fn from_settings(settings: &OracleSection) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("NearLink/0.1 (oracle)")
            .timeout(Duration::from_secs(settings.timeout_seconds.max(1)))
            .build()
            .context("Failed to build oracle HTTP client")?;
        Ok(Self {
            client,
            endpoint: settings.rpc_endpoint.clone(),
            finality: settings.finality.clone(),
        })
    }
}

impl fmt::Debug for NearRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearRpcClient")
            .field("endpoint", &self.endpoint)
            .field("finality", &self.finality)
            .finish()
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: CallFunctionParams<'a>,
}

#[derive(Serialize)]
struct CallFunctionParams<'a> {
    request_type: &'static str,
    finality: &'a str,
    account_id: &'a str,
    method_name: &'a str,
    args_base64: &'a str,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<CallResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallResult {
    #[serde(default)]
    result: Option<Vec<u8>>,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl OracleClient for NearRpcClient {
    fn call(
        &self,
        contract: &str,
        method: OracleMethod,
        args_base64: &str,
    ) -> Result<OracleResponse, OracleError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: "nearlink",
            method: "query",
            params: CallFunctionParams {
                request_type: "call_function",
                finality: &self.finality,
                account_id: contract,
                method_name: method.as_str(),
                args_base64,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let envelope: RpcEnvelope = response
            .json()
            .map_err(|err| OracleError::Malformed(err.to_string()))?;
        parse_envelope(method, envelope)
    }
}

fn parse_envelope(
    method: OracleMethod,
    envelope: RpcEnvelope,
) -> Result<OracleResponse, OracleError> {
    if let Some(error) = envelope.error {
        return Err(OracleError::Rpc {
            method: method.as_str().into(),
            message: rpc_error_message(&error),
        });
    }
    let result = envelope
        .result
        .ok_or_else(|| OracleError::Malformed("missing result".into()))?;
    if let Some(message) = result.error {
        return Err(OracleError::Rpc {
            method: method.as_str().into(),
            message,
        });
    }
    let bytes = result
        .result
        .ok_or_else(|| OracleError::Malformed("missing result bytes".into()))?;
    Ok(OracleResponse {
        result: bytes,
        logs: result.logs,
    })
}

fn rpc_error_message(error: &Value) -> String {
    let cause = error
        .get("cause")
        .and_then(|cause| cause.get("name"))
        .and_then(Value::as_str);
    let data = error.get("data").and_then(Value::as_str);
    let message = error.get("message").and_then(Value::as_str);
    match (cause, data, message) {
        (Some(cause), Some(data), _) => format!("{cause}: {data}"),
        (Some(cause), None, _) => cause.to_string(),
        (None, Some(data), _) => data.to_string(),
        (None, None, Some(message)) => message.to_string(),
        (None, None, None) => error.to_string(),
    }
}
