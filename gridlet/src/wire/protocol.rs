//! Line-oriented wire protocol between the master and a worker slot.
//!
//! Two directions:
//! - **Inbound** (master → slot): `EXECUTE_TASK`, `PING`, `QUIT`
//! - **Outbound** (slot → master): `END_TASK`, `PONG`
//!
//! Decoding is purely positional: a fixed prefix of whitespace-delimited
//! tokens, then a parameter block whose length is carried in an earlier
//! token. Each parameter contributes a 5-token group (type, stream role,
//! prefix, name, value); STRING parameters additionally carry how many of the
//! following tokens make up the base64-escaped literal.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

pub const VERB_EXECUTE_TASK: &str = "EXECUTE_TASK";
pub const VERB_END_TASK: &str = "END_TASK";
pub const VERB_QUIT: &str = "QUIT";
pub const VERB_PING: &str = "PING";
pub const VERB_PONG: &str = "PONG";

/// Sentinel prepended to string payloads before escaping, so an empty string
/// is distinguishable from "no content" on the wire.
const STRING_SENTINEL: char = '#';

/// Escaped string literals are carried as fixed-width base64 chunks.
const STRING_CHUNK_LEN: usize = 64;

/// Placeholder token for an empty prefix field.
const NULL_TOKEN: &str = "null";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty protocol line")]
    Empty,

    #[error("unknown message verb: {0}")]
    UnknownVerb(String),

    #[error("token count mismatch in {context}: needed {needed} more token(s)")]
    TokenCount {
        context: &'static str,
        needed: usize,
    },

    #[error("trailing tokens after {context}")]
    TrailingTokens { context: &'static str },

    #[error("unknown {what} code: {token}")]
    UnknownCode {
        what: &'static str,
        token: String,
    },

    #[error("malformed numeric field {field}: {token}")]
    MalformedNumber {
        field: &'static str,
        token: String,
    },

    #[error("malformed boolean field {field}: {token}")]
    MalformedBool {
        field: &'static str,
        token: String,
    },

    #[error("malformed string escape: {0}")]
    BadEscape(String),
}

/// Parameter type codes as they appear on the wire.
///
/// `Null` (code 5) only occurs in completion-report descriptors; a dispatch
/// never carries a null parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    File,
    ExternalRef,
    Str,
    Numeric,
    Boolean,
    Null,
}

impl ParamKind {
    pub fn code(self) -> u32 {
        match self {
            Self::File => 0,
            Self::ExternalRef => 1,
            Self::Str => 2,
            Self::Numeric => 3,
            Self::Boolean => 4,
            Self::Null => 5,
        }
    }

    pub fn from_code(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "0" => Ok(Self::File),
            "1" => Ok(Self::ExternalRef),
            "2" => Ok(Self::Str),
            "3" => Ok(Self::Numeric),
            "4" => Ok(Self::Boolean),
            "5" => Ok(Self::Null),
            _ => Err(ProtocolError::UnknownCode {
                what: "parameter type",
                token: token.to_string(),
            }),
        }
    }
}

/// Stream role of a parameter (whether it feeds or captures a task stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Unspecified,
    Stdin,
    Stdout,
    Stderr,
}

impl StreamRole {
    pub fn code(self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::Stdin => 1,
            Self::Stdout => 2,
            Self::Stderr => 3,
        }
    }

    pub fn from_code(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "0" => Ok(Self::Unspecified),
            "1" => Ok(Self::Stdin),
            "2" => Ok(Self::Stdout),
            "3" => Ok(Self::Stderr),
            _ => Err(ProtocolError::UnknownCode {
                what: "stream role",
                token: token.to_string(),
            }),
        }
    }
}

/// What the master wants done with downstream tasks if this one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Retry,
    Ignore,
    CancelSuccessors,
}

impl OnFailure {
    pub fn token(self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Ignore => "IGNORE",
            Self::CancelSuccessors => "CANCEL_SUCCESSORS",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "RETRY" => Ok(Self::Retry),
            "IGNORE" => Ok(Self::Ignore),
            "CANCEL_SUCCESSORS" => Ok(Self::CancelSuccessors),
            _ => Err(ProtocolError::UnknownCode {
                what: "on-failure action",
                token: token.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Method,
    Function,
}

impl TargetKind {
    pub fn token(self) -> &'static str {
        match self {
            Self::Method => "METHOD",
            Self::Function => "FUNCTION",
        }
    }

    pub fn from_token(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "METHOD" => Ok(Self::Method),
            "FUNCTION" => Ok(Self::Function),
            _ => Err(ProtocolError::UnknownCode {
                what: "target kind",
                token: token.to_string(),
            }),
        }
    }
}

/// A decoded parameter payload.
///
/// Numeric payloads keep the platform width class they arrived with: a token
/// that fits a 32-bit signed integer is `Int`, one that overflows is promoted
/// to `Long`, and anything with a decimal point or exponent is `Double`. The
/// encoder reproduces the class exactly so the master reads back what it sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Str(String),
    File(String),
    ExternalRef(String),
    Null,
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Int(_) | Self::Long(_) | Self::Double(_) => ParamKind::Numeric,
            Self::Bool(_) => ParamKind::Boolean,
            Self::Str(_) => ParamKind::Str,
            Self::File(_) => ParamKind::File,
            Self::ExternalRef(_) => ParamKind::ExternalRef,
            Self::Null => ParamKind::Null,
        }
    }
}

/// One parameter of a dispatch, in positional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub stream: StreamRole,
    pub prefix: String,
    pub name: String,
    pub value: ParamValue,
}

/// A decoded `EXECUTE_TASK` line. Immutable after decode, consumed exactly
/// once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub request_id: u64,
    pub stdout_path: String,
    pub stderr_path: String,
    pub debug: bool,
    pub num_slaves: u32,
    pub has_target: bool,
    pub on_failure: OnFailure,
    pub target_kind: TargetKind,
    pub module_or_class: String,
    pub method_name: String,
    pub target_has_self: bool,
    pub params: Vec<ParamSpec>,
    pub result_bindings: Vec<String>,
}

impl DispatchRequest {
    /// Stable signature used to look the callable up in the registry.
    pub fn signature(&self) -> String {
        format!("{}.{}", self.module_or_class, self.method_name)
    }
}

/// One value produced by a completed task.
///
/// Primitives carry their literal inline; reference types carry the backing
/// location the value was serialized to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewValueDescriptor {
    pub identity: String,
    pub value: ParamValue,
}

/// A decoded or to-be-encoded `END_TASK` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub request_id: u64,
    pub exit_status: i32,
    pub new_values: Vec<NewValueDescriptor>,
    pub message: Option<String>,
}

impl CompletionReport {
    pub fn success(request_id: u64, new_values: Vec<NewValueDescriptor>) -> Self {
        Self {
            request_id,
            exit_status: 0,
            new_values,
            message: None,
        }
    }

    pub fn failure(request_id: u64, exit_status: i32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            exit_status,
            new_values: Vec::new(),
            message: Some(message.into()),
        }
    }
}

/// Messages arriving on a slot's inbound pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Execute(Box<DispatchRequest>),
    Ping,
    Quit,
}

/// Messages emitted on a slot's outbound pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    TaskEnd(CompletionReport),
    Pong,
}

/// A protocol line as one of the two direction vocabularies.
pub trait WireLine: Sized {
    fn decode_line(line: &str) -> Result<Self, ProtocolError>;
    fn encode_line(&self) -> String;
}

impl WireLine for InboundMessage {
    fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = Tokens::new(line)?;
        match tokens.verb()? {
            VERB_PING => {
                tokens.finish("PING")?;
                Ok(Self::Ping)
            }
            VERB_QUIT => {
                tokens.finish("QUIT")?;
                Ok(Self::Quit)
            }
            VERB_EXECUTE_TASK => {
                let request = decode_dispatch(&mut tokens)?;
                tokens.finish("EXECUTE_TASK")?;
                Ok(Self::Execute(Box::new(request)))
            }
            verb => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }

    fn encode_line(&self) -> String {
        match self {
            Self::Ping => VERB_PING.to_string(),
            Self::Quit => VERB_QUIT.to_string(),
            Self::Execute(request) => encode_dispatch(request),
        }
    }
}

impl WireLine for OutboundMessage {
    fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = Tokens::new(line)?;
        match tokens.verb()? {
            VERB_PONG => {
                tokens.finish("PONG")?;
                Ok(Self::Pong)
            }
            VERB_END_TASK => {
                let report = decode_completion(&mut tokens)?;
                tokens.finish("END_TASK")?;
                Ok(Self::TaskEnd(report))
            }
            verb => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }

    fn encode_line(&self) -> String {
        match self {
            Self::Pong => VERB_PONG.to_string(),
            Self::TaskEnd(report) => encode_completion(report),
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode_line())
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode_line())
    }
}

/// Positional cursor over the whitespace-split tokens of one line.
struct Tokens<'a> {
    items: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Result<Self, ProtocolError> {
        let items: Vec<&str> = line.split_whitespace().collect();
        if items.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(Self { items, pos: 0 })
    }

    fn verb(&mut self) -> Result<&'a str, ProtocolError> {
        self.next("verb")
    }

    fn next(&mut self, context: &'static str) -> Result<&'a str, ProtocolError> {
        let token = self
            .items
            .get(self.pos)
            .copied()
            .ok_or(ProtocolError::TokenCount { context, needed: 1 })?;
        self.pos += 1;
        Ok(token)
    }

    fn next_u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| ProtocolError::MalformedNumber {
            field,
            token: token.to_string(),
        })
    }

    fn next_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| ProtocolError::MalformedNumber {
            field,
            token: token.to_string(),
        })
    }

    fn next_i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| ProtocolError::MalformedNumber {
            field,
            token: token.to_string(),
        })
    }

    fn next_usize(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| ProtocolError::MalformedNumber {
            field,
            token: token.to_string(),
        })
    }

    fn next_bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        let token = self.next(field)?;
        match token {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ProtocolError::MalformedBool {
                field,
                token: token.to_string(),
            }),
        }
    }

    fn remaining(&self) -> usize {
        self.items.len() - self.pos
    }

    fn finish(self, context: &'static str) -> Result<(), ProtocolError> {
        if self.pos == self.items.len() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingTokens { context })
        }
    }
}

fn decode_dispatch(tokens: &mut Tokens<'_>) -> Result<DispatchRequest, ProtocolError> {
    let request_id = tokens.next_u64("request id")?;
    let stdout_path = tokens.next("stdout path")?.to_string();
    let stderr_path = tokens.next("stderr path")?.to_string();
    let debug = tokens.next_bool("debug flag")?;
    let num_slaves = tokens.next_u32("num slaves")?;
    let has_target = tokens.next_bool("has target")?;
    let on_failure = OnFailure::from_token(tokens.next("on-failure action")?)?;
    let target_kind = TargetKind::from_token(tokens.next("target kind")?)?;
    let module_or_class = tokens.next("module or class")?.to_string();
    let method_name = tokens.next("method name")?.to_string();
    let target_has_self = tokens.next_bool("target has self")?;

    let num_params = tokens.next_usize("param count")?;
    let mut params = Vec::with_capacity(num_params.min(tokens.remaining()));
    for _ in 0..num_params {
        params.push(decode_param(tokens)?);
    }

    let num_results = tokens.next_usize("result count")?;
    let mut result_bindings = Vec::with_capacity(num_results.min(tokens.remaining()));
    for _ in 0..num_results {
        result_bindings.push(tokens.next("result binding")?.to_string());
    }

    Ok(DispatchRequest {
        request_id,
        stdout_path,
        stderr_path,
        debug,
        num_slaves,
        has_target,
        on_failure,
        target_kind,
        module_or_class,
        method_name,
        target_has_self,
        params,
        result_bindings,
    })
}

fn decode_param(tokens: &mut Tokens<'_>) -> Result<ParamSpec, ProtocolError> {
    let kind = ParamKind::from_code(tokens.next("param type")?)?;
    let stream = StreamRole::from_code(tokens.next("stream role")?)?;
    let prefix = from_null_token(tokens.next("param prefix")?);
    let name = from_null_token(tokens.next("param name")?);

    let value = match kind {
        ParamKind::File => ParamValue::File(tokens.next("file path")?.to_string()),
        ParamKind::ExternalRef => ParamValue::ExternalRef(tokens.next("reference key")?.to_string()),
        ParamKind::Numeric => decode_numeric(tokens.next("numeric literal")?)?,
        ParamKind::Boolean => ParamValue::Bool(tokens.next_bool("boolean literal")?),
        ParamKind::Str => {
            let chunks = tokens.next_usize("string chunk count")?;
            let mut escaped = String::new();
            for _ in 0..chunks {
                escaped.push_str(tokens.next("string chunk")?);
            }
            ParamValue::Str(unescape_string(&escaped)?)
        }
        ParamKind::Null => {
            return Err(ProtocolError::UnknownCode {
                what: "parameter type",
                token: ParamKind::Null.code().to_string(),
            });
        }
    };

    Ok(ParamSpec {
        stream,
        prefix,
        name,
        value,
    })
}

fn decode_completion(tokens: &mut Tokens<'_>) -> Result<CompletionReport, ProtocolError> {
    let request_id = tokens.next_u64("request id")?;
    let exit_status = tokens.next_i32("exit status")?;
    let num_new_values = tokens.next_usize("new value count")?;

    let mut new_values = Vec::with_capacity(num_new_values.min(tokens.remaining()));
    for _ in 0..num_new_values {
        let identity = tokens.next("value identity")?.to_string();
        let kind = ParamKind::from_code(tokens.next("value type")?)?;
        let payload = tokens.next("value payload")?;
        let value = decode_descriptor_payload(kind, payload)?;
        new_values.push(NewValueDescriptor { identity, value });
    }

    let message = if tokens.remaining() > 0 {
        Some(unescape_string(tokens.next("report message")?)?)
    } else {
        None
    };

    Ok(CompletionReport {
        request_id,
        exit_status,
        new_values,
        message,
    })
}

fn decode_descriptor_payload(kind: ParamKind, token: &str) -> Result<ParamValue, ProtocolError> {
    match kind {
        ParamKind::File => Ok(ParamValue::File(token.to_string())),
        ParamKind::ExternalRef => Ok(ParamValue::ExternalRef(token.to_string())),
        ParamKind::Numeric => decode_numeric(token),
        ParamKind::Boolean => match token {
            "true" => Ok(ParamValue::Bool(true)),
            "false" => Ok(ParamValue::Bool(false)),
            _ => Err(ProtocolError::MalformedBool {
                field: "value payload",
                token: token.to_string(),
            }),
        },
        ParamKind::Str => Ok(ParamValue::Str(unescape_string(token)?)),
        ParamKind::Null => Ok(ParamValue::Null),
    }
}

fn encode_dispatch(request: &DispatchRequest) -> String {
    let mut out: Vec<String> = vec![
        VERB_EXECUTE_TASK.to_string(),
        request.request_id.to_string(),
        request.stdout_path.clone(),
        request.stderr_path.clone(),
        request.debug.to_string(),
        request.num_slaves.to_string(),
        request.has_target.to_string(),
        request.on_failure.token().to_string(),
        request.target_kind.token().to_string(),
        request.module_or_class.clone(),
        request.method_name.clone(),
        request.target_has_self.to_string(),
        request.params.len().to_string(),
    ];

    for param in &request.params {
        out.push(param.value.kind().code().to_string());
        out.push(param.stream.code().to_string());
        out.push(to_null_token(&param.prefix));
        out.push(to_null_token(&param.name));
        match &param.value {
            ParamValue::File(path) => out.push(path.clone()),
            ParamValue::ExternalRef(key) => out.push(key.clone()),
            ParamValue::Int(i) => out.push(i.to_string()),
            ParamValue::Long(l) => out.push(l.to_string()),
            ParamValue::Double(d) => out.push(encode_double(*d)),
            ParamValue::Bool(b) => out.push(b.to_string()),
            ParamValue::Str(s) => {
                let chunks = escape_string_chunked(s);
                out.push(chunks.len().to_string());
                out.extend(chunks);
            }
            ParamValue::Null => out.push(NULL_TOKEN.to_string()),
        }
    }

    out.push(request.result_bindings.len().to_string());
    out.extend(request.result_bindings.iter().cloned());

    out.join(" ")
}

fn encode_completion(report: &CompletionReport) -> String {
    let mut out: Vec<String> = vec![
        VERB_END_TASK.to_string(),
        report.request_id.to_string(),
        report.exit_status.to_string(),
        report.new_values.len().to_string(),
    ];

    for descriptor in &report.new_values {
        out.push(descriptor.identity.clone());
        out.push(descriptor.value.kind().code().to_string());
        out.push(encode_descriptor_payload(&descriptor.value));
    }

    if let Some(message) = &report.message {
        out.push(escape_string(message));
    }

    out.join(" ")
}

fn encode_descriptor_payload(value: &ParamValue) -> String {
    match value {
        ParamValue::File(path) => path.clone(),
        ParamValue::ExternalRef(key) => key.clone(),
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Long(l) => l.to_string(),
        ParamValue::Double(d) => encode_double(*d),
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Str(s) => escape_string(s),
        ParamValue::Null => NULL_TOKEN.to_string(),
    }
}

/// Decode a numeric token with explicit overflow promotion: i32, then i64,
/// then IEEE-754 double for anything carrying a decimal point or exponent.
fn decode_numeric(token: &str) -> Result<ParamValue, ProtocolError> {
    if looks_like_double(token) {
        return token
            .parse::<f64>()
            .map(ParamValue::Double)
            .map_err(|_| ProtocolError::MalformedNumber {
                field: "numeric literal",
                token: token.to_string(),
            });
    }
    if let Ok(i) = token.parse::<i32>() {
        return Ok(ParamValue::Int(i));
    }
    token
        .parse::<i64>()
        .map(ParamValue::Long)
        .map_err(|_| ProtocolError::MalformedNumber {
            field: "numeric literal",
            token: token.to_string(),
        })
}

fn looks_like_double(token: &str) -> bool {
    token.contains(['.', 'e', 'E'])
        || matches!(token, "inf" | "-inf" | "NaN" | "-NaN" | "infinity" | "-infinity")
}

/// Doubles are rendered through `{:?}` so an integral double keeps its
/// decimal point and never re-decodes as an integer.
fn encode_double(d: f64) -> String {
    format!("{d:?}")
}

/// Escape a string payload into fixed-width wire tokens: prepend the
/// sentinel, base64 the whole content, chunk the base64 text.
fn escape_string_chunked(s: &str) -> Vec<String> {
    // Base64 output is pure ASCII, so byte chunking never splits a char.
    escape_string(s)
        .into_bytes()
        .chunks(STRING_CHUNK_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

/// Single-token form of the string escape, used for descriptor payloads and
/// report messages.
fn escape_string(s: &str) -> String {
    let mut content = String::with_capacity(s.len() + 1);
    content.push(STRING_SENTINEL);
    content.push_str(s);
    BASE64.encode(content.as_bytes())
}

/// Reverse of the escape: base64-decode, then strip exactly one leading
/// sentinel byte.
fn unescape_string(escaped: &str) -> Result<String, ProtocolError> {
    let bytes = BASE64
        .decode(escaped.as_bytes())
        .map_err(|e| ProtocolError::BadEscape(e.to_string()))?;
    let content =
        String::from_utf8(bytes).map_err(|e| ProtocolError::BadEscape(e.to_string()))?;
    content
        .strip_prefix(STRING_SENTINEL)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::BadEscape("missing string sentinel".to_string()))
}

fn to_null_token(s: &str) -> String {
    if s.is_empty() {
        NULL_TOKEN.to_string()
    } else {
        s.to_string()
    }
}

fn from_null_token(token: &str) -> String {
    if token == NULL_TOKEN {
        String::new()
    } else {
        token.to_string()
    }
}
