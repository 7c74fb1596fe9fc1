//! # Wire Codec
//!
//! Purpose: Encode caller commands as single-line text frames and classify
//! inbound lines as responses or push notifications.
//!
//! ## Design Principles
//! 1. **Flat Text Frames**: One command per line, verb first, tokens separated
//!    by single spaces. Absent or empty optional arguments are omitted rather
//!    than emitted as empty tokens.
//! 2. **Validate Before Write**: A newline inside an argument would split the
//!    frame on the wire, so it is rejected before anything is sent.
//! 3. **Context-Driven Classification**: The wire carries no request tag. A
//!    line is attributed to the pending request unless it is recognisably a
//!    push for an active subscription.
//!
//! ## Wire Summary
//!
//! ```text
//! client -> server   {"username":"u","password":"p"}        (first line)
//! server -> client   MginDB server connected... Welcome!    (or error text)
//! client -> server   SET key value | QUERY key [query] [options] | SUB key ...
//! server -> client   <response line>                        (one per command)
//! server -> client   {"key":"users:1","data":{...}}         (push, any time)
//! server -> client   {"command":"SET a 1","sid":"..."}      (MONITOR push)
//! ```

use serde_json::Value;

use crate::error::{MginError, MginResult};
use crate::types::{AuthPayload, PushNotification};

/// Exact line the server sends after a successful handshake.
pub const WELCOME_LINE: &str = "MginDB server connected... Welcome!";

/// Acknowledgment text for `SUB` and `UNSUB`.
pub const ACK_OK: &str = "OK";

/// Pseudo-key under which the server streams every executed command.
pub const MONITOR_KEY: &str = "MONITOR";

/// A typed MginDB command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Incr { key: String, delta: String },
    Decr { key: String, delta: String },
    Del { key: String },
    Query {
        key: String,
        query: Option<String>,
        options: Option<String>,
    },
    Count { key: String },
    Indices {
        action: String,
        key: Option<String>,
        value: Option<String>,
    },
    Schedule {
        action: String,
        cron_or_key: Option<String>,
        command: Option<String>,
    },
    Sub { key: String },
    Unsub { key: String },
    Keys,
    Rename { key: String, new_key: String },
    SubList,
    /// Any other server verb, written verbatim.
    Raw(String),
}

impl Command {
    /// Returns the verb token written first on the wire.
    pub fn verb(&self) -> &str {
        match self {
            Command::Set { .. } => "SET",
            Command::Incr { .. } => "INCR",
            Command::Decr { .. } => "DECR",
            Command::Del { .. } => "DEL",
            Command::Query { .. } => "QUERY",
            Command::Count { .. } => "COUNT",
            Command::Indices { .. } => "INDICES",
            Command::Schedule { .. } => "SCHEDULE",
            Command::Sub { .. } => "SUB",
            Command::Unsub { .. } => "UNSUB",
            Command::Keys => "KEYS",
            Command::Rename { .. } => "RENAME",
            Command::SubList => "SUBLIST",
            Command::Raw(line) => line.split_whitespace().next().unwrap_or(""),
        }
    }

    /// Checks required arguments and frame safety for every argument.
    pub fn validate(&self) -> MginResult<()> {
        match self {
            Command::Set { key, value } => {
                validate_key("key", key)?;
                validate_required("value", value)
            }
            Command::Incr { key, delta } | Command::Decr { key, delta } => {
                validate_key("key", key)?;
                validate_required("delta", delta)
            }
            Command::Del { key } | Command::Count { key } => validate_key("key", key),
            Command::Sub { key } | Command::Unsub { key } => {
                validate_key("key", key)?;
                subscription_keys(key).map(|_| ())
            }
            Command::Query {
                key,
                query,
                options,
            } => {
                validate_key("key", key)?;
                validate_optional("query", query.as_deref())?;
                validate_optional("options", options.as_deref())
            }
            Command::Indices { action, key, value } => {
                validate_key("action", action)?;
                validate_optional("key", key.as_deref())?;
                validate_optional("value", value.as_deref())
            }
            Command::Schedule {
                action,
                cron_or_key,
                command,
            } => {
                validate_key("action", action)?;
                validate_optional("cron_or_key", cron_or_key.as_deref())?;
                validate_optional("command", command.as_deref())
            }
            Command::Rename { key, new_key } => {
                validate_key("key", key)?;
                validate_key("new_key", new_key)
            }
            Command::Keys | Command::SubList => Ok(()),
            Command::Raw(line) => validate_required("command", line.trim()),
        }
    }

    /// Builds the wire frame (without the trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Command::Set { key, value } => encode("SET", &[Some(key), Some(value)]),
            Command::Incr { key, delta } => encode("INCR", &[Some(key), Some(delta)]),
            Command::Decr { key, delta } => encode("DECR", &[Some(key), Some(delta)]),
            Command::Del { key } => encode("DEL", &[Some(key)]),
            Command::Query {
                key,
                query,
                options,
            } => encode(
                "QUERY",
                &[Some(key), query.as_deref(), options.as_deref()],
            ),
            Command::Count { key } => encode("COUNT", &[Some(key)]),
            Command::Indices { action, key, value } => encode(
                "INDICES",
                &[Some(action), key.as_deref(), value.as_deref()],
            ),
            Command::Schedule {
                action,
                cron_or_key,
                command,
            } => encode(
                "SCHEDULE",
                &[Some(action), cron_or_key.as_deref(), command.as_deref()],
            ),
            Command::Sub { key } => encode("SUB", &[Some(key)]),
            Command::Unsub { key } => encode("UNSUB", &[Some(key)]),
            Command::Keys => encode("KEYS", &[]),
            Command::Rename { key, new_key } => {
                encode("RENAME", &[Some(key), Some("TO"), Some(new_key)])
            }
            Command::SubList => encode("SUBLIST", &[]),
            Command::Raw(line) => line.trim().to_string(),
        }
    }
}

/// Joins the verb and every present, non-empty argument with single spaces.
pub fn encode(verb: &str, args: &[Option<&str>]) -> String {
    let len = verb.len() + args.iter().flatten().map(|arg| arg.len() + 1).sum::<usize>();
    let mut frame = String::with_capacity(len);
    frame.push_str(verb);
    for arg in args.iter().flatten() {
        if arg.is_empty() {
            continue;
        }
        frame.push(' ');
        frame.push_str(arg);
    }
    frame
}

/// Serializes the handshake credential record as one JSON line.
pub fn encode_auth(payload: &AuthPayload) -> MginResult<String> {
    Ok(serde_json::to_string(payload)?)
}

/// A key-like token: non-empty and free of whitespace.
pub fn validate_key(name: &str, value: &str) -> MginResult<()> {
    if value.is_empty() {
        return Err(MginError::InvalidArgument(format!("{name} must not be empty")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(MginError::InvalidArgument(format!(
            "{name} must not contain whitespace"
        )));
    }
    Ok(())
}

/// Splits a `SUB`/`UNSUB` argument into the keys it names.
///
/// The server treats the argument as a comma-separated list, so `a,b`
/// subscribes `a` and `b` separately. Empty entries are rejected.
pub fn subscription_keys(arg: &str) -> MginResult<Vec<&str>> {
    let keys: Vec<&str> = arg.split(',').map(str::trim).collect();
    if keys.iter().any(|key| key.is_empty()) {
        return Err(MginError::InvalidArgument(format!(
            "subscription list {arg:?} has an empty entry"
        )));
    }
    Ok(keys)
}

/// Any argument: must not contain a line break.
pub fn validate_arg(name: &str, value: &str) -> MginResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(MginError::InvalidArgument(format!(
            "{name} must not contain line breaks"
        )));
    }
    Ok(())
}

fn validate_required(name: &str, value: &str) -> MginResult<()> {
    if value.is_empty() {
        return Err(MginError::InvalidArgument(format!("{name} must not be empty")));
    }
    validate_arg(name, value)
}

fn validate_optional(name: &str, value: Option<&str>) -> MginResult<()> {
    match value {
        Some(value) => validate_arg(name, value),
        None => Ok(()),
    }
}

/// One classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Answer to the pending request.
    Response(String),
    /// Update for a subscribed key.
    Push(PushNotification),
    /// Neither a response nor a recognisable push.
    Unexpected(String),
}

/// Connection-side facts the classifier needs.
pub trait ClassifyContext {
    /// Is a request waiting for its response right now?
    fn has_pending(&self) -> bool;
    /// Does `key` match any active subscription?
    fn is_subscribed(&self, key: &str) -> bool;
}

/// Classifies one inbound line.
///
/// A push for an active subscription wins even while a request is pending;
/// any other line answers the pending request. With nothing pending, a
/// push-shaped line is handed to the router and anything else is unexpected.
pub fn classify<C: ClassifyContext + ?Sized>(line: String, ctx: &C) -> Frame {
    let push = parse_push(&line);
    match push {
        Some(push) if ctx.is_subscribed(&push.key) => Frame::Push(push),
        _ if ctx.has_pending() => Frame::Response(line),
        Some(push) => Frame::Push(push),
        None => Frame::Unexpected(line),
    }
}

/// Parses the server's push formats: `{"key", "data"}` for key updates and
/// `{"command", "sid"}` for monitor pushes. Objects with any other shape are
/// not pushes.
pub fn parse_push(line: &str) -> Option<PushNotification> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let Value::Object(mut object) = serde_json::from_str::<Value>(trimmed).ok()? else {
        return None;
    };
    if object.len() != 2 {
        return None;
    }

    if object.contains_key("data") {
        let Some(Value::String(key)) = object.remove("key") else {
            return None;
        };
        let data = object.remove("data").unwrap_or(Value::Null);
        return Some(PushNotification {
            key,
            data,
            raw: line.to_string(),
        });
    }

    if object.contains_key("command") && object.contains_key("sid") {
        return Some(PushNotification {
            key: MONITOR_KEY.to_string(),
            data: Value::Object(object),
            raw: line.to_string(),
        });
    }

    None
}

/// Returns true when a subscription to `pattern` receives pushes for `key`.
///
/// The server notifies exact subscribers plus the wildcard expansions of the
/// key's `:`-separated prefixes: for `a:b:c` these are `a:*`, `a:b:*`,
/// `a:b:c:*`, `a:*:*` and `a:b:*:*`.
pub fn subscription_matches(pattern: &str, key: &str) -> bool {
    if pattern == key {
        return true;
    }
    let Some(prefix) = pattern.strip_suffix(":*") else {
        return false;
    };
    let (prefix, deeper) = match prefix.strip_suffix(":*") {
        Some(inner) => (inner, true),
        None => (prefix, false),
    };
    if prefix.is_empty() {
        return false;
    }

    let parts = key.split(':').count();
    let prefix_parts = prefix.split(':').count();
    let is_prefix = key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b':'));
    if !is_prefix {
        return false;
    }
    if deeper {
        // `p:*:*` is generated only for strict prefixes of the key.
        prefix_parts < parts
    } else {
        prefix_parts <= parts
    }
}
