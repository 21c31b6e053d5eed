//! The script↔host request/reply protocol.
//!
//! Every host call a script makes is one `coroutine.yield(":tag", args…)`;
//! the host resumes the coroutine with `(status, results…)` where `status`
//! is `"ok"` or an error code (`timeout`, `cancelled`, `not-active`,
//! `invalid-argument`, `io-error`). This module parses yielded multi-values
//! into [`HostRequest`] and encodes [`HostReply`] back into Lua values.

use mlua::{Lua, MultiValue, Table, Value};
use scope_core::LogLevel;
use std::borrow::Cow;
use std::time::Duration;

/// Upper bound on a single `rtt.read`.
pub const MAX_RTT_READ: usize = 1024;

/// A request yielded by a plugin coroutine.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    Log {
        level: LogLevel,
        message: String,
    },
    SerialInfo,
    SerialSend {
        message: Vec<u8>,
    },
    SerialRecv {
        timeout: Option<Duration>,
    },
    SerialConnect {
        port: String,
        baud: u32,
    },
    SerialDisconnect,
    RttInfo,
    RttSend {
        message: Vec<u8>,
    },
    RttRecv {
        timeout: Option<Duration>,
    },
    RttRead {
        address: u64,
        size: usize,
    },
    SysSleep {
        duration: Duration,
    },
    ReMatch {
        text: String,
        pattern: String,
    },
    ReMatches {
        text: String,
        patterns: Vec<String>,
    },
    ReLiteral {
        text: String,
    },
    ShellNew,
    ShellRun {
        session: u64,
        command: String,
        timeout: Option<Duration>,
    },
    ShellExist {
        session: u64,
        program: String,
    },
}

impl HostRequest {
    /// Whether the matching handler may park the task on a completion.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            Self::SerialRecv { .. }
                | Self::RttRecv { .. }
                | Self::RttRead { .. }
                | Self::SysSleep { .. }
                | Self::ShellRun { .. }
                | Self::ShellExist { .. }
        )
    }

    /// Parse the multi-value a coroutine yielded.
    ///
    /// Errors are plain strings: a malformed request fails the task the same
    /// way a script error does.
    pub fn from_yield(values: MultiValue) -> Result<Self, String> {
        let values = values.into_vec();
        let tag = match values.first() {
            Some(Value::String(tag)) => tag
                .to_str()
                .map_err(|_| "request tag is not valid UTF-8".to_string())?
                .to_string(),
            Some(other) => {
                return Err(format!(
                    "request tag must be a string, got {}",
                    other.type_name()
                ));
            }
            None => return Err("coroutine yielded no request".to_string()),
        };

        let arg = |index: usize| -> Result<&Value, String> {
            values
                .get(index)
                .ok_or_else(|| format!("request \"{tag}\" is missing argument #{index}"))
        };

        let req = match tag.as_str() {
            ":log.debug" => Self::log(LogLevel::Debug, arg(1)?),
            ":log.info" => Self::log(LogLevel::Info, arg(1)?),
            ":log.success" => Self::log(LogLevel::Success, arg(1)?),
            ":log.warning" => Self::log(LogLevel::Warning, arg(1)?),
            ":log.error" => Self::log(LogLevel::Error, arg(1)?),
            ":serial.info" => Self::SerialInfo,
            ":serial.send" => Self::SerialSend {
                message: value_to_bytes(arg(1)?)
                    .map_err(|err| format!("\":serial.send\" message: {err}"))?,
            },
            ":serial.recv" => Self::SerialRecv {
                timeout: parse_timeout(arg(1).ok())?,
            },
            ":serial.connect" => Self::SerialConnect {
                port: value_to_text(arg(1)?),
                baud: value_as_u32(arg(2)?)
                    .ok_or_else(|| "\":serial.connect\" baud must be a number".to_string())?,
            },
            ":serial.disconnect" => Self::SerialDisconnect,
            ":rtt.info" => Self::RttInfo,
            ":rtt.send" => Self::RttSend {
                message: value_to_bytes(arg(1)?)
                    .map_err(|err| format!("\":rtt.send\" message: {err}"))?,
            },
            ":rtt.recv" => Self::RttRecv {
                timeout: parse_timeout(arg(1).ok())?,
            },
            ":rtt.read" => {
                let opts = match arg(1)? {
                    Value::Table(opts) => opts,
                    other => {
                        return Err(format!(
                            "\":rtt.read\" expects an options table, got {}",
                            other.type_name()
                        ));
                    }
                };
                Self::RttRead {
                    address: opts
                        .get::<_, u64>("address")
                        .map_err(|_| "\":rtt.read\" requires a numeric 'address'".to_string())?,
                    size: opts
                        .get::<_, usize>("size")
                        .map_err(|_| "\":rtt.read\" requires a numeric 'size'".to_string())?,
                }
            }
            ":sys.sleep" => Self::SysSleep {
                duration: Duration::from_millis(
                    value_as_u64(arg(1)?)
                        .ok_or_else(|| "\":sys.sleep\" expects milliseconds".to_string())?,
                ),
            },
            ":re.match" => Self::ReMatch {
                text: value_to_text(arg(1)?),
                pattern: value_to_text(arg(2)?),
            },
            ":re.matches" => {
                let patterns = match arg(2)? {
                    Value::Table(table) => table
                        .clone()
                        .sequence_values::<String>()
                        .collect::<mlua::Result<Vec<_>>>()
                        .map_err(|_| {
                            "\":re.matches\" pattern sources must be strings".to_string()
                        })?,
                    other => {
                        return Err(format!(
                            "\":re.matches\" expects a pattern list, got {}",
                            other.type_name()
                        ));
                    }
                };
                Self::ReMatches {
                    text: value_to_text(arg(1)?),
                    patterns,
                }
            }
            ":re.literal" => Self::ReLiteral {
                text: value_to_text(arg(1)?),
            },
            ":Shell.new" => Self::ShellNew,
            ":Shell:run" => {
                let opts = match values.get(3) {
                    Some(Value::Table(opts)) => Some(opts.clone()),
                    _ => None,
                };
                Self::ShellRun {
                    session: value_as_u64(arg(1)?)
                        .ok_or_else(|| "\":Shell:run\" lost its session id".to_string())?,
                    command: value_to_text(arg(2)?),
                    timeout: parse_timeout_table(opts)?,
                }
            }
            ":Shell:exist" => Self::ShellExist {
                session: value_as_u64(arg(1)?)
                    .ok_or_else(|| "\":Shell:exist\" lost its session id".to_string())?,
                program: value_to_text(arg(2)?),
            },
            other => return Err(format!("unknown request tag \"{other}\"")),
        };

        Ok(req)
    }

    fn log(level: LogLevel, message: &Value) -> Self {
        Self::Log {
            level,
            message: value_to_text(message),
        }
    }
}

/// One typed field of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyValue {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// The tuple a task is resumed with.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReply {
    pub status: Cow<'static, str>,
    pub values: Vec<ReplyValue>,
}

impl HostReply {
    pub fn ok() -> Self {
        Self {
            status: Cow::Borrowed("ok"),
            values: Vec::new(),
        }
    }

    pub fn ok_with(values: Vec<ReplyValue>) -> Self {
        Self {
            status: Cow::Borrowed("ok"),
            values,
        }
    }

    pub fn status(status: &'static str) -> Self {
        Self {
            status: Cow::Borrowed(status),
            values: Vec::new(),
        }
    }

    pub fn status_with(status: &'static str, values: Vec<ReplyValue>) -> Self {
        Self {
            status: Cow::Borrowed(status),
            values,
        }
    }

    pub fn cancelled() -> Self {
        Self::status("cancelled")
    }

    pub fn timeout() -> Self {
        Self::status("timeout")
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == "cancelled"
    }

    /// Encode as the multi-value the coroutine is resumed with.
    pub fn into_multi<'lua>(self, lua: &'lua Lua) -> mlua::Result<MultiValue<'lua>> {
        let mut out = Vec::with_capacity(self.values.len() + 1);
        out.push(Value::String(lua.create_string(self.status.as_ref())?));
        for value in self.values {
            out.push(match value {
                ReplyValue::Nil => Value::Nil,
                ReplyValue::Bool(b) => Value::Boolean(b),
                ReplyValue::Int(n) => Value::Integer(n),
                ReplyValue::Str(s) => Value::String(lua.create_string(&s)?),
                ReplyValue::Bytes(bytes) => Value::Table(bytes_to_table(lua, &bytes)?),
            });
        }
        Ok(MultiValue::from_vec(out))
    }
}

/// Byte payloads cross the wire as strings or integer sequences; negative
/// integers wrap as `0x100 + v`.
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>, String> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Table(table) => table
            .clone()
            .sequence_values::<i64>()
            .map(|item| {
                item.map(|v| (v & 0xff) as u8)
                    .map_err(|_| "byte array entries must be integers".to_string())
            })
            .collect(),
        other => Err(format!(
            "expected a string or byte array, got {}",
            other.type_name()
        )),
    }
}

/// Encode bytes as the 1-indexed integer sequence scripts receive.
pub fn bytes_to_table<'lua>(lua: &'lua Lua, bytes: &[u8]) -> mlua::Result<Table<'lua>> {
    lua.create_sequence_from(bytes.iter().map(|b| *b as i64))
}

/// Host-side text coercion used by `log.*` and friends: strings pass
/// through, byte arrays decode lossily, nil becomes `"nil"`.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        Value::Table(_) => match value_to_bytes(value) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => "<table>".to_string(),
        },
        other => format!("<{}>", other.type_name()),
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(n) if *n >= 0 => Some(*n as u64),
        Value::Number(n) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    value_as_u64(value).and_then(|n| u32::try_from(n).ok())
}

/// `{timeout_ms = n}` with the deprecated `{timeout = n}` accepted; absent
/// or non-table leaves the deadline to the host's configured cap.
fn parse_timeout(value: Option<&Value>) -> Result<Option<Duration>, String> {
    match value {
        Some(Value::Table(opts)) => parse_timeout_table(Some(opts.clone())),
        _ => Ok(None),
    }
}

fn parse_timeout_table(opts: Option<Table>) -> Result<Option<Duration>, String> {
    let Some(opts) = opts else {
        return Ok(None);
    };
    let ms = match opts.get::<_, Option<u64>>("timeout_ms") {
        Ok(Some(ms)) => Some(ms),
        Ok(None) => opts
            .get::<_, Option<u64>>("timeout")
            .map_err(|_| "'timeout' must be a number of milliseconds".to_string())?,
        Err(_) => return Err("'timeout_ms' must be a number of milliseconds".to_string()),
    };
    Ok(ms.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn yielded<'lua>(lua: &'lua Lua, expr: &str) -> MultiValue<'lua> {
        lua.load(&format!("return {expr}"))
            .eval::<MultiValue>()
            .unwrap()
    }

    #[test]
    fn parses_send_with_string_payload() {
        let lua = Lua::new();
        let req = HostRequest::from_yield(yielded(&lua, "\":serial.send\", \"AT\\r\"")).unwrap();
        assert_eq!(
            req,
            HostRequest::SerialSend {
                message: b"AT\r".to_vec()
            }
        );
    }

    #[test]
    fn parses_send_with_negative_bytes() {
        let lua = Lua::new();
        let req =
            HostRequest::from_yield(yielded(&lua, "\":serial.send\", {-1, 0, 255}")).unwrap();
        assert_eq!(
            req,
            HostRequest::SerialSend {
                message: vec![0xff, 0x00, 0xff]
            }
        );
    }

    #[test]
    fn parses_recv_timeout_and_deprecated_alias() {
        let lua = Lua::new();
        let req =
            HostRequest::from_yield(yielded(&lua, "\":serial.recv\", {timeout_ms = 200}")).unwrap();
        assert_eq!(
            req,
            HostRequest::SerialRecv {
                timeout: Some(Duration::from_millis(200))
            }
        );

        let req =
            HostRequest::from_yield(yielded(&lua, "\":rtt.recv\", {timeout = 50}")).unwrap();
        assert_eq!(
            req,
            HostRequest::RttRecv {
                timeout: Some(Duration::from_millis(50))
            }
        );
    }

    #[test]
    fn recv_without_options_waits_forever() {
        let lua = Lua::new();
        let req = HostRequest::from_yield(yielded(&lua, "\":serial.recv\"")).unwrap();
        assert_eq!(req, HostRequest::SerialRecv { timeout: None });
    }

    #[test]
    fn rejects_unknown_tags_and_missing_args() {
        let lua = Lua::new();
        let err = HostRequest::from_yield(yielded(&lua, "\":serial.transmit\", \"x\"")).unwrap_err();
        assert!(err.contains("unknown request tag"));

        let err = HostRequest::from_yield(yielded(&lua, "\":re.match\", \"abc\"")).unwrap_err();
        assert!(err.contains("missing argument"));
    }

    #[test]
    fn rtt_read_parses_address_and_size() {
        let lua = Lua::new();
        let req = HostRequest::from_yield(yielded(
            &lua,
            "\":rtt.read\", {address = 0x20000000, size = 48}",
        ))
        .unwrap();
        assert_eq!(
            req,
            HostRequest::RttRead {
                address: 0x2000_0000,
                size: 48
            }
        );
    }

    #[test]
    fn reply_encodes_status_first() {
        let lua = Lua::new();
        let reply = HostReply::ok_with(vec![
            ReplyValue::Str("COM3".to_string()),
            ReplyValue::Int(115_200),
        ]);
        let multi = reply.into_multi(&lua).unwrap().into_vec();
        assert!(matches!(&multi[0], Value::String(s) if s.to_str().unwrap() == "ok"));
        assert!(matches!(&multi[2], Value::Integer(115_200)));
    }

    #[test]
    fn reply_bytes_round_trip_through_lua() {
        let lua = Lua::new();
        let reply = HostReply::ok_with(vec![ReplyValue::Bytes(vec![0x31, 0x0a, 0xff])]);
        let multi = reply.into_multi(&lua).unwrap().into_vec();
        let Value::Table(table) = &multi[1] else {
            panic!("expected byte table");
        };
        let back = value_to_bytes(&Value::Table(table.clone())).unwrap();
        assert_eq!(back, vec![0x31, 0x0a, 0xff]);
    }

    #[test]
    fn text_coercion_matches_the_documented_shapes() {
        let lua = Lua::new();
        assert_eq!(value_to_text(&Value::Nil), "nil");
        let bytes = yielded(&lua, "{72, 105}").into_vec();
        assert_eq!(value_to_text(&bytes[0]), "Hi");
    }
}
