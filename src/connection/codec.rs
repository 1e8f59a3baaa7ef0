//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! Every WebSocket text frame is one Engine.IO packet: a type digit followed
//! by its data. `message` packets (`4`) carry a Socket.IO packet, which is a
//! type digit, an optional `/namespace,` prefix, an optional ack id and a
//! JSON body:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000}   engine open
//! 2                                     engine ping (answered with 3)
//! 40                                    socket connect, default namespace
//! 42["jobs_list",{"success":true}]      socket event
//! 44{"message":"unauthorized"}          socket connect_error
//! ```
//!
//! Binary packets (`45`, `46`) are not used by the dashboard server and
//! decode to an error.

use serde_json::Value;

use crate::error::{DashError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Value),
    Close,
    Ping,
    Pong,
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| DashError::Codec("empty engine packet".to_string()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(DashError::Codec(format!(
                "unknown engine packet type {:?}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(data) => format!("0{}", data),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(body) => format!("4{}", body),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        data: Value,
    },
    Ack {
        namespace: String,
        id: u64,
        data: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
}

impl SocketPacket {
    /// Build an event on `namespace` carrying a single payload argument.
    pub fn event(namespace: &str, name: impl Into<String>, data: Value) -> Self {
        SocketPacket::Event {
            namespace: namespace.to_string(),
            id: None,
            name: name.into(),
            data,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn decode(body: &str) -> Result<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| DashError::Codec("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    let ns = &rest[..idx];
                    rest = &rest[idx + 1..];
                    ns.to_string()
                }
                None => {
                    let ns = rest.to_string();
                    rest = "";
                    ns
                }
            }
        } else {
            "/".to_string()
        };

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| DashError::Codec(format!("bad ack id: {}", e)))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let payload: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect {
                namespace,
                data: payload,
            }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut args = match payload {
                    Some(Value::Array(args)) => args,
                    _ => return Err(DashError::Codec("event body is not an array".to_string())),
                };
                if args.is_empty() {
                    return Err(DashError::Codec("event without a name".to_string()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(DashError::Codec(format!(
                            "event name is not a string: {}",
                            other
                        )))
                    }
                };
                let data = match args.len() {
                    0 => Value::Null,
                    1 => args.remove(0),
                    _ => Value::Array(args),
                };
                Ok(SocketPacket::Event {
                    namespace,
                    id,
                    name,
                    data,
                })
            }
            '3' => {
                let id = id.ok_or_else(|| DashError::Codec("ack without id".to_string()))?;
                let data = match payload {
                    Some(Value::Array(args)) => args,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                Ok(SocketPacket::Ack {
                    namespace,
                    id,
                    data,
                })
            }
            '4' => {
                let message = match payload {
                    Some(Value::String(message)) => message,
                    Some(Value::Object(map)) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("connection refused")
                        .to_string(),
                    _ => "connection refused".to_string(),
                };
                Ok(SocketPacket::ConnectError { namespace, message })
            }
            '5' | '6' => Err(DashError::Codec(
                "binary socket packets are not supported".to_string(),
            )),
            other => Err(DashError::Codec(format!(
                "unknown socket packet type {:?}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        let prefix = |kind: char, namespace: &str| {
            if namespace == "/" || namespace.is_empty() {
                kind.to_string()
            } else {
                format!("{}{},", kind, namespace)
            }
        };

        match self {
            SocketPacket::Connect { namespace, data } => {
                let mut out = prefix('0', namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
            SocketPacket::Disconnect { namespace } => prefix('1', namespace),
            SocketPacket::Event {
                namespace,
                id,
                name,
                data,
            } => {
                let mut out = prefix('2', namespace);
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                let args = if data.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), data.clone()])
                };
                out.push_str(&args.to_string());
                out
            }
            SocketPacket::Ack {
                namespace,
                id,
                data,
            } => {
                let mut out = prefix('3', namespace);
                out.push_str(&id.to_string());
                out.push_str(&Value::Array(data.clone()).to_string());
                out
            }
            SocketPacket::ConnectError { namespace, message } => {
                let mut out = prefix('4', namespace);
                out.push_str(&serde_json::json!({ "message": message }).to_string());
                out
            }
        }
    }

    /// Encode wrapped in an Engine.IO message packet, ready for the wire.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_engine_open() {
        let packet =
            EnginePacket::decode(r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":20000}"#)
                .unwrap();
        match packet {
            EnginePacket::Open(data) => {
                assert_eq!(data["sid"], "abc");
                assert_eq!(data["pingInterval"], 25000);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn decode_engine_control_packets() {
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping);
        assert_eq!(EnginePacket::decode("3").unwrap(), EnginePacket::Pong);
        assert_eq!(EnginePacket::decode("6").unwrap(), EnginePacket::Noop);
        assert_eq!(
            EnginePacket::decode("40").unwrap(),
            EnginePacket::Message("0".to_string())
        );
    }

    #[test]
    fn decode_engine_rejects_garbage() {
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
        assert!(EnginePacket::decode("0not-json").is_err());
    }

    #[test]
    fn pong_encodes_as_three() {
        assert_eq!(EnginePacket::Pong.encode(), "3");
    }

    #[test]
    fn decode_event_with_payload() {
        let packet =
            SocketPacket::decode(r#"2["jobs_list",{"success":true,"count":2}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/".to_string(),
                id: None,
                name: "jobs_list".to_string(),
                data: json!({"success": true, "count": 2}),
            }
        );
    }

    #[test]
    fn decode_event_with_namespace_and_id() {
        let packet = SocketPacket::decode(r#"2/slurm,12["get_jobs"]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/slurm".to_string(),
                id: Some(12),
                name: "get_jobs".to_string(),
                data: Value::Null,
            }
        );
    }

    #[test]
    fn decode_event_with_several_args_collects_them() {
        let packet = SocketPacket::decode(r#"2["pair",1,2]"#).unwrap();
        match packet {
            SocketPacket::Event { data, .. } => assert_eq!(data, json!([1, 2])),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn decode_connect_and_connect_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"xyz"}"#).unwrap(),
            SocketPacket::Connect {
                namespace: "/".to_string(),
                data: Some(json!({"sid": "xyz"})),
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError {
                namespace: "/".to_string(),
                message: "Not authorized".to_string(),
            }
        );
        assert_eq!(
            SocketPacket::decode("1/slurm,").unwrap(),
            SocketPacket::Disconnect {
                namespace: "/slurm".to_string()
            }
        );
    }

    #[test]
    fn decode_socket_rejects_malformed() {
        assert!(SocketPacket::decode("").is_err());
        assert!(SocketPacket::decode(r#"2{"not":"array"}"#).is_err());
        assert!(SocketPacket::decode("2[]").is_err());
        assert!(SocketPacket::decode("2[42]").is_err());
        assert!(SocketPacket::decode("3[1]").is_err());
        assert!(SocketPacket::decode(r#"51-["bin",{}]"#).is_err());
    }

    #[test]
    fn encode_event_frames() {
        let frame = SocketPacket::event("/", "get_jobs", Value::Null).to_frame();
        assert_eq!(frame, r#"42["get_jobs"]"#);

        let frame = SocketPacket::event("/slurm", "get_job", json!({"job_id": "7"})).to_frame();
        assert_eq!(frame, r#"42/slurm,["get_job",{"job_id":"7"}]"#);
    }

    #[test]
    fn encode_connect_for_default_and_custom_namespace() {
        let default_ns = SocketPacket::Connect {
            namespace: "/".to_string(),
            data: None,
        };
        assert_eq!(default_ns.to_frame(), "40");

        let custom = SocketPacket::Connect {
            namespace: "/slurm".to_string(),
            data: None,
        };
        assert_eq!(custom.to_frame(), "40/slurm,");
        assert_eq!(
            SocketPacket::Disconnect {
                namespace: "/".to_string()
            }
            .to_frame(),
            "41"
        );
    }
}
