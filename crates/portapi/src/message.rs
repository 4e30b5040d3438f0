//! Wire codec for the pipe-delimited database API frames.
//!
//! A frame is `id|type` followed by type-specific fields:
//!
//! | type | trailing fields |
//! |---|---|
//! | `error`, `warning` | `\|message` |
//! | `ok`, `upd`, `new`, `create`, `update`, `insert` | `\|key\|payload` |
//! | `del`, `get`, `delete` | `\|key` |
//! | `query`, `sub`, `qsub` | `\|query <query>` |
//! | `done`, `success`, `cancel` | none |
//!
//! Payloads starting with `J` carry JSON, anything else is passed through as
//! a plain string.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '|';
const JSON_MARKER: char = 'J';
const QUERY_PREFIX: &str = "query ";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame has no id")]
    MissingId,

    #[error("frame {0} has no type")]
    MissingType(String),

    #[error("frame {id} ({kind}) is missing its {field}")]
    MissingField {
        id: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("frame {id} has unknown type {kind:?}")]
    UnknownType { id: String, kind: String },

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    /// Decode the payload into `T`. Raw payloads decode as a JSON string.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Raw(raw) => T::deserialize(Value::String(raw.clone())),
        }
    }

    /// Borrow the payload as a JSON value, if it is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    fn parse(segment: &str) -> Result<Self, DecodeError> {
        match segment.strip_prefix(JSON_MARKER) {
            Some(blob) => Ok(Self::Json(serde_json::from_str(blob)?)),
            None => Ok(Self::Raw(segment.to_owned())),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => write!(f, "{JSON_MARKER}{value}"),
            Self::Raw(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get,
    Query,
    Subscribe,
    QuerySubscribe,
    Create,
    Update,
    Insert,
    Delete,
    Cancel,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Query => "query",
            Self::Subscribe => "sub",
            Self::QuerySubscribe => "qsub",
            Self::Create => "create",
            Self::Update => "update",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Cancel => "cancel",
        }
    }

    /// Only these kinds are told about an early unsubscribe.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Query | Self::Subscribe | Self::QuerySubscribe)
    }

    pub fn is_subscription(self) -> bool {
        matches!(self, Self::Subscribe | Self::QuerySubscribe)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get { key: String },
    Query { query: String },
    Subscribe { query: String },
    QuerySubscribe { query: String },
    Create { key: String, data: Payload },
    Update { key: String, data: Payload },
    Insert { key: String, data: Payload },
    Delete { key: String },
    Cancel,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Get { .. } => RequestKind::Get,
            Self::Query { .. } => RequestKind::Query,
            Self::Subscribe { .. } => RequestKind::Subscribe,
            Self::QuerySubscribe { .. } => RequestKind::QuerySubscribe,
            Self::Create { .. } => RequestKind::Create,
            Self::Update { .. } => RequestKind::Update,
            Self::Insert { .. } => RequestKind::Insert,
            Self::Delete { .. } => RequestKind::Delete,
            Self::Cancel => RequestKind::Cancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok { key: String, data: Payload },
    Update { key: String, data: Payload },
    New { key: String, data: Payload },
    Delete { key: String },
    Success,
    Error(String),
    Warning(String),
    Done,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Update { .. } => "upd",
            Self::New { .. } => "new",
            Self::Delete { .. } => "del",
            Self::Success => "success",
            Self::Error(_) => "error",
            Self::Warning(_) => "warning",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub body: Body,
}

impl Message {
    pub fn request(id: impl Into<String>, request: Request) -> Self {
        Self {
            id: id.into(),
            body: Body::Request(request),
        }
    }

    pub fn reply(id: impl Into<String>, reply: Reply) -> Self {
        Self {
            id: id.into(),
            body: Body::Reply(reply),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.body {
            Body::Request(request) => request.kind().as_str(),
            Body::Reply(reply) => reply.as_str(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.id, self.kind())?;
        match &self.body {
            Body::Reply(Reply::Error(message) | Reply::Warning(message)) => {
                write!(f, "{SEPARATOR}{message}")
            }
            Body::Reply(
                Reply::Ok { key, data } | Reply::Update { key, data } | Reply::New { key, data },
            )
            | Body::Request(
                Request::Create { key, data }
                | Request::Update { key, data }
                | Request::Insert { key, data },
            ) => write!(f, "{SEPARATOR}{key}{SEPARATOR}{data}"),
            Body::Reply(Reply::Delete { key })
            | Body::Request(Request::Get { key } | Request::Delete { key }) => {
                write!(f, "{SEPARATOR}{key}")
            }
            Body::Request(
                Request::Query { query }
                | Request::Subscribe { query }
                | Request::QuerySubscribe { query },
            ) => write!(f, "{SEPARATOR}{QUERY_PREFIX}{query}"),
            Body::Reply(Reply::Done | Reply::Success) | Body::Request(Request::Cancel) => Ok(()),
        }
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(frame: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = frame.split(SEPARATOR).collect();

        let id = match parts.first() {
            Some(id) if !id.is_empty() => (*id).to_owned(),
            _ => return Err(DecodeError::MissingId),
        };
        let Some(&kind) = parts.get(1) else {
            return Err(DecodeError::MissingType(id));
        };

        let missing = |kind: &'static str, field: &'static str| DecodeError::MissingField {
            id: id.clone(),
            kind,
            field,
        };
        // Messages and payloads may themselves contain the separator.
        let rest_from = |index: usize| (parts.len() > index).then(|| parts[index..].join("|"));

        let body = match kind {
            "done" => Body::Reply(Reply::Done),
            "success" => Body::Reply(Reply::Success),
            "cancel" => Body::Request(Request::Cancel),
            "error" => Body::Reply(Reply::Error(
                rest_from(2).ok_or_else(|| missing("error", "message"))?,
            )),
            "warning" => Body::Reply(Reply::Warning(
                rest_from(2).ok_or_else(|| missing("warning", "message"))?,
            )),
            "ok" | "upd" | "new" | "create" | "update" | "insert" => {
                let static_kind = data_kind_name(kind);
                let key = parts
                    .get(2)
                    .map(|key| (*key).to_owned())
                    .ok_or_else(|| missing(static_kind, "key"))?;
                let data = Payload::parse(
                    &rest_from(3).ok_or_else(|| missing(static_kind, "payload"))?,
                )?;
                match kind {
                    "ok" => Body::Reply(Reply::Ok { key, data }),
                    "upd" => Body::Reply(Reply::Update { key, data }),
                    "new" => Body::Reply(Reply::New { key, data }),
                    "create" => Body::Request(Request::Create { key, data }),
                    "update" => Body::Request(Request::Update { key, data }),
                    _ => Body::Request(Request::Insert { key, data }),
                }
            }
            "del" | "get" | "delete" => {
                let key = parts
                    .get(2)
                    .map(|key| (*key).to_owned())
                    .ok_or_else(|| missing(key_kind_name(kind), "key"))?;
                match kind {
                    "del" => Body::Reply(Reply::Delete { key }),
                    "get" => Body::Request(Request::Get { key }),
                    _ => Body::Request(Request::Delete { key }),
                }
            }
            "query" | "sub" | "qsub" => {
                let raw: &str = parts
                    .get(2)
                    .copied()
                    .ok_or_else(|| missing(query_kind_name(kind), "query"))?;
                let query = raw.strip_prefix(QUERY_PREFIX).unwrap_or(raw).to_owned();
                match kind {
                    "query" => Body::Request(Request::Query { query }),
                    "sub" => Body::Request(Request::Subscribe { query }),
                    _ => Body::Request(Request::QuerySubscribe { query }),
                }
            }
            other => {
                return Err(DecodeError::UnknownType {
                    id,
                    kind: other.to_owned(),
                });
            }
        };

        Ok(Self { id, body })
    }
}

fn data_kind_name(kind: &str) -> &'static str {
    match kind {
        "ok" => "ok",
        "upd" => "upd",
        "new" => "new",
        "create" => "create",
        "update" => "update",
        _ => "insert",
    }
}

fn key_kind_name(kind: &str) -> &'static str {
    match kind {
        "del" => "del",
        "get" => "get",
        _ => "delete",
    }
}

fn query_kind_name(kind: &str) -> &'static str {
    match kind {
        "query" => "query",
        "sub" => "sub",
        _ => "qsub",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn payload_to_string() {
        assert_eq!(Payload::Json(json!({})).to_string(), "J{}");
        assert_eq!(
            Payload::Raw("some unknown content".into()).to_string(),
            "some unknown content"
        );
    }

    #[test]
    fn payload_decodes_json_and_raw() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Test {
            a: i64,
            s: String,
        }

        let payload = Payload::parse(r#"J{"a": 100, "s": "string"}"#).unwrap();
        assert_eq!(
            payload.decode::<Test>().unwrap(),
            Test {
                a: 100,
                s: "string".into()
            }
        );

        let raw = Payload::parse("plain").unwrap();
        assert_eq!(raw.decode::<String>().unwrap(), "plain");
    }

    #[test]
    fn encodes_every_shape() {
        let cases = [
            (Message::reply("1", Reply::Done), "1|done"),
            (Message::reply("2", Reply::Success), "2|success"),
            (Message::reply("3", Reply::Error("boom".into())), "3|error|boom"),
            (
                Message::reply(
                    "4",
                    Reply::Ok {
                        key: "network:c1".into(),
                        data: Payload::Json(json!({"a": 1})),
                    },
                ),
                r#"4|ok|network:c1|J{"a":1}"#,
            ),
            (
                Message::reply(
                    "5",
                    Reply::Delete {
                        key: "network:c1".into(),
                    },
                ),
                "5|del|network:c1",
            ),
            (
                Message::request(
                    "6",
                    Request::QuerySubscribe {
                        query: "network:".into(),
                    },
                ),
                "6|qsub|query network:",
            ),
            (Message::request("7", Request::Cancel), "7|cancel"),
            (
                Message::request(
                    "8",
                    Request::Get {
                        key: "core:profiles/local/x".into(),
                    },
                ),
                "8|get|core:profiles/local/x",
            ),
        ];

        for (message, frame) in cases {
            assert_eq!(message.to_string(), frame);
        }
    }

    #[test]
    fn decodes_payload_containing_separator() {
        let message: Message = r#"10|upd|some:key|J{"msg":"a|b|c"}"#.parse().unwrap();
        assert_eq!(
            message,
            Message::reply(
                "10",
                Reply::Update {
                    key: "some:key".into(),
                    data: Payload::Json(json!({"msg": "a|b|c"})),
                }
            )
        );
    }

    #[test]
    fn decode_errors_are_typed() {
        assert!(matches!("".parse::<Message>(), Err(DecodeError::MissingId)));
        assert!(matches!("1".parse::<Message>(), Err(DecodeError::MissingType(id)) if id == "1"));
        assert!(matches!(
            "1|ok|key".parse::<Message>(),
            Err(DecodeError::MissingField { field: "payload", .. })
        ));
        assert!(matches!(
            "1|ok|key|J{not json".parse::<Message>(),
            Err(DecodeError::InvalidPayload(_))
        ));
        assert!(matches!(
            "7|bogus".parse::<Message>(),
            Err(DecodeError::UnknownType { id, kind }) if id == "7" && kind == "bogus"
        ));
    }

    #[test]
    fn query_prefix_is_optional_on_decode() {
        let message: Message = "3|sub|network:".parse().unwrap();
        assert_eq!(
            message.body,
            Body::Request(Request::Subscribe {
                query: "network:".into()
            })
        );
    }

    fn text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9:/._ -]{1,24}"
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z|\"\\\\ ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::collection::btree_map("[a-zA-Z|]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect()))
        })
    }

    fn payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            json_value().prop_map(Payload::Json),
            "[a-zA-IK-Z0-9][a-zA-Z0-9|]{0,16}".prop_map(Payload::Raw),
        ]
    }

    fn body() -> impl Strategy<Value = Body> {
        prop_oneof![
            text().prop_map(|key| Body::Request(Request::Get { key })),
            text().prop_map(|query| Body::Request(Request::Query { query })),
            text().prop_map(|query| Body::Request(Request::Subscribe { query })),
            text().prop_map(|query| Body::Request(Request::QuerySubscribe { query })),
            (text(), payload())
                .prop_map(|(key, data)| Body::Request(Request::Create { key, data })),
            (text(), payload())
                .prop_map(|(key, data)| Body::Request(Request::Update { key, data })),
            (text(), payload())
                .prop_map(|(key, data)| Body::Request(Request::Insert { key, data })),
            text().prop_map(|key| Body::Request(Request::Delete { key })),
            Just(Body::Request(Request::Cancel)),
            (text(), payload()).prop_map(|(key, data)| Body::Reply(Reply::Ok { key, data })),
            (text(), payload()).prop_map(|(key, data)| Body::Reply(Reply::Update { key, data })),
            (text(), payload()).prop_map(|(key, data)| Body::Reply(Reply::New { key, data })),
            text().prop_map(|key| Body::Reply(Reply::Delete { key })),
            Just(Body::Reply(Reply::Success)),
            "[a-z| ]{0,20}".prop_map(|m| Body::Reply(Reply::Error(m))),
            "[a-z| ]{0,20}".prop_map(|m| Body::Reply(Reply::Warning(m))),
            Just(Body::Reply(Reply::Done)),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(id in 1u64..u64::MAX, body in body()) {
            let message = Message { id: id.to_string(), body };
            let decoded: Message = message.to_string().parse().unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
