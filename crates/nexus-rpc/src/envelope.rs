//! Request and response envelopes
//!
//! ```text
//! -> {"id":1,"method":"subscription","params":{"path":"post.onAdd","input":null,"lastEventId":"3"}}
//! <- {"id":1,"result":{"type":"started"}}
//! <- {"id":1,"result":{"type":"data","id":"4","data":{"id":"4","data":{"title":"a"}}}}
//! -> {"id":1,"method":"subscription.stop"}
//! <- {"id":1,"result":{"type":"stopped"}}
//! <- {"id":2,"error":{"code":-32004,"message":"...","data":{"code":"NOT_FOUND","httpStatus":404}}}
//! ```

use crate::error::{ErrorConfig, ErrorShape, RpcError};
use crate::middleware::ProcedureType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Caller-chosen id correlating requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeId {
    Number(i64),
    String(String),
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EnvelopeId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for EnvelopeId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<&str> for EnvelopeId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// The procedure kind a call method targets; `None` for control methods.
    pub fn procedure_type(self) -> Option<ProcedureType> {
        match self {
            Self::Query => Some(ProcedureType::Query),
            Self::Mutation => Some(ProcedureType::Mutation),
            Self::Subscription => Some(ProcedureType::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Last event id the caller saw, for resuming a subscription
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: Option<EnvelopeId>,
    pub method: Method,
    #[serde(default)]
    pub params: RequestParams,
}

impl RequestEnvelope {
    pub fn call(id: impl Into<EnvelopeId>, kind: ProcedureType, path: impl Into<String>, input: Value) -> Self {
        let method = match kind {
            ProcedureType::Query => Method::Query,
            ProcedureType::Mutation => Method::Mutation,
            ProcedureType::Subscription => Method::Subscription,
        };
        Self {
            id: Some(id.into()),
            method,
            params: RequestParams {
                path: path.into(),
                input: Some(input),
                last_event_id: None,
            },
        }
    }

    pub fn stop(id: impl Into<EnvelopeId>) -> Self {
        Self {
            id: Some(id.into()),
            method: Method::SubscriptionStop,
            params: RequestParams::default(),
        }
    }

    #[must_use = "This method returns a new RequestEnvelope and does not modify self"]
    pub fn with_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.params.last_event_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Started,
    Stopped,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "type")]
    pub kind: ResultType,
    /// Tracked event id of a subscription element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(ResultPayload),
    Error(ErrorShape),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Option<EnvelopeId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn data(id: Option<EnvelopeId>, data: Value) -> Self {
        Self::result(id, ResultType::Data, None, Some(data))
    }

    /// A tracked element carries its event id twice: on the result, and
    /// wrapped with the payload as `{id, data}`.
    pub fn tracked(id: Option<EnvelopeId>, event_id: String, data: Value) -> Self {
        let wrapped = serde_json::json!({ "id": event_id.clone(), "data": data });
        Self::result(id, ResultType::Data, Some(event_id), Some(wrapped))
    }

    pub fn started(id: Option<EnvelopeId>) -> Self {
        Self::result(id, ResultType::Started, None, None)
    }

    pub fn stopped(id: Option<EnvelopeId>) -> Self {
        Self::result(id, ResultType::Stopped, None, None)
    }

    pub fn error(id: Option<EnvelopeId>, error: &RpcError, config: &ErrorConfig) -> Self {
        Self {
            id,
            body: ResponseBody::Error(ErrorShape::from_error(error, config)),
        }
    }

    fn result(
        id: Option<EnvelopeId>,
        kind: ResultType,
        event_id: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id,
            body: ResponseBody::Result(ResultPayload {
                kind,
                id: event_id,
                data,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }

    /// The result type of a success envelope.
    pub fn result_type(&self) -> Option<ResultType> {
        match &self.body {
            ResponseBody::Result(payload) => Some(payload.kind),
            ResponseBody::Error(_) => None,
        }
    }

    /// The error carried by a failure envelope.
    pub fn into_error(self) -> Option<RpcError> {
        match self.body {
            ResponseBody::Error(shape) => Some(shape.into_error()),
            ResponseBody::Result(_) => None,
        }
    }
}

/// Parse an inbound text frame holding one envelope or an array of them.
pub fn parse_requests(text: &str) -> Result<Vec<RequestEnvelope>, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<RequestEnvelope>),
        One(RequestEnvelope),
    }
    Ok(match serde_json::from_str::<OneOrMany>(text)? {
        OneOrMany::Many(requests) => requests,
        OneOrMany::One(request) => vec![request],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_form() {
        let req: RequestEnvelope = serde_json::from_value(json!({
            "id": 1,
            "method": "subscription",
            "params": {"path": "post.onAdd", "lastEventId": "3"}
        }))
        .unwrap();
        assert_eq!(req.id, Some(EnvelopeId::Number(1)));
        assert_eq!(req.method.procedure_type(), Some(ProcedureType::Subscription));
        assert_eq!(req.params.last_event_id.as_deref(), Some("3"));
        assert_eq!(req.params.input, None);

        let stop: RequestEnvelope =
            serde_json::from_value(json!({"id": "a", "method": "subscription.stop"})).unwrap();
        assert_eq!(stop.method, Method::SubscriptionStop);
    }

    #[test]
    fn test_response_wire_form() {
        let ok = ResponseEnvelope::tracked(Some(1.into()), "4".to_string(), json!({"n": 4}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 1, "result": {"type": "data", "id": "4", "data": {"id": "4", "data": {"n": 4}}}})
        );

        let err = ResponseEnvelope::error(
            None,
            &RpcError::not_found("gone"),
            &ErrorConfig::production(),
        );
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["id"], Value::Null);
        assert_eq!(wire["error"]["data"]["httpStatus"], 404);
        assert_eq!(wire["error"]["data"]["code"], "NOT_FOUND");

        let back: ResponseEnvelope = serde_json::from_value(wire).unwrap();
        assert!(back.is_error());
    }

    #[test]
    fn test_parse_batch_frame() {
        let many = parse_requests(
            r#"[{"id":1,"method":"query","params":{"path":"a"}},{"id":2,"method":"subscription.stop"}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        let one = parse_requests(r#"{"id":1,"method":"mutation","params":{"path":"a","input":1}}"#)
            .unwrap();
        assert_eq!(one[0].params.input, Some(json!(1)));
        assert!(parse_requests("{not json").is_err());
    }
}
