//! Dispatcher - one generic handler per schema method, backed by the stub store.

use crate::convert;
use crate::store::StubStore;
use crate::stub::{Fields, Output, Query, StubError};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

/// Inbound headers that describe the transport, not the call.
const TRANSPORT_HEADERS: &[&str] = &[
    ":authority",
    "content-type",
    "grpc-accept-encoding",
    "grpc-encoding",
    "user-agent",
    "accept-encoding",
    "te",
    "grpc-timeout",
];

/// Streaming shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidi,
}

impl CallKind {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => CallKind::Unary,
            (false, true) => CallKind::ServerStreaming,
            (true, false) => CallKind::ClientStreaming,
            (true, true) => CallKind::Bidi,
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Unary => "unary",
            CallKind::ServerStreaming => "server_streaming",
            CallKind::ClientStreaming => "client_streaming",
            CallKind::Bidi => "bidi",
        })
    }
}

/// Route entry for `/services`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    pub path: String,
    pub kind: CallKind,
    pub input: String,
    pub output: String,
}

/// Handler for one schema method.
///
/// Captures the method's descriptors at install time, so a call that is
/// already running keeps using them across a reload.
#[derive(Debug, Clone)]
pub struct MethodHandler {
    service: String,
    method: String,
    kind: CallKind,
    input: MessageDescriptor,
    output: MessageDescriptor,
    store: Arc<StubStore>,
}

impl MethodHandler {
    pub fn new(method: &MethodDescriptor, store: Arc<StubStore>) -> Self {
        Self {
            service: method.parent_service().full_name().to_string(),
            method: method.name().to_string(),
            kind: CallKind::of(method),
            input: method.input(),
            output: method.output(),
            store,
        }
    }

    /// gRPC request path, `/<package.Service>/<Method>`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn input(&self) -> &MessageDescriptor {
        &self.input
    }

    pub fn output(&self) -> &MessageDescriptor {
        &self.output
    }

    fn info(&self) -> MethodInfo {
        MethodInfo {
            path: self.path(),
            kind: self.kind,
            input: self.input.full_name().to_string(),
            output: self.output.full_name().to_string(),
        }
    }

    fn lookup(&self, data: Fields, headers: Fields) -> Result<Output, Status> {
        let query = Query {
            service: self.service.clone(),
            method: self.method.clone(),
            data,
            headers,
        };
        debug!(service = %self.service, method = %self.method, "Dispatching call");
        match self.store.find(&query) {
            Ok(output) => Ok(output),
            Err(err @ StubError::NotFound(_)) => Err(Status::not_found(err.to_string())),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    fn reply(&self, data: &Fields) -> Result<DynamicMessage, Status> {
        convert::value_to_message(data, self.output.clone())
            .map_err(|e| Status::internal(format!("{e:#}")))
    }

    /// One request, one response.
    pub fn unary(
        &self,
        request: DynamicMessage,
        metadata: &MetadataMap,
    ) -> Result<(DynamicMessage, MetadataMap), Status> {
        let output = self.lookup(convert::message_to_value(&request), inbound_headers(metadata))?;
        let headers = outbound_metadata(&output.headers);
        check_failure(&output, &headers)?;
        Ok((self.reply(&output.message())?, headers))
    }

    /// One request; the stub's `stream` list (or `data`) as responses.
    pub fn server_stream(
        &self,
        request: DynamicMessage,
        metadata: &MetadataMap,
    ) -> Result<(Vec<DynamicMessage>, MetadataMap), Status> {
        let output = self.lookup(convert::message_to_value(&request), inbound_headers(metadata))?;
        let headers = outbound_metadata(&output.headers);
        check_failure(&output, &headers)?;
        let replies = output
            .messages()
            .iter()
            .map(|data| self.reply(data))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((replies, headers))
    }

    /// All requests merged into one query, later fields overriding earlier.
    pub fn client_stream(
        &self,
        requests: &[DynamicMessage],
        metadata: &MetadataMap,
    ) -> Result<(DynamicMessage, MetadataMap), Status> {
        let mut data = Fields::new();
        for request in requests {
            data.extend(convert::message_to_value(request));
        }
        let output = self.lookup(data, inbound_headers(metadata))?;
        let headers = outbound_metadata(&output.headers);
        check_failure(&output, &headers)?;
        Ok((self.reply(&output.message())?, headers))
    }

    /// One message of a bidirectional stream, answered on its own.
    pub fn bidi_message(
        &self,
        request: &DynamicMessage,
        headers: &Fields,
    ) -> Result<DynamicMessage, Status> {
        let output = self.lookup(convert::message_to_value(request), headers.clone())?;
        check_failure(&output, &outbound_metadata(&output.headers))?;
        self.reply(&output.message())
    }
}

/// Fail with the stub's canned status, if it has one.
fn check_failure(output: &Output, headers: &MetadataMap) -> Result<(), Status> {
    if !output.is_failure() {
        return Ok(());
    }
    let code = output.code.map_or(Code::Unknown, Code::from_i32);
    Err(Status::with_metadata(
        code,
        output.error.clone(),
        headers.clone(),
    ))
}

/// Call metadata as a header map for stub rules.
///
/// Transport and binary headers are dropped. A key seen once maps to a
/// string, a repeated key to a list of strings.
pub fn inbound_headers(metadata: &MetadataMap) -> Fields {
    let mut headers = Fields::new();
    for entry in metadata.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            continue;
        };
        let key = key.as_str();
        if TRANSPORT_HEADERS.contains(&key) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        let value = Value::String(value.to_string());
        match headers.get_mut(key) {
            None => {
                headers.insert(key.to_string(), value);
            }
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    headers
}

/// Stub output headers as response metadata. Lists become repeated keys.
pub fn outbound_metadata(headers: &Fields) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers {
        let Ok(name) = MetadataKey::<Ascii>::from_bytes(key.to_ascii_lowercase().as_bytes()) else {
            warn!(header = %key, "Skipping invalid response header name");
            continue;
        };
        let values = match value {
            Value::Array(items) => items.iter().map(text).collect(),
            other => vec![text(other)],
        };
        for v in values {
            match MetadataValue::<Ascii>::try_from(v.as_str()) {
                Ok(v) => {
                    metadata.append(name.clone(), v);
                }
                Err(_) => warn!(header = %key, "Skipping invalid response header value"),
            }
        }
    }
    metadata
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Routing table from gRPC path to method handler.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<StubStore>,
    methods: RwLock<Arc<HashMap<String, Arc<MethodHandler>>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<StubStore>) -> Self {
        Self {
            store,
            methods: RwLock::new(Arc::default()),
        }
    }

    pub fn store(&self) -> &Arc<StubStore> {
        &self.store
    }

    /// Build handlers for every method in `pool` and swap them in at once.
    pub fn install(&self, pool: &DescriptorPool) -> usize {
        let mut methods = HashMap::new();
        for service in pool.services() {
            for method in service.methods() {
                let handler = MethodHandler::new(&method, self.store.clone());
                info!(path = %handler.path(), kind = %handler.kind(), "Serving method");
                methods.insert(handler.path(), Arc::new(handler));
            }
        }
        let count = methods.len();
        *self.methods.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(methods);
        count
    }

    fn table(&self) -> Arc<HashMap<String, Arc<MethodHandler>>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn handler(&self, path: &str) -> Option<Arc<MethodHandler>> {
        self.table().get(path).cloned()
    }

    /// Installed methods, sorted by path.
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<MethodInfo> = self.table().values().map(|h| h.info()).collect();
        methods.sort_by(|a, b| a.path.cmp(&b.path));
        methods
    }

    /// Raw single-message call: wire bytes in, wire bytes and metadata out.
    ///
    /// Streaming methods are answered as if unary, with the first payload.
    pub fn dispatch(
        &self,
        service: &str,
        method: &str,
        payload: &[u8],
        metadata: &MetadataMap,
    ) -> Result<(Vec<u8>, MetadataMap), Status> {
        let path = format!("/{service}/{method}");
        let handler = self
            .handler(&path)
            .ok_or_else(|| Status::unimplemented(format!("unknown method {path}")))?;
        let request = convert::decode(handler.input.clone(), payload)
            .map_err(|e| Status::internal(e.to_string()))?;
        let (reply, headers) = handler.unary(request, metadata)?;
        Ok((convert::encode(&reply), headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pool_from_source;
    use prost_reflect::Value as ReflectValue;
    use serde_json::json;

    const USER: &str = r#"
syntax = "proto3";
package user;

message GetUserRequest { int64 id = 1; string tag = 2; }
message User { string name = 1; int64 id = 2; }

service UserService {
  rpc GetUser(GetUserRequest) returns (User);
  rpc ListUsers(GetUserRequest) returns (stream User);
  rpc Upload(stream GetUserRequest) returns (User);
  rpc Chat(stream GetUserRequest) returns (stream User);
}
"#;

    fn setup() -> (Dispatcher, DescriptorPool) {
        let pool = pool_from_source("user.proto", USER);
        let store = Arc::new(StubStore::new());
        let dispatcher = Dispatcher::new(store);
        assert_eq!(dispatcher.install(&pool), 4);
        (dispatcher, pool)
    }

    fn add(dispatcher: &Dispatcher, stub: Value) {
        dispatcher
            .store()
            .add(serde_json::from_value(stub).unwrap())
            .unwrap();
    }

    fn request(pool: &DescriptorPool, id: i64) -> DynamicMessage {
        let desc = pool.get_message_by_name("user.GetUserRequest").unwrap();
        let mut message = DynamicMessage::new(desc);
        message.set_field_by_name("id", ReflectValue::I64(id));
        message
    }

    fn user(pool: &DescriptorPool, payload: &[u8]) -> Fields {
        let desc = pool.get_message_by_name("user.User").unwrap();
        convert::message_to_value(&convert::decode(desc, payload).unwrap())
    }

    #[test]
    fn classifies_call_kinds() {
        let (dispatcher, _) = setup();
        let kinds: Vec<(String, CallKind)> = dispatcher
            .methods()
            .into_iter()
            .map(|m| (m.path, m.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                ("/user.UserService/Chat".to_string(), CallKind::Bidi),
                ("/user.UserService/GetUser".to_string(), CallKind::Unary),
                ("/user.UserService/ListUsers".to_string(), CallKind::ServerStreaming),
                ("/user.UserService/Upload".to_string(), CallKind::ClientStreaming),
            ]
        );

        let handler = dispatcher.handler("/user.UserService/ListUsers").unwrap();
        assert_eq!(handler.service(), "user.UserService");
        assert_eq!(handler.method(), "ListUsers");
    }

    #[test]
    fn dispatch_returns_stub_payload() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService",
                "method": "GetUser",
                "input": {"equals": {"id": 1}},
                "output": {"data": {"name": "John", "id": 1}, "headers": {"x-mock": "yes"}}
            }),
        );

        let payload = convert::encode(&request(&pool, 1));
        let (reply, headers) = dispatcher
            .dispatch("user.UserService", "GetUser", &payload, &MetadataMap::new())
            .unwrap();
        assert_eq!(user(&pool, &reply), json!({"name": "John", "id": 1}).as_object().unwrap().clone());
        assert_eq!(headers.get("x-mock").unwrap(), "yes");
    }

    #[test]
    fn dispatch_not_found_carries_diagnostic() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "UserService",
                "method": "GetUser",
                "input": {"equals": {"id": 1}},
                "output": {"data": {"name": "John"}}
            }),
        );

        let payload = convert::encode(&request(&pool, 2));
        let status = dispatcher
            .dispatch("user.UserService", "GetUser", &payload, &MetadataMap::new())
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("user.UserService"));
        assert!(status.message().contains("GetUser"));
        assert!(status.message().contains("equals:{\n\tid: 1\n}"));
    }

    #[test]
    fn dispatch_canned_errors() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "GetUser",
                "input": {"equals": {"id": 1}},
                "output": {"error": "denied", "code": 7}
            }),
        );
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "GetUser",
                "input": {"equals": {"id": 2}},
                "output": {"error": "boom"}
            }),
        );

        let denied = dispatcher
            .dispatch("user.UserService", "GetUser", &convert::encode(&request(&pool, 1)), &MetadataMap::new())
            .unwrap_err();
        assert_eq!(denied.code(), Code::PermissionDenied);
        assert_eq!(denied.message(), "denied");

        let boom = dispatcher
            .dispatch("user.UserService", "GetUser", &convert::encode(&request(&pool, 2)), &MetadataMap::new())
            .unwrap_err();
        assert_eq!(boom.code(), Code::Unknown);
    }

    #[test]
    fn dispatch_bad_payload_is_internal() {
        let (dispatcher, _) = setup();
        let status = dispatcher
            .dispatch("user.UserService", "GetUser", &[0xff, 0xff, 0xff], &MetadataMap::new())
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn dispatch_bad_stub_output_is_internal() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "GetUser",
                "input": {"contains": {}},
                "output": {"data": {"nope": 1}}
            }),
        );
        let status = dispatcher
            .dispatch("user.UserService", "GetUser", &convert::encode(&request(&pool, 1)), &MetadataMap::new())
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("user.User"));
    }

    #[test]
    fn dispatch_unknown_method_is_unimplemented() {
        let (dispatcher, _) = setup();
        let status = dispatcher
            .dispatch("user.UserService", "Delete", &[], &MetadataMap::new())
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn inbound_headers_drop_transport_and_group_repeats() {
        let mut metadata = MetadataMap::new();
        metadata.insert("content-type", "application/grpc".parse().unwrap());
        metadata.insert("user-agent", "tonic".parse().unwrap());
        metadata.insert("x-team", "core".parse().unwrap());
        metadata.append("x-role", "admin".parse().unwrap());
        metadata.append("x-role", "dev".parse().unwrap());
        metadata.insert_bin("trace-bin", MetadataValue::from_bytes(b"\x00\x01"));

        let headers = inbound_headers(&metadata);
        assert_eq!(
            headers,
            json!({"x-team": "core", "x-role": ["admin", "dev"]})
                .as_object()
                .unwrap()
                .clone()
        );
    }

    #[test]
    fn outbound_metadata_repeats_lists() {
        let metadata = outbound_metadata(
            json!({"x-one": "1", "x-many": ["a", "b"], "X-Num": 5})
                .as_object()
                .unwrap(),
        );
        assert_eq!(metadata.get("x-one").unwrap(), "1");
        let many: Vec<&str> = metadata
            .get_all("x-many")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(many, ["a", "b"]);
        assert_eq!(metadata.get("x-num").unwrap(), "5");
    }

    #[test]
    fn header_rules_see_inbound_metadata() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "GetUser",
                "input": {"equals": {"id": 1}, "headers": {"contains": {"authorization": "Bearer t"}}},
                "output": {"data": {"name": "Auth"}}
            }),
        );
        let handler = dispatcher.handler("/user.UserService/GetUser").unwrap();

        assert!(handler.unary(request(&pool, 1), &MetadataMap::new()).is_err());

        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "Bearer t".parse().unwrap());
        let (reply, _) = handler.unary(request(&pool, 1), &metadata).unwrap();
        assert_eq!(convert::message_to_value(&reply)["name"], json!("Auth"));
    }

    #[test]
    fn server_stream_sends_stream_list() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "ListUsers",
                "input": {"contains": {}},
                "output": {"stream": [{"name": "a"}, {"name": "b"}, {"name": "c"}]}
            }),
        );
        let handler = dispatcher.handler("/user.UserService/ListUsers").unwrap();
        let (replies, _) = handler.server_stream(request(&pool, 1), &MetadataMap::new()).unwrap();
        let names: Vec<Value> = replies
            .iter()
            .map(|r| convert::message_to_value(r)["name"].clone())
            .collect();
        assert_eq!(names, [json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn client_stream_merges_messages() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "Upload",
                "input": {"equals": {"id": 3, "tag": "x"}},
                "output": {"data": {"name": "merged"}}
            }),
        );
        let handler = dispatcher.handler("/user.UserService/Upload").unwrap();

        let mut tagged = request(&pool, 1);
        tagged.set_field_by_name("tag", ReflectValue::String("x".into()));
        let requests = [tagged, request(&pool, 3)];
        let (reply, _) = handler.client_stream(&requests, &MetadataMap::new()).unwrap();
        assert_eq!(convert::message_to_value(&reply)["name"], json!("merged"));
    }

    #[test]
    fn bidi_answers_each_message() {
        let (dispatcher, pool) = setup();
        add(
            &dispatcher,
            json!({
                "service": "user.UserService", "method": "Chat",
                "input": {"equals": {"id": 1}},
                "output": {"data": {"name": "one"}}
            }),
        );
        let handler = dispatcher.handler("/user.UserService/Chat").unwrap();
        let reply = handler.bidi_message(&request(&pool, 1), &Fields::new()).unwrap();
        assert_eq!(convert::message_to_value(&reply)["name"], json!("one"));
        let miss = handler.bidi_message(&request(&pool, 2), &Fields::new()).unwrap_err();
        assert_eq!(miss.code(), Code::NotFound);
    }

    #[test]
    fn reinstall_swaps_table() {
        let (dispatcher, _) = setup();
        assert_eq!(dispatcher.install(&DescriptorPool::new()), 0);
        assert!(dispatcher.handler("/user.UserService/GetUser").is_none());
    }
}
