//! gRPC surface: routes every request path to its method handler.

use crate::codec::DynamicCodec;
use crate::dispatch::{CallKind, Dispatcher, MethodHandler, inbound_headers};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use futures::stream;
use prost_reflect::DynamicMessage;
use std::sync::Arc;
use tonic::codegen::{BoxFuture, BoxStream};
use tonic::server::{
    ClientStreamingService, Grpc, ServerStreamingService, StreamingService, UnaryService,
};
use tonic::{Status, Streaming};
use tracing::{debug, warn};

/// Axum fallback handler serving every gRPC path.
pub async fn handle(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(handler) = dispatcher.handler(&path) else {
        debug!(path = %path, "Unknown method");
        return status_response(Status::unimplemented(format!("unknown method {path}")));
    };
    debug!(
        service = handler.service(),
        method = handler.method(),
        kind = %handler.kind(),
        "Serving call"
    );

    let mut grpc = Grpc::new(DynamicCodec::new(handler.input().clone()));
    let response = match handler.kind() {
        CallKind::Unary => grpc.unary(Unary(handler), request).await,
        CallKind::ServerStreaming => grpc.server_streaming(ServerStream(handler), request).await,
        CallKind::ClientStreaming => grpc.client_streaming(ClientStream(handler), request).await,
        CallKind::Bidi => grpc.streaming(Bidi(handler), request).await,
    };
    response.map(Body::new)
}

/// Trailers-only response carrying `status`.
fn status_response(status: Status) -> Response {
    let mut response = Response::new(Body::empty());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    if let Err(e) = status.add_header(response.headers_mut()) {
        warn!(error = %e, "Failed to encode status headers");
    }
    response
}

struct Unary(Arc<MethodHandler>);

impl UnaryService<DynamicMessage> for Unary {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<DynamicMessage>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let (metadata, _, message) = request.into_parts();
            let (reply, headers) = handler.unary(message, &metadata)?;
            Ok(with_metadata(reply, headers))
        })
    }
}

struct ServerStream(Arc<MethodHandler>);

impl ServerStreamingService<DynamicMessage> for ServerStream {
    type Response = DynamicMessage;
    type ResponseStream = BoxStream<DynamicMessage>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let (metadata, _, message) = request.into_parts();
            let (replies, headers) = handler.server_stream(message, &metadata)?;
            let replies: Self::ResponseStream = Box::pin(stream::iter(replies.into_iter().map(Ok)));
            Ok(with_metadata(replies, headers))
        })
    }
}

struct ClientStream(Arc<MethodHandler>);

impl ClientStreamingService<DynamicMessage> for ClientStream {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<DynamicMessage>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let (metadata, _, mut inbound) = request.into_parts();
            let mut messages = Vec::new();
            while let Some(message) = inbound.message().await? {
                messages.push(message);
            }
            let (reply, headers) = handler.client_stream(&messages, &metadata)?;
            Ok(with_metadata(reply, headers))
        })
    }
}

struct Bidi(Arc<MethodHandler>);

impl StreamingService<DynamicMessage> for Bidi {
    type Response = DynamicMessage;
    type ResponseStream = BoxStream<DynamicMessage>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handler = self.0.clone();
        Box::pin(async move {
            let (metadata, _, inbound) = request.into_parts();
            let headers = inbound_headers(&metadata);
            // Each message is matched on its own; the first miss ends the stream.
            let replies = stream::unfold(Some((inbound, handler, headers)), |state| async move {
                let (mut inbound, handler, headers) = state?;
                match inbound.message().await {
                    Ok(Some(message)) => match handler.bidi_message(&message, &headers) {
                        Ok(reply) => Some((Ok(reply), Some((inbound, handler, headers)))),
                        Err(status) => Some((Err(status), None)),
                    },
                    Ok(None) => None,
                    Err(status) => Some((Err(status), None)),
                }
            });
            let replies: Self::ResponseStream = Box::pin(replies);
            Ok(tonic::Response::new(replies))
        })
    }
}

fn with_metadata<T>(message: T, metadata: tonic::metadata::MetadataMap) -> tonic::Response<T> {
    let mut response = tonic::Response::new(message);
    *response.metadata_mut() = metadata;
    response
}
