//! Router request handler
//!
//! Calls are JSON over HTTP POST. Watches answer with a stream of
//! newline-delimited JSON events that lasts until the client goes away.
//! Failures are returned as an `ErrorResponse` envelope: 404 when no route
//! matches, 400 for malformed requests, 500 for everything else.

use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use router_api::{
    Ack, ErrorResponse, LookupRequest, LookupResponse, ReadRequest, ReadResponse, WatchRequest,
    HEALTH_PATH, LOOKUP_PATH, METRICS_PATH, SERVICE_ID, TABLE_CREATE_PATH, TABLE_DELETE_PATH,
    TABLE_READ_PATH, TABLE_UPDATE_PATH, WATCH_PATH,
};
use router_core::{ReadOptions, RegistryRouter, Route, RouterError, WatchOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

type HandlerResult = std::result::Result<Response<ResponseBody>, ErrorResponse>;

/// Serves a router over HTTP
#[derive(Clone)]
pub struct RouterHandler {
    router: Arc<RegistryRouter>,
}

impl RouterHandler {
    pub fn new(router: Arc<RegistryRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<RegistryRouter> {
        &self.router
    }

    /// Dispatch a request to its endpoint. Never fails: errors become
    /// error envelopes.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!("{} {}", method, path);

        let result = match (&method, path.as_str()) {
            (&Method::GET, HEALTH_PATH) => Ok(text(StatusCode::OK, "OK\n".to_string())),
            (&Method::GET, METRICS_PATH) => self.metrics(),
            (&Method::POST, LOOKUP_PATH) => self.lookup(req).await,
            (&Method::POST, WATCH_PATH) => self.watch(req).await,
            (&Method::POST, TABLE_CREATE_PATH) => self.create(req).await,
            (&Method::POST, TABLE_UPDATE_PATH) => self.update(req).await,
            (&Method::POST, TABLE_DELETE_PATH) => self.delete(req).await,
            (&Method::POST, TABLE_READ_PATH) => self.read(req).await,
            _ => Err(ErrorResponse::not_found(
                SERVICE_ID,
                format!("unknown endpoint {} {}", method, path),
            )),
        };

        result.unwrap_or_else(|err| {
            if err.code >= 500 {
                warn!("{} {} failed: {}", method, path, err);
            } else {
                trace!("{} {} rejected: {}", method, path, err);
            }
            error_response(&err)
        })
    }

    async fn lookup<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let request: LookupRequest = decode(req).await?;
        let routes = self
            .router
            .lookup(&request.service, &request.options.into())
            .await
            .map_err(router_error)?;

        json(&LookupResponse {
            routes: routes.into_iter().map(Into::into).collect(),
        })
    }

    async fn watch<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let request: WatchRequest = decode(req).await?;
        let options = request
            .service
            .map(WatchOptions::service)
            .unwrap_or_default();
        let watcher = self.router.watch(options).await.map_err(router_error)?;
        debug!("Streaming table events to watcher {}", watcher.id());

        // ends when the watcher stops; dropping the body drops the watcher
        let events = stream::unfold(watcher, |mut watcher| async move {
            let event = watcher.next().await.ok()?;
            let mut line = match serde_json::to_vec(&router_api::Event::from(event)) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode table event: {}", e);
                    return None;
                }
            };
            line.push(b'\n');
            Some((Ok::<_, Infallible>(Frame::data(Bytes::from(line))), watcher))
        });

        let mut response = Response::new(StreamBody::new(events).boxed_unsync());
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-ndjson"),
        );
        Ok(response)
    }

    async fn create<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let route: router_api::Route = decode(req).await?;
        self.router
            .table()
            .create(Route::from(route))
            .await
            .map_err(router_error)?;
        json(&Ack {})
    }

    async fn update<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let route: router_api::Route = decode(req).await?;
        self.router
            .table()
            .update(Route::from(route))
            .await
            .map_err(router_error)?;
        json(&Ack {})
    }

    async fn delete<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let route: router_api::Route = decode(req).await?;
        self.router
            .table()
            .delete(Route::from(route))
            .await
            .map_err(router_error)?;
        json(&Ack {})
    }

    async fn read<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let request: ReadRequest = decode(req).await?;
        let routes = self
            .router
            .table()
            .read(ReadOptions {
                service: request.service,
            })
            .await
            .map_err(router_error)?;

        json(&ReadResponse {
            routes: routes.into_iter().map(Into::into).collect(),
        })
    }

    fn metrics(&self) -> HandlerResult {
        let text_metrics = self
            .router
            .metrics()
            .gather()
            .map_err(|e| ErrorResponse::internal(SERVICE_ID, e.to_string()))?;

        let mut response = text(StatusCode::OK, text_metrics);
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        Ok(response)
    }
}

/// Decode a JSON request body. An empty body reads as `{}`.
async fn decode<T, B>(req: Request<B>) -> std::result::Result<T, ErrorResponse>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ErrorResponse::bad_request(SERVICE_ID, format!("failed reading body: {}", e)))?
        .to_bytes();

    let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
    serde_json::from_slice(body)
        .map_err(|e| ErrorResponse::bad_request(SERVICE_ID, format!("malformed request: {}", e)))
}

fn router_error(err: RouterError) -> ErrorResponse {
    if err.is_not_found() {
        ErrorResponse::not_found(SERVICE_ID, err.to_string())
    } else {
        ErrorResponse::internal(SERVICE_ID, err.to_string())
    }
}

fn json<T: Serialize>(message: &T) -> HandlerResult {
    let body = serde_json::to_vec(message)
        .map_err(|e| ErrorResponse::internal(SERVICE_ID, e.to_string()))?;
    Ok(json_bytes(StatusCode::OK, body))
}

fn json_bytes(status: StatusCode, body: Vec<u8>) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text(status: StatusCode, body: String) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = status;
    response
}

fn error_response(err: &ErrorResponse) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // the envelope is plain strings and a number
    let body = serde_json::to_vec(err).unwrap_or_default();
    json_bytes(status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_core::{RouterConfig, RouterOptions};
    use router_registry::{MemoryRegistry, Node, Service};

    async fn handler(registry: MemoryRegistry) -> RouterHandler {
        let config = RouterConfig {
            id: "router-1".to_string(),
            cache: false,
            ..Default::default()
        };
        let router = RegistryRouter::new(RouterOptions::new(config, Arc::new(registry)))
            .await
            .unwrap();
        RouterHandler::new(router)
    }

    fn post(path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_healthz() {
        let handler = handler(MemoryRegistry::new()).await;
        let req = Request::builder()
            .uri(HEALTH_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "OK\n");
    }

    #[tokio::test]
    async fn test_lookup() {
        let registry = MemoryRegistry::new();
        registry
            .register(
                Service::new("foo", "1.0.0").with_node(Node::new("foo-1", "10.0.0.1:8080")),
                "d1",
            )
            .await
            .unwrap();
        let handler = handler(registry).await;

        let response = handler
            .handle(post(
                LOOKUP_PATH,
                r#"{"service":"foo","options":{"network":"d1"}}"#,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let parsed: LookupResponse = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(parsed.routes.len(), 1);
        assert_eq!(parsed.routes[0].address, "10.0.0.1:8080");
        assert_eq!(parsed.routes[0].router, "router-1");
    }

    #[tokio::test]
    async fn test_lookup_not_found_envelope() {
        let handler = handler(MemoryRegistry::new()).await;

        let response = handler
            .handle(post(LOOKUP_PATH, r#"{"service":"missing"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err: ErrorResponse = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(err.id, SERVICE_ID);
        assert_eq!(err.code, 404);
        assert_eq!(err.detail, "route not found");
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let handler = handler(MemoryRegistry::new()).await;
        let response = handler.handle(post(LOOKUP_PATH, "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let handler = handler(MemoryRegistry::new()).await;
        let response = handler.handle(post("/router/nope", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_table_calls() {
        let handler = handler(MemoryRegistry::new()).await;
        let route = r#"{"service":"foo","address":"10.0.0.1:8080","network":"d1","link":"default","metric":1}"#;

        let response = handler.handle(post(TABLE_CREATE_PATH, route)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "{}");

        // duplicates are server errors
        let response = handler.handle(post(TABLE_CREATE_PATH, route)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = handler
            .handle(post(TABLE_READ_PATH, r#"{"service":"foo"}"#))
            .await;
        let parsed: ReadResponse = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(parsed.routes.len(), 1);

        let response = handler.handle(post(TABLE_DELETE_PATH, route)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = handler.handle(post(TABLE_DELETE_PATH, route)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics() {
        let handler = handler(MemoryRegistry::new()).await;
        handler
            .handle(post(LOOKUP_PATH, r#"{"service":"missing"}"#))
            .await;

        let req = Request::builder()
            .uri(METRICS_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(text.contains("router_lookups_total{source=\"not_found\"} 1"));
    }

    #[tokio::test]
    async fn test_watch_streams_events() {
        let handler = handler(MemoryRegistry::new()).await;

        let response = handler
            .handle(post(WATCH_PATH, r#"{"service":"foo"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );

        let table = handler.router().table();
        table
            .create(Route::new("bar", "10.0.0.2:8080"))
            .await
            .unwrap();
        table
            .create(Route::new("foo", "10.0.0.1:8080"))
            .await
            .unwrap();

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let line = frame.into_data().unwrap();
        assert!(line.ends_with(b"\n"));

        let event: router_api::Event = serde_json::from_slice(&line).unwrap();
        assert_eq!(event.event_type, router_api::EventType::Create);
        assert_eq!(event.route.service, "foo");
    }
}
