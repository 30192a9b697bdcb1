//! The HTTP surface: method × resource dispatch over the document tree.

use axum::body::{to_bytes, Body};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use perch_store::collection::{parse_interval, Collection};
use perch_store::path::{resolve, split_parent, Resource, ResourceKind};
use perch_store::subscribe::{event_frame, keep_alive_frame, Subscription, KEEP_ALIVE_INTERVAL};
use perch_store::{
    BodyValidator, CollectionHolder, Patch, PathError, PutOutcome, StoreError,
};

use crate::auth::{self, Authenticator};

/// How long a range query may chase a stable pass before it is called off.
const QUERY_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub root: CollectionHolder,
    pub schema: Arc<dyn BodyValidator>,
    pub auth: Arc<Authenticator>,
}

/// Wire-level errors. Domain errors convert into exactly one of these, and
/// each variant maps to exactly one status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Error bodies are bare JSON strings.
        (code, Json(self.to_string())).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CollectionExists
            | StoreError::StaleTimestamp
            | StoreError::SchemaViolation(_) => ApiError::BadRequest(e.to_string()),
            StoreError::Absent(_) => ApiError::NotFound(e.to_string()),
            StoreError::Cancelled | StoreError::Internal(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PathError> for ApiError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Missing(_) => ApiError::NotFound(e.to_string()),
            PathError::Internal => ApiError::Internal(e.to_string()),
            PathError::NoVersion | PathError::BadSlash | PathError::BlankSegment => {
                ApiError::BadRequest(format!("invalid path: {e}"))
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/auth",
            post(auth::login).delete(auth::logout).options(preflight),
        )
        .fallback(dispatch)
        .with_state(state)
}

/// Everything under `/v1/` (and every unknown path) lands here.
async fn dispatch(State(st): State<AppState>, req: Request) -> Response {
    let mut response = route_request(st, req).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn route_request(st: AppState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    debug!(method = %parts.method, path, "request");

    if parts.method == Method::OPTIONS {
        return preflight().await;
    }

    if !path.starts_with("/v1/") {
        return ApiError::BadRequest("missing /v1/ or /auth in the request".to_string())
            .into_response();
    }

    let username = match st.auth.validate(&parts.headers) {
        Ok(username) => username,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let params = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(p)| p)
        .unwrap_or_default();

    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return ApiError::BadRequest(format!("cannot read request body: {e}")).into_response(),
    };

    let result = match parts.method.as_str() {
        "GET" => get_resource(&st, &path, &params).await,
        "PUT" => put_resource(&st, &path, &params, &body, &username).await,
        "POST" => post_resource(&st, &path, &body, &username).await,
        "PATCH" => patch_resource(&st, &path, &body, &username).await,
        "DELETE" => delete_resource(&st, &path).await,
        other => Err(ApiError::BadRequest(format!("unsupported method: {other}"))),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

/// The static CORS preflight answer.
async fn preflight() -> Response {
    (
        StatusCode::OK,
        [
            (header::ALLOW, "GET,PUT,POST,PATCH,DELETE,OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET,PUT,POST,PATCH,DELETE,OPTIONS",
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "accept,Content-Type,Authorization",
            ),
        ],
    )
        .into_response()
}

async fn get_resource(
    st: &AppState,
    path: &str,
    params: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let subscribe = params.get("mode").map(String::as_str) == Some("subscribe");
    match resolve(path, &st.root)? {
        Resource::Database(coll) | Resource::Collection(coll) => {
            if subscribe {
                let (lo, hi) =
                    parse_interval(params.get("interval").map(String::as_str).unwrap_or(""));
                if lo.is_empty() || hi.is_empty() {
                    return Err(ApiError::BadRequest("missing interval params".to_string()));
                }
                let subscription = coll.subscribe(lo, hi);
                Ok(sse_response(subscription_stream(subscription)))
            } else {
                let (lo, hi) =
                    parse_interval(params.get("interval").map(String::as_str).unwrap_or(""));
                let records = run_query(coll, lo, hi).await?;
                Ok((StatusCode::OK, Json(records)).into_response())
            }
        }
        Resource::Document(doc) => {
            if subscribe {
                let start = params.get("intervalStart").cloned().unwrap_or_default();
                let end = params.get("intervalEnd").cloned().unwrap_or_default();
                let subscription = doc.subscribe(start, end).await;
                Ok(sse_response(subscription_stream(subscription)))
            } else {
                Ok((StatusCode::OK, Json(doc.record())).into_response())
            }
        }
        Resource::DatabaseBare(_) => Err(ApiError::BadRequest(format!(
            "invalid database resource for request in {path}"
        ))),
    }
}

/// Run a snapshot range query off the async worker, with a deadline so a
/// write-saturated collection cannot pin the request forever.
async fn run_query(
    coll: Arc<Collection>,
    lo: String,
    hi: String,
) -> Result<Vec<perch_store::DocumentRecord>, ApiError> {
    let cancel = CancellationToken::new();
    let watchdog = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(QUERY_DEADLINE).await;
        watchdog.cancel();
    });

    let records = tokio::task::spawn_blocking(move || coll.list(&cancel, &lo, &hi))
        .await
        .map_err(|e| ApiError::Internal(format!("query task failed: {e}")))??;
    Ok(records)
}

async fn put_resource(
    st: &AppState,
    path: &str,
    params: &HashMap<String, String>,
    body: &Bytes,
    username: &str,
) -> Result<Response, ApiError> {
    let (parent, name, kind) = split_parent(path)?;
    match kind {
        ResourceKind::DatabaseBare => {
            st.root.put(&name)?;
            Ok(uri_response(StatusCode::CREATED, path))
        }
        ResourceKind::Database => Err(ApiError::BadRequest(format!(
            "bad syntax: cannot PUT a database as a collection in {path}"
        ))),
        ResourceKind::Document => {
            let doc_body = parse_and_validate(st.schema.as_ref(), body)?;
            let expected_ts = parse_timestamp(params.get("timestamp"))?;
            let coll = parent_collection(st, &parent)?;
            let record_path = perch_store::path::relative_path(path);
            let outcome = coll
                .put_doc(&name, &record_path, doc_body, username, expected_ts)
                .await?;
            let status = match outcome {
                PutOutcome::Created => StatusCode::CREATED,
                PutOutcome::Updated => StatusCode::OK,
            };
            Ok(uri_response(status, path))
        }
        ResourceKind::Collection => {
            let Resource::Document(doc) = resolve(&parent, &st.root)? else {
                return Err(ApiError::Internal(format!(
                    "parent of collection {path} is not a document"
                )));
            };
            doc.put_child(&name)?;
            Ok(uri_response(StatusCode::CREATED, path))
        }
    }
}

async fn post_resource(
    st: &AppState,
    path: &str,
    body: &Bytes,
    username: &str,
) -> Result<Response, ApiError> {
    match resolve(path, &st.root)? {
        Resource::Database(coll) | Resource::Collection(coll) => {
            let doc_body = parse_and_validate(st.schema.as_ref(), body)?;
            let base_path = perch_store::path::relative_path(path);
            let name = coll.post_doc(&base_path, doc_body, username).await?;
            let uri = format!("{path}{name}");
            Ok(uri_response(StatusCode::CREATED, &uri))
        }
        _ => Err(ApiError::BadRequest(format!(
            "invalid resource for POST in {path}"
        ))),
    }
}

async fn patch_resource(
    st: &AppState,
    path: &str,
    body: &Bytes,
    username: &str,
) -> Result<Response, ApiError> {
    let (parent, name, kind) = split_parent(path)?;
    if kind != ResourceKind::Document {
        return Err(ApiError::BadRequest(format!(
            "invalid patch target in {path}"
        )));
    }
    let patches: Vec<Patch> = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid patch format: {e}")))?;

    let coll = parent_collection(st, &parent)?;
    let outcome = coll
        .patch_doc(&name, &patches, st.schema.as_ref(), username, path)
        .await?;

    let status = if outcome.patch_failed {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        [(header::LOCATION, path.to_string())],
        Json(outcome),
    )
        .into_response())
}

async fn delete_resource(st: &AppState, path: &str) -> Result<Response, ApiError> {
    let (parent, name, kind) = split_parent(path)?;
    match kind {
        ResourceKind::DatabaseBare => {
            st.root.delete(&name, path).await?;
            Ok(no_content_response(path))
        }
        ResourceKind::Database => Err(ApiError::BadRequest(format!(
            "invalid database resource for request in {path}"
        ))),
        ResourceKind::Document => {
            let coll = parent_collection(st, &parent)?;
            coll.delete_doc(&name, path).await?;
            Ok(no_content_response(path))
        }
        ResourceKind::Collection => {
            let Resource::Document(doc) = resolve(&parent, &st.root)? else {
                return Err(ApiError::Internal(format!(
                    "parent of collection {path} is not a document"
                )));
            };
            doc.delete_child(&name, path).await?;
            Ok(no_content_response(path))
        }
    }
}

/// Resolve the parent path of a document operation to its collection.
fn parent_collection(st: &AppState, parent: &str) -> Result<Arc<Collection>, ApiError> {
    match resolve(parent, &st.root)? {
        Resource::Database(coll) | Resource::Collection(coll) => Ok(coll),
        _ => Err(ApiError::Internal(format!(
            "parent {parent} did not resolve to a collection"
        ))),
    }
}

fn parse_and_validate(schema: &dyn BodyValidator, body: &Bytes) -> Result<Value, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid document format: {e}")))?;
    schema
        .validate(&value)
        .map_err(|e| ApiError::BadRequest(format!("document did not conform to schema: {e}")))?;
    Ok(value)
}

fn parse_timestamp(raw: Option<&String>) -> Result<Option<i64>, ApiError> {
    match raw.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest("bad timestamp".to_string())),
    }
}

fn uri_response(status: StatusCode, uri: &str) -> Response {
    (
        status,
        [(header::LOCATION, uri.to_string())],
        Json(json!({ "uri": uri })),
    )
        .into_response()
}

fn no_content_response(uri: &str) -> Response {
    (
        StatusCode::NO_CONTENT,
        [(header::LOCATION, uri.to_string())],
    )
        .into_response()
}

/// Drive one subscription as a response body.
///
/// Events drain from the subscriber's queue; the keep-alive comment goes out
/// on the idle timer. Dropping the stream — the client went away — tears the
/// subscription down, and a subscriber closed for backpressure is noticed on
/// the next tick.
fn subscription_stream(
    mut subscription: Subscription,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let start = tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL;
        let mut keep_alive = tokio::time::interval_at(start, KEEP_ALIVE_INTERVAL);
        loop {
            tokio::select! {
                event = subscription.receiver.recv() => {
                    match event {
                        Some(payload) => yield Ok::<Bytes, Infallible>(event_frame(&payload)),
                        None => break,
                    }
                }
                _ = keep_alive.tick() => {
                    if subscription.subscriber.is_closed() {
                        warn!(id = %subscription.subscriber.id(), "subscriber closed, ending stream");
                        break;
                    }
                    yield Ok::<Bytes, Infallible>(keep_alive_frame());
                }
            }
        }
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = axum::http::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}
