//! Page cache middleware.
//!
//! Writes successful GET responses through [`PageCacheWriter`] so the edge server can serve
//! them next time. Serving cached pages is the edge server's job; this layer only writes.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::writer::{BufferedResponse, PageCacheWriter, RequestMeta, WriteOptions};

/// Shared page cache state for middleware.
#[derive(Clone)]
pub struct PageCacheState {
    pub writer: Arc<PageCacheWriter>,
    pub options: WriteOptions,
}

impl PageCacheState {
    pub fn new(writer: Arc<PageCacheWriter>, options: WriteOptions) -> Self {
        Self { writer, options }
    }
}

/// Middleware writing rendered pages to the cache.
///
/// Only GET requests answered with 200 OK are cached. Event streams and bodies larger than
/// `max_body_bytes` pass through to the client without being cached.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let meta = RequestMeta::from_parts(&parts);
    let response = next.run(Request::from_parts(parts, body)).await;

    if !should_cache(&response, cache.writer.config().max_body_bytes) {
        debug!(status = %response.status(), "response not cacheable");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let limit = cache.writer.config().max_body_bytes;
    let bytes = match buffer_body(body, limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Passthrough(body) => return Response::from_parts(parts, body),
    };

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let mut buffered = BufferedResponse::new(bytes, content_type);

    cache
        .writer
        .write_response(&meta, &mut buffered, &cache.options)
        .await;

    for (name, value) in &buffered.cookies {
        match HeaderValue::from_str(&format!("{name}={value}; Path=/")) {
            Ok(cookie) => {
                parts.headers.append(header::SET_COOKIE, cookie);
            }
            Err(err) => warn!(error = %err, cookie = %name, "page version cookie not representable"),
        }
    }
    // The body may have been minified.
    parts.headers.remove(header::CONTENT_LENGTH);

    Response::from_parts(parts, Body::from(buffered.content))
}

enum Buffered {
    Complete(Bytes),
    /// The body could not be buffered; carries everything read so far plus the remainder.
    Passthrough(Body),
}

/// Buffer `body` up to `limit` bytes.
///
/// Once the limit is crossed, or the upstream body fails, the chunks already read are
/// replayed in front of whatever is left so the client still receives the full response.
async fn buffer_body(mut body: Body, limit: usize) -> Buffered {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut size = 0usize;

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                // Trailers are dropped.
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                size = size.saturating_add(data.len());
                chunks.push(data);
                if size > limit {
                    debug!(limit, "response body exceeds cache limit");
                    let rest = body.into_data_stream();
                    let replay = stream::iter(chunks.into_iter().map(Ok)).chain(rest);
                    return Buffered::Passthrough(Body::from_stream(replay));
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to buffer response body for caching");
                let replay = stream::iter(
                    chunks
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(err))),
                );
                return Buffered::Passthrough(Body::from_stream(replay));
            }
        }
    }

    let mut content = BytesMut::with_capacity(size);
    for chunk in chunks {
        content.extend_from_slice(&chunk);
    }
    Buffered::Complete(content.freeze())
}

fn should_cache(response: &Response, max_body_bytes: usize) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    let upper = response.body().size_hint().upper();
    if upper.is_some_and(|upper| upper > max_body_bytes as u64) {
        return false;
    }

    let headers = response.headers();
    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    let announced = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    !announced.is_some_and(|length| length > max_body_bytes)
}
