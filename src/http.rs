//! HTTP surface (spec.md §6.1). URL parsing is hand-rolled rather than
//! delegated to a routing crate, since routing itself sits outside this
//! system's scope — callers only need the requests resolved to router/
//! backend calls.
use crate::media::MediaParams;
use crate::router::Router;
use crate::settings::Settings;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use log::error;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[derive(Clone)]
pub struct HlsServer {
    settings: Arc<Settings>,
    router: Arc<Router>,
}

impl HlsServer {
    pub fn new(settings: Arc<Settings>) -> Self {
        let params = MediaParams {
            ffmpeg_bin: settings.ffmpeg_bin(),
            ffprobe_bin: settings.ffprobe_bin(),
            cache_root: settings.cache_root(),
            min_buffer_length: settings.buffer_length,
            max_buffer_length: settings.max_buffer_length(),
        };
        let router = Router::new(params, settings.max_client_number);
        Self {
            settings,
            router: Arc::new(router),
        }
    }

    fn source_path(&self, relative: &str) -> String {
        std::path::Path::new(&self.settings.root_path)
            .join(relative)
            .to_string_lossy()
            .to_string()
    }
}

type BoxErr = anyhow::Error;

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, BoxErr>> {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", "*")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .unwrap()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody<Bytes, BoxErr>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(value.to_string())).map_err(|e| match e {}).boxed())
        .unwrap()
}

fn m3u8_response(body: String) -> Response<BoxBody<Bytes, BoxErr>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/vnd.apple.mpegurl")
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .unwrap()
}

async fn segment_response(path: std::path::PathBuf) -> Result<Response<BoxBody<Bytes, BoxErr>>, BoxErr> {
    let f = File::open(&path).await?;
    let stream = ReaderStream::new(f);
    let body = StreamBody::new(stream.map_ok(Frame::data).map_err(BoxErr::new)).boxed();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "video/mp2t")
        .header("access-control-allow-origin", "*")
        .body(body)?)
}

/// Everything after the leading `:type.:client` segment, minus the final
/// action segment, is the relative source path (which may itself contain
/// slashes).
enum Action<'a> {
    Master,
    Variant { quality: &'a str },
    Segment { quality: &'a str, segment_hex: &'a str },
}

fn split_type_client(segment: &str) -> Option<(&str, &str)> {
    segment.split_once('.')
}

fn parse_action(last: &str) -> Option<Action<'_>> {
    if last == "master.m3u8" {
        return Some(Action::Master);
    }
    if let Some(quality) = last.strip_prefix("quality-").and_then(|s| s.strip_suffix(".m3u8")) {
        return Some(Action::Variant { quality });
    }
    if let Some(rest) = last.strip_suffix(".ts") {
        let (quality, segment_hex) = rest.rsplit_once('.')?;
        return Some(Action::Segment { quality, segment_hex });
    }
    None
}

impl HlsServer {
    async fn handle_media_probe(&self, relative_file: &str) -> Response<BoxBody<Bytes, BoxErr>> {
        let source = self.source_path(relative_file);
        match self.router.media(&source).await {
            Ok(media) => {
                let media_type = if media.has_video() { "video" } else { "audio" };
                let native = !self.settings.no_short_circuit && media.native_support().maybe_natively_supported;
                json_response(
                    StatusCode::OK,
                    json!({
                        "type": media_type,
                        "maybeNativelySupported": native,
                        "bufferLength": self.settings.buffer_length,
                    }),
                )
            }
            Err(e) => json_response(StatusCode::OK, json!({ "error": e.to_string() })),
        }
    }

    async fn handle_master(&self, media_type: &str, relative_file: &str) -> Response<BoxBody<Bytes, BoxErr>> {
        let source = self.source_path(relative_file);
        match self.router.media(&source).await {
            Ok(media) => match media.master_manifest(media_type) {
                Ok(body) => m3u8_response(body),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    async fn handle_variant(
        &self,
        client_id: &str,
        relative_file: &str,
        quality: &str,
    ) -> Response<BoxBody<Bytes, BoxErr>> {
        let source = self.source_path(relative_file);
        // Routes the client to this backend (spec.md §6.1's "also routes the
        // client to that backend"), then renders the manifest from the
        // media descriptor's own breakpoints.
        if let Err(e) = self.router.get_backend(client_id, &source, quality).await {
            return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        let media = match self.router.media(&source).await {
            Ok(m) => m,
            Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        match media.breakpoints(quality) {
            Ok(breakpoints) => m3u8_response(crate::manifest::variant_manifest(
                &breakpoints,
                quality,
                crate::media::MAX_SEGMENT_LENGTH,
            )),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    async fn handle_segment(
        &self,
        client_id: &str,
        relative_file: &str,
        quality: &str,
        segment_hex: &str,
    ) -> Result<Response<BoxBody<Bytes, BoxErr>>, BoxErr> {
        let source = self.source_path(relative_file);
        let backend = match self.router.get_backend(client_id, &source, quality).await {
            Ok(b) => b,
            Err(e) => return Ok(text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        };
        match backend.get_segment(client_id, segment_hex).await {
            Ok(path) => segment_response(path).await,
            Err(crate::backend::SegmentError::ClientGone) => Ok(text(StatusCode::CONFLICT, "client deleted")),
            Err(e @ crate::backend::SegmentError::BadRequest(_)) => {
                Ok(text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }
            Err(e) => Ok(text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }
}

impl Service<Request<Incoming>> for HlsServer {
    type Response = Response<BoxBody<Bytes, BoxErr>>;
    type Error = BoxErr;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        Box::pin(async move {
            let trimmed = path.trim_start_matches('/').trim_end_matches('/');
            let segments: Vec<&str> = if trimmed.is_empty() {
                Vec::new()
            } else {
                trimmed.split('/').collect()
            };

            if segments.is_empty() {
                return Ok(text(StatusCode::NOT_FOUND, "not found"));
            }

            if segments[0] == "media" && method == Method::GET && segments.len() >= 2 {
                let file = segments[1..].join("/");
                return Ok(this.handle_media_probe(&file).await);
            }

            if segments[0] == "browse" || segments[0] == "raw" || segments[0] == "thumbnail" {
                return Ok(text(
                    StatusCode::NOT_IMPLEMENTED,
                    "this deployment does not serve browsing, raw files, or thumbnails from this core",
                ));
            }

            let Some((type_or_hls, client_id)) = split_type_client(segments[0]) else {
                return Ok(text(StatusCode::NOT_FOUND, "not found"));
            };

            if type_or_hls == "hls" && method == Method::DELETE {
                this.router.remove_client(client_id).await;
                return Ok(text(StatusCode::NO_CONTENT, ""));
            }

            if method != Method::GET || segments.len() < 2 {
                return Ok(text(StatusCode::NOT_FOUND, "not found"));
            }

            let last = segments[segments.len() - 1];
            let relative_file = segments[1..segments.len() - 1].join("/");
            let Some(action) = parse_action(last) else {
                return Ok(text(StatusCode::NOT_FOUND, "not found"));
            };

            match action {
                Action::Master => Ok(this.handle_master(type_or_hls, &relative_file).await),
                Action::Variant { quality } => Ok(this.handle_variant(client_id, &relative_file, quality).await),
                Action::Segment { quality, segment_hex } => {
                    match this.handle_segment(client_id, &relative_file, quality, segment_hex).await {
                        Ok(r) => Ok(r),
                        Err(e) => {
                            error!("{e}");
                            Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
                        }
                    }
                }
            }
        })
    }
}
