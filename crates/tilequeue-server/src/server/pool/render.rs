use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tilequeue::{Classifier, TileClassifier, WorkerId};

/// The rendering backend a worker serves.
///
/// Rendering happens after admission, so implementations may be slow but
/// must not assume anything about request order.
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, worker: WorkerId, parts: &Parts) -> Response<Full<Bytes>>;
}

/// Answers every request with a JSON description of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoRenderer;

#[derive(Serialize)]
struct Echo<'a> {
    worker: String,
    pid: u32,
    method: &'a str,
    path: &'a str,
    query: Option<&'a str>,
    kind: &'a str,
}

impl Renderer for EchoRenderer {
    fn render(&self, worker: WorkerId, parts: &Parts) -> Response<Full<Bytes>> {
        let classifier = TileClassifier;
        let echo = Echo {
            worker: worker.to_string(),
            pid: std::process::id(),
            method: parts.method.as_str(),
            path: parts.uri.path(),
            query: parts.uri.query(),
            kind: classifier.classify(parts),
        };

        let (status, body) = match serde_json::to_vec(&echo) {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        };
        let mut resp = Response::new(Full::new(Bytes::from(body)));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::Request;

    #[tokio::test]
    async fn echoes_the_request_head() {
        let (parts, ()) = Request::get("/database/osm/table/roads/3/4/5.grid.json?style=plot")
            .body(())
            .unwrap()
            .into_parts();
        let resp = EchoRenderer.render(WorkerId::from_raw(2), &parts);
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["worker"], "w2");
        assert_eq!(body["method"], "GET");
        assert_eq!(body["path"], "/database/osm/table/roads/3/4/5.grid.json");
        assert_eq!(body["query"], "style=plot");
        assert_eq!(body["kind"], "grid");
    }
}
