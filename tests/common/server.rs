//! Range-capable static file server backing the online-install tests.
//! Serves one blob, answers single, multi and suffix ranges, and records
//! every Range header it sees.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::get;
use axum::Router;

pub const BOUNDARY: &str = "kachina-test-boundary";

#[derive(Clone)]
struct Served {
    bytes: Arc<Vec<u8>>,
    log: Arc<Mutex<Vec<String>>>,
}

pub struct RangeServer {
    pub url: String,
    pub log: Arc<Mutex<Vec<String>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl RangeServer {
    pub async fn start(bytes: Vec<u8>) -> Self {
        let state = Served {
            bytes: Arc::new(bytes),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let log = state.log.clone();
        let app = Router::new()
            .route("/pkg.exe", get(serve_ranges))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}/pkg.exe"),
            log,
            handle,
        }
    }

    pub fn ranges_seen(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn parse_ranges(spec: &str, total: u64) -> Option<Vec<(u64, u64)>> {
    let rest = spec.strip_prefix("bytes=")?;
    let mut out = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        let (start, end) = part.split_once('-')?;
        let range = if start.is_empty() {
            let suffix: u64 = end.parse().ok()?;
            (total.saturating_sub(suffix), total - 1)
        } else if end.is_empty() {
            (start.parse().ok()?, total - 1)
        } else {
            (start.parse().ok()?, end.parse().ok()?)
        };
        if range.0 > range.1 || range.1 >= total {
            return None;
        }
        out.push(range);
    }
    Some(out)
}

async fn serve_ranges(State(state): State<Served>, headers: HeaderMap) -> Response<Body> {
    let total = state.bytes.len() as u64;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(spec) = range_header else {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(state.bytes.as_ref().clone()))
            .unwrap();
    };
    state.log.lock().unwrap().push(spec.clone());

    let Some(ranges) = parse_ranges(&spec, total) else {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .body(Body::empty())
            .unwrap();
    };

    if ranges.len() == 1 {
        let (start, end) = ranges[0];
        let body = state.bytes[start as usize..=end as usize].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            )
            .body(Body::from(body))
            .unwrap();
    }

    let mut body = Vec::new();
    for (start, end) in &ranges {
        body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(format!("Content-Range: bytes {start}-{end}/{total}\r\n\r\n").as_bytes());
        body.extend_from_slice(&state.bytes[*start as usize..=*end as usize]);
    }
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/byteranges; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}
