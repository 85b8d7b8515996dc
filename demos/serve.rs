//! Serves parts of local files.
//!
//! ```text
//! cargo run --example serve
//! curl -v 'http://127.0.0.1:3000/file?path=test/fixture.txt&start=6&end=10'
//! ```
//!
//! Offsets come in already parsed as query parameters; `end=-1` reads to the
//! end of the file.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use axum_part_writer::{PartConfig, PartRange, PartWriter, SizedSource};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct FileRequest {
    path: String,
    start: Option<i64>,
    end: Option<i64>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let config = match std::env::var("PART_WRITER_CONFIG") {
        Ok(json) => serde_json::from_str(&json).map_err(std::io::Error::other)?,
        Err(_) => PartConfig::default(),
    };

    let router = Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/file", get(move |query: Query<FileRequest>| get_file(query, config)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!(addr = %listener.local_addr()?, buffer_size = config.buffer_size(), "listening");
    axum::serve(listener, router).await
}

async fn get_file(Query(q): Query<FileRequest>, config: PartConfig) -> Response {
    let range = match PartRange::from_signed(q.start, q.end) {
        Ok(range) => range,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match SizedSource::open(&q.path).await {
        Ok(body) => PartWriter::for_source(body, range).with_config(&config).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "File not found").into_response()
        }
        Err(e) => {
            tracing::warn!(path = %q.path, error = %e, "failed to open file");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}
