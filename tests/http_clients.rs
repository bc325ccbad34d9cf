use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ons_ingest::catalog::{Catalog, CatalogClient};
use ons_ingest::fetcher::{FetchError, HttpFetcher, SourceFetcher};
use ons_ingest::warehouse::{BigQueryWarehouse, DedupCheck, Warehouse, WarehouseError};
use ons_ingest::IngestError;

const TIMEOUT: Duration = Duration::from_secs(5);
const PACKAGE: &str = "ear-diario-por-reservatorio";

type Requests = Arc<Mutex<Vec<String>>>;

/// Serves one canned `(status, body)` response per connection, in order, and
/// records each raw request.
async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Requests) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Requests = Arc::default();
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            seen.lock().unwrap().push(request);

            let response = format!(
                "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), requests)
}

/// Reads the head and, when a content-length is given, the body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut expected = None;

    loop {
        if let Some(total) = expected {
            if buf.len() >= total {
                break;
            }
        } else if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            expected = Some(end + 4 + length);
            continue;
        }

        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    String::from_utf8_lossy(&buf).to_string()
}

fn request(requests: &Requests, idx: usize) -> String {
    requests.lock().unwrap()[idx].clone()
}

fn catalog(base: &str) -> CatalogClient {
    let url = format!("{base}/api/3/action/package_show");
    CatalogClient::new(Some(&url), TIMEOUT).unwrap()
}

fn bigquery(base: &str) -> BigQueryWarehouse {
    BigQueryWarehouse::new(
        Some("proj".to_string()),
        "southamerica-east1",
        Some("secret".to_string()),
        TIMEOUT,
    )
    .unwrap()
    .with_api_base(base)
}

#[tokio::test]
async fn catalog_requests_package_by_id() {
    let body = r#"{"success": true, "result": {"resources": [
        {"format": "PARQUET", "url": "https://cdn/ear_2023.parquet", "name": "EAR 2023"}
    ]}}"#;
    let (base, requests) = serve(vec![(200, body)]).await;

    let resources = catalog(&base).list_resources(PACKAGE).await.unwrap();

    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].url, "https://cdn/ear_2023.parquet");
    assert!(request(&requests, 0)
        .starts_with("GET /api/3/action/package_show?id=ear-diario-por-reservatorio HTTP/1.1"));
}

#[tokio::test]
async fn catalog_error_status_is_upstream_error() {
    let (base, _) = serve(vec![(503, "down")]).await;

    let err = catalog(&base).list_resources(PACKAGE).await.unwrap_err();

    assert_matches!(
        err,
        IngestError::UpstreamError { status: 503, ref message } if message == "down"
    );
}

#[tokio::test]
async fn catalog_malformed_body_is_upstream_error() {
    let (base, _) = serve(vec![(200, "<html>maintenance</html>")]).await;

    let err = catalog(&base).list_resources(PACKAGE).await.unwrap_err();

    assert_matches!(err, IngestError::UpstreamError { status: 200, .. });
}

#[tokio::test]
async fn catalog_refused_connection_is_upstream_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = catalog(&format!("http://{addr}"))
        .list_resources(PACKAGE)
        .await
        .unwrap_err();

    assert_matches!(err, IngestError::UpstreamUnavailable(_));
}

#[tokio::test]
async fn fetcher_returns_the_body() {
    let (base, requests) = serve(vec![(200, "nom;ear_data\nFurnas;2023-01-02\n")]).await;
    let fetcher = HttpFetcher::new(TIMEOUT).unwrap();

    let body = fetcher.fetch(&format!("{base}/ear_2023.csv")).await.unwrap();

    assert_eq!(&body[..], b"nom;ear_data\nFurnas;2023-01-02\n");
    assert!(request(&requests, 0).starts_with("GET /ear_2023.csv HTTP/1.1"));
}

#[tokio::test]
async fn fetcher_rejects_error_status() {
    let (base, _) = serve(vec![(404, "missing")]).await;
    let fetcher = HttpFetcher::new(TIMEOUT).unwrap();
    let url = format!("{base}/ear_2023.csv");

    let err = fetcher.fetch(&url).await.unwrap_err();

    assert_matches!(err, FetchError::Status { status: 404, url: ref got } if *got == url);
}

#[tokio::test]
async fn bigquery_missing_table_is_not_an_error() {
    let (base, requests) = serve(vec![(404, r#"{"error": {"code": 404}}"#)]).await;

    let exists = bigquery(&base).table_exists("raw", "ear").await.unwrap();

    assert!(!exists);
    let sent = request(&requests, 0);
    assert!(sent.starts_with("GET /projects/proj/datasets/raw/tables/ear HTTP/1.1"));
    assert!(sent.to_lowercase().contains("authorization: bearer secret"));
}

#[tokio::test]
async fn bigquery_table_lookup_statuses() {
    let (base, _) = serve(vec![(200, "{}"), (500, "backend error")]).await;
    let warehouse = bigquery(&base);

    assert!(warehouse.table_exists("raw", "ear").await.unwrap());
    assert_matches!(
        warehouse.table_exists("raw", "ear").await,
        Err(WarehouseError::Status { status: 500, .. })
    );
}

#[tokio::test]
async fn dedup_over_bigquery_queries_the_raw_table() {
    let rows = r#"{"jobComplete": true, "rows": [{"f": [{"v": "1"}]}]}"#;
    let (base, requests) = serve(vec![(200, "{}"), (200, rows)]).await;
    let dedup = DedupCheck::new(Arc::new(bigquery(&base)), "raw");

    assert!(dedup.raw_table_has_value(PACKAGE, "ear_data", "2023-12-31").await);

    let query = request(&requests, 1);
    assert!(query.starts_with("POST /projects/proj/queries HTTP/1.1"));
    assert!(query.contains("`proj.raw.ear_diario_por_reservatorio`"));
    assert!(query.contains("2023-12-31"));
}

#[tokio::test]
async fn dedup_over_bigquery_without_raw_table_is_false() {
    let (base, requests) = serve(vec![(404, "{}")]).await;
    let dedup = DedupCheck::new(Arc::new(bigquery(&base)), "raw");

    assert!(!dedup.raw_table_has_value(PACKAGE, "ear_data", "2023-12-31").await);
    assert_eq!(requests.lock().unwrap().len(), 1);
}
