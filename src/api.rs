use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ApiConfig;

/// A flat record as returned by the API, fields kept in response order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Envelope shared by every record API endpoint.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ApiResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub record: Option<Record>,
    #[serde(default)]
    pub records: Option<Vec<Record>>,
    #[serde(default)]
    pub results: Option<Vec<Record>>,
}

/// Read access to the remote record service.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// `GET /record/{id}`
    async fn get_record(&self, id: &str) -> Result<ApiResponse>;

    /// `GET /records?page=&per_page=[&carrier=]`
    async fn get_records(
        &self,
        page: u32,
        per_page: u32,
        carrier: Option<&str>,
    ) -> Result<ApiResponse>;

    /// `GET /search?q=`
    async fn search_records(&self, query: &str) -> Result<ApiResponse>;
}

/// Join path segments and query pairs onto the base URL, percent-encoding both.
pub fn endpoint(base_url: &str, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
    let mut url =
        Url::parse(base_url).with_context(|| format!("Invalid API base URL: {}", base_url))?;

    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| anyhow!("API base URL cannot have a path: {}", base_url))?;
        path.pop_if_empty();
        path.extend(segments);
    }

    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(url)
}

/// Decode a response body. An error status is tolerated as long as the body
/// is still a valid envelope, so a 404 `{"ok": false}` stays a "not found".
pub fn parse_response(status: StatusCode, body: &str) -> Result<ApiResponse> {
    match serde_json::from_str::<ApiResponse>(body) {
        Ok(parsed) => {
            if !status.is_success() {
                warn!("Record API returned {} with a JSON body", status);
            }
            Ok(parsed)
        }
        Err(_) if !status.is_success() => {
            anyhow::bail!("Record API error ({}): {}", status, body)
        }
        Err(e) => Err(e).context("Failed to parse record API response"),
    }
}

pub struct RecordsClient {
    client: reqwest::Client,
    config: ApiConfig,
}

impl RecordsClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        endpoint(self.config.effective_base_url(), segments, query)
    }

    /// `{base}/record/{id}`
    pub fn record_url(&self, id: &str) -> Result<Url> {
        self.url(&["record", id], &[])
    }

    /// `{base}/records?page=&per_page=`, plus `carrier=` when one is given.
    pub fn records_url(&self, page: u32, per_page: u32, carrier: Option<&str>) -> Result<Url> {
        let mut query = vec![("page", page.to_string()), ("per_page", per_page.to_string())];
        if let Some(carrier) = carrier.filter(|c| !c.is_empty()) {
            query.push(("carrier", carrier.to_string()));
        }
        self.url(&["records"], &query)
    }

    /// `{base}/search?q=`
    pub fn search_url(&self, query: &str) -> Result<Url> {
        self.url(&["search"], &[("q", query.to_string())])
    }

    async fn fetch(&self, url: Url) -> Result<ApiResponse> {
        debug!("Sending request to record API: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read record API response")?;

        parse_response(status, &body)
    }
}

#[async_trait]
impl RecordSource for RecordsClient {
    async fn get_record(&self, id: &str) -> Result<ApiResponse> {
        let url = self.record_url(id)?;
        self.fetch(url).await
    }

    async fn get_records(
        &self,
        page: u32,
        per_page: u32,
        carrier: Option<&str>,
    ) -> Result<ApiResponse> {
        let url = self.records_url(page, per_page, carrier)?;
        self.fetch(url).await
    }

    async fn search_records(&self, query: &str) -> Result<ApiResponse> {
        let url = self.search_url(query)?;
        self.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://records.example.dev";

    #[test]
    fn test_record_endpoint() {
        let url = endpoint(BASE, &["record", "123"], &[]).unwrap();
        assert_eq!(url.as_str(), "https://records.example.dev/record/123");
    }

    #[test]
    fn test_record_id_is_a_single_encoded_segment() {
        let url = endpoint(BASE, &["record", "a b/../c"], &[]).unwrap();
        assert_eq!(url.path(), "/record/a%20b%2F..%2Fc");
    }

    #[test]
    fn test_records_endpoint_with_carrier() {
        let query = [
            ("page", "1".to_string()),
            ("per_page", "10".to_string()),
            ("carrier", "Acme & Sons".to_string()),
        ];
        let url = endpoint(BASE, &["records"], &query).unwrap();
        assert_eq!(
            url.as_str(),
            "https://records.example.dev/records?page=1&per_page=10&carrier=Acme+%26+Sons"
        );
    }

    #[test]
    fn test_search_endpoint_encodes_query() {
        let url = endpoint(BASE, &["search"], &[("q", "blue box #4".to_string())]).unwrap();
        assert_eq!(url.query(), Some("q=blue+box+%234"));
    }

    #[test]
    fn test_base_url_path_is_kept() {
        let url = endpoint("http://localhost:8787/api", &["search"], &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8787/api/search");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(endpoint("not a url", &["record", "1"], &[]).is_err());
    }

    #[test]
    fn test_parse_single_record_keeps_field_order() {
        let body = r#"{"ok": true, "record": {"number": "1", "carrier": "Acme", "amount": 3}}"#;
        let parsed = parse_response(StatusCode::OK, body).unwrap();
        assert!(parsed.ok);
        let keys: Vec<&str> = parsed
            .record
            .as_ref()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["number", "carrier", "amount"]);
    }

    #[test]
    fn test_parse_missing_ok_means_false() {
        let parsed = parse_response(StatusCode::OK, r#"{"results": []}"#).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.results, Some(vec![]));
    }

    #[test]
    fn test_parse_not_found_status_with_envelope() {
        let parsed = parse_response(StatusCode::NOT_FOUND, r#"{"ok": false}"#).unwrap();
        assert_eq!(parsed, ApiResponse::default());
    }

    #[test]
    fn test_parse_error_status_without_json() {
        let err = parse_response(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").unwrap_err();
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(parse_response(StatusCode::OK, "{\"ok\": tru").is_err());
    }

    #[test]
    fn test_parse_non_object_record_is_an_error() {
        assert!(parse_response(StatusCode::OK, r#"{"ok": true, "record": [1, 2]}"#).is_err());
    }

    fn client(base_url: &str) -> RecordsClient {
        RecordsClient {
            // Keep local test traffic away from any proxy set in the environment
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            config: ApiConfig {
                base_url: base_url.to_string(),
                ..ApiConfig::default()
            },
        }
    }

    #[test]
    fn test_record_url() {
        let url = client("https://records.example.dev/").record_url("42").unwrap();
        assert_eq!(url.as_str(), "https://records.example.dev/record/42");
    }

    #[test]
    fn test_records_url_with_and_without_carrier() {
        let records = client(BASE);
        assert_eq!(
            records.records_url(1, 10, Some("Acme")).unwrap().as_str(),
            "https://records.example.dev/records?page=1&per_page=10&carrier=Acme"
        );
        assert_eq!(
            records.records_url(2, 25, None).unwrap().query(),
            Some("page=2&per_page=25")
        );
        assert_eq!(
            records.records_url(1, 10, Some("")).unwrap().query(),
            Some("page=1&per_page=10")
        );
    }

    #[test]
    fn test_search_url() {
        let url = client(BASE).search_url("acme express").unwrap();
        assert_eq!(url.as_str(), "https://records.example.dev/search?q=acme+express");
    }

    /// Serve one canned HTTP response on a local port and hand back the
    /// request line that was received.
    async fn serve_once(
        status_line: &'static str,
        content_type: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                content_type,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            String::from_utf8_lossy(&request)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        });

        (base_url, handle)
    }

    #[tokio::test]
    async fn test_get_record_over_http() {
        let (base_url, server) = serve_once(
            "200 OK",
            "application/json",
            r#"{"ok": true, "record": {"number": "7", "carrier": "Acme"}}"#,
        )
        .await;

        let response = client(&base_url).get_record("7").await.unwrap();

        assert_eq!(server.await.unwrap(), "GET /record/7 HTTP/1.1");
        assert!(response.ok);
        let record = response.record.unwrap();
        assert_eq!(record["carrier"], "Acme");
    }

    #[tokio::test]
    async fn test_get_records_over_http() {
        let (base_url, server) =
            serve_once("200 OK", "application/json", r#"{"ok": true, "records": []}"#).await;

        let response = client(&base_url)
            .get_records(1, 10, Some("Acme"))
            .await
            .unwrap();

        assert_eq!(
            server.await.unwrap(),
            "GET /records?page=1&per_page=10&carrier=Acme HTTP/1.1"
        );
        assert_eq!(response.records, Some(vec![]));
    }

    #[tokio::test]
    async fn test_search_records_over_http() {
        let (base_url, server) =
            serve_once("200 OK", "application/json", r#"{"ok": true, "results": []}"#).await;

        let response = client(&base_url).search_records("blue box").await.unwrap();

        assert_eq!(server.await.unwrap(), "GET /search?q=blue+box HTTP/1.1");
        assert_eq!(response.results, Some(vec![]));
    }

    #[tokio::test]
    async fn test_not_found_envelope_over_http() {
        let (base_url, server) =
            serve_once("404 Not Found", "application/json", r#"{"ok": false}"#).await;

        let response = client(&base_url).get_record("999").await.unwrap();

        assert_eq!(server.await.unwrap(), "GET /record/999 HTTP/1.1");
        assert_eq!(response, ApiResponse::default());
    }

    #[tokio::test]
    async fn test_bad_gateway_html_over_http() {
        let (base_url, server) =
            serve_once("502 Bad Gateway", "text/html", "<html>bad gateway</html>").await;

        let err = client(&base_url).search_records("box").await.unwrap_err();

        server.await.unwrap();
        assert!(err.to_string().contains("502"));
    }
}
