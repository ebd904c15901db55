//! Webhook delivery of winner rows.
//!
//! The endpoint accepts a JSON POST and either answers with JSON directly or
//! with a 302/303 whose `Location` must be fetched with GET to obtain the JSON
//! reply. Redirects are therefore handled by hand.

use std::time::Duration;

use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::error::DeliveryError;
use crate::scoring::ScoredAd;

pub const BATCH_SIZE: usize = 20;
const PREVIEW_CHARS: usize = 250;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ROW_NOTES: &str = "Auto scraped";

/// One row as the sheet endpoint expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRow {
    pub competitor: String,
    pub category: String,
    pub winning_score: f64,
    pub runtime_days: i64,
    pub duplicates: usize,
    pub ad_library_link: String,
    pub creative_preview: String,
    pub landing_link: String,
    pub offer_type: String,
    pub notes: String,
}

impl DeliveryRow {
    pub fn from_scored(ad: &ScoredAd, competitor: &str, category: &str) -> Self {
        Self {
            competitor: competitor.to_string(),
            category: category.to_string(),
            winning_score: ad.winning_score,
            runtime_days: ad.runtime_days,
            duplicates: ad.duplicate_count,
            ad_library_link: ad.ad.ad_library_link(),
            creative_preview: ad.ad.creative_preview_url.clone(),
            landing_link: ad.ad.landing_link.clone().unwrap_or_default(),
            offer_type: String::new(),
            notes: ROW_NOTES.to_string(),
        }
    }
}

fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

fn json_reply(status: StatusCode, body: &str) -> Result<Value, DeliveryError> {
    if !status.is_success() {
        return Err(DeliveryError::Status {
            status: status.as_u16(),
            preview: preview(body),
        });
    }
    serde_json::from_str(body).map_err(|_| DeliveryError::NonJson {
        status: status.as_u16(),
        preview: preview(body),
    })
}

pub struct WebhookClient {
    client: Client,
    endpoint: Url,
    token: String,
}

impl WebhookClient {
    pub fn new(webhook_url: &str, token: &str) -> Result<Self, DeliveryError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DeliveryError::Config("empty webhook token".to_string()));
        }

        let mut endpoint = Url::parse(webhook_url.trim())
            .map_err(|e| DeliveryError::Config(format!("invalid webhook url: {}", e)))?;
        let kept: Vec<(String, String)> = endpoint
            .query_pairs()
            .filter(|(k, _)| k != "token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        endpoint
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("token", token);

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Post one batch and return the endpoint's JSON reply.
    pub async fn post_rows(&self, rows: &[DeliveryRow]) -> Result<Value, DeliveryError> {
        let payload = json!({ "token": self.token, "rows": rows });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::FOUND || status == StatusCode::SEE_OTHER {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            if let Some(location) = location {
                let target = self
                    .endpoint
                    .join(&location)
                    .map_err(|e| DeliveryError::Config(format!("bad redirect location '{}': {}", location, e)))?;
                debug!("webhook redirected ({}), fetching reply", status.as_u16());

                let reply = self
                    .client
                    .get(target)
                    .header(ACCEPT, "application/json")
                    .send()
                    .await?;
                let reply_status = reply.status();
                let body = reply.text().await?;
                return json_reply(reply_status, &body);
            }
        }

        let body = response.text().await?;
        json_reply(status, &body)
    }

    /// Send rows in batches. A failed batch is logged and skipped.
    /// Returns the number of batches accepted.
    pub async fn deliver(&self, rows: &[DeliveryRow], label: &str) -> usize {
        let mut accepted = 0;
        for (i, batch) in rows.chunks(BATCH_SIZE).enumerate() {
            match self.post_rows(batch).await {
                Ok(reply) => {
                    accepted += 1;
                    info!("{} webhook batch {} ({} rows): {}", label, i + 1, batch.len(), reply);
                }
                Err(e) => {
                    error!("{} webhook batch {} failed: {}", label, i + 1, e);
                    if let Some(preview) = e.preview() {
                        error!("{} response preview: {}", label, preview);
                    }
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::RawAdRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn response(status_line: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n", status_line, body.len());
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve the given canned responses, one connection each, and hand back
    /// the raw requests received.
    async fn stub(responses: impl FnOnce(&str) -> Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let replies = responses(&base);
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
            requests
        });
        (base, handle)
    }

    fn row() -> DeliveryRow {
        let scored = ScoredAd {
            ad: RawAdRecord::stub("1234567890"),
            duplicate_count: 2,
            runtime_days: 45,
            winning_score: 35.0,
        };
        DeliveryRow::from_scored(&scored, "https://www.facebook.com/ads/library/?view_all_page_id=1", "Competitor page")
    }

    #[test]
    fn test_row_serializes_camel_case() {
        let value = serde_json::to_value(row()).unwrap();
        assert_eq!(value["winningScore"], 35.0);
        assert_eq!(value["runtimeDays"], 45);
        assert_eq!(value["duplicates"], 2);
        assert_eq!(value["adLibraryLink"], "https://www.facebook.com/ads/library/?id=1234567890");
        assert_eq!(value["landingLink"], "");
        assert_eq!(value["offerType"], "");
    }

    #[test]
    fn test_token_query_param_replaced() {
        let client = WebhookClient::new("https://script.example/macros/s/abc/exec?token=old&v=2", "secret").unwrap();
        assert_eq!(client.endpoint().as_str(), "https://script.example/macros/s/abc/exec?v=2&token=secret");
        assert!(matches!(WebhookClient::new("https://x.example", " "), Err(DeliveryError::Config(_))));
        assert!(matches!(WebhookClient::new("not a url", "t"), Err(DeliveryError::Config(_))));
    }

    #[tokio::test]
    async fn test_direct_json_reply() {
        let (base, server) = stub(|_| vec![response("200 OK", &[("Content-Type", "application/json")], r#"{"ok":true,"added":1}"#)]).await;
        let client = WebhookClient::new(&format!("{}/exec", base), "secret").unwrap();

        let reply = client.post_rows(&[row()]).await.unwrap();
        assert_eq!(reply["added"], 1);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /exec?token=secret"));
        assert!(requests[0].contains(r#""token":"secret""#));
        assert!(requests[0].contains(r#""winningScore":35.0"#));
    }

    #[tokio::test]
    async fn test_redirect_is_followed_with_get() {
        let (base, server) = stub(|base| {
            let location = format!("{}/echo?user_content_key=k", base);
            vec![
                response("302 Found", &[("Location", location.as_str())], ""),
                response("200 OK", &[("Content-Type", "application/json")], r#"{"ok":true}"#),
            ]
        })
        .await;
        let client = WebhookClient::new(&format!("{}/exec", base), "secret").unwrap();

        let reply = client.post_rows(&[row()]).await.unwrap();
        assert_eq!(reply["ok"], true);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /exec"));
        assert!(requests[1].starts_with("GET /echo?user_content_key=k"));
    }

    #[tokio::test]
    async fn test_non_json_reply_is_batch_failure() {
        let html = "<html><body>Sign in to continue</body></html>";
        let (base, _server) = stub(|_| vec![response("200 OK", &[("Content-Type", "text/html")], html)]).await;
        let client = WebhookClient::new(&format!("{}/exec", base), "secret").unwrap();

        let err = client.post_rows(&[row()]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NonJson { status: 200, .. }));
        assert_eq!(err.preview(), Some(html));
    }

    #[tokio::test]
    async fn test_error_status_and_batch_accounting() {
        let rows: Vec<DeliveryRow> = (0..25).map(|_| row()).collect();
        let (base, server) = stub(|_| {
            vec![
                response("500 Internal Server Error", &[], "boom"),
                response("200 OK", &[], r#"{"ok":true}"#),
            ]
        })
        .await;
        let client = WebhookClient::new(&format!("{}/exec", base), "secret").unwrap();

        let accepted = client.deliver(&rows, "[test]").await;
        assert_eq!(accepted, 1);
        assert_eq!(server.await.unwrap().len(), 2);
    }
}
