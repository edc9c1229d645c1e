use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::rotation::IndexRotation;
use crate::backends::Sink;
use crate::common::SealedBatch;

/// 🔌 TCP connect budget. The per-request timeout comes from the pipeline config.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSinkConfig {
    /// 📡 Where to send the documents.
    pub url: String,
    /// 🔒 Username. The bouncer at the club. Except the club is a database.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key. Wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 📦 Base index name. Rotation appends a date suffix to it.
    pub index: String,
    /// 🏷️ Document type for clusters that still have types. Empty means "omit `_type`".
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub index_rotation: IndexRotation,
}

/// 📡 The Elasticsearch sink. Pure I/O, zero buffering, zero retries.
///
/// Internally holds a `reqwest::Client` (connection pool included, cheap to
/// clone) and the config. One `write_batch` call is one `_bulk` request.
///
/// ⚠️ A `_bulk` response can be HTTP 200 and still carry `"errors": true` with
/// some items rejected. That counts as a failed batch: the pipeline retries
/// the whole thing and eventually backs the whole thing up. Documents that
/// did land may land again. At-least-once says that's fine.
#[derive(Debug, Clone)]
pub(crate) struct ElasticsearchSink {
    client: reqwest::Client,
    sink_config: ElasticsearchSinkConfig,
}

impl ElasticsearchSink {
    /// 🚀 Build the client (10s connect, `request_timeout` per request) and say hello to the cluster.
    ///
    /// Unlike a one-off migration, a forwarder should come up even when the
    /// cluster is briefly down: records still get buffered, retried and, if
    /// it stays down, backed up. So a failed ping is a warning, not a bail.
    pub(crate) async fn new(config: ElasticsearchSinkConfig, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert store.")?;

        let sink = Self {
            client,
            sink_config: config,
        };

        match sink.authorize(sink.client.get(&sink.sink_config.url)).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %sink.sink_config.url, "✅ Elasticsearch answered the ping. Cluster is home.");
            }
            Ok(response) => warn!(
                url = %sink.sink_config.url,
                status = %response.status(),
                "⚠️ Elasticsearch answered the ping, but not kindly. Writes will be retried and backed up if this persists."
            ),
            Err(e) => warn!(
                url = %sink.sink_config.url,
                error = %e,
                "⚠️ Elasticsearch did not answer the ping. Starting anyway; failed batches go to backup."
            ),
        }
        Ok(sink)
    }

    /// 🔒 API key beats basic auth in this club.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.sink_config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.sink_config.username {
            request.basic_auth(username, self.sink_config.password.as_ref())
        } else {
            request
        }
    }

    /// 📜 Render a batch into a `_bulk` body: action line, source line, repeat.
    fn render_bulk_body(&self, batch: &SealedBatch, index: &str) -> Result<Vec<u8>> {
        let action = if self.sink_config.type_name.is_empty() {
            json!({ "index": { "_index": index } })
        } else {
            json!({ "index": { "_index": index, "_type": self.sink_config.type_name } })
        };
        let action_line = serde_json::to_vec(&action).context("💀 could not serialize the bulk action line")?;

        let mut body = Vec::with_capacity(batch.size_bytes() + batch.len() * (action_line.len() + 2));
        for record in batch.records() {
            // -- ✂️ a trailing newline in the source would end the document early
            let source = record.body().strip_suffix(b"\n").unwrap_or(record.body());
            let source = source.strip_suffix(b"\r").unwrap_or(source);
            body.extend_from_slice(&action_line);
            body.push(b'\n');
            body.extend_from_slice(source);
            body.push(b'\n');
        }
        Ok(body)
    }
}

/// 🔍 Pull the first item-level error out of a `_bulk` response, for the log line.
fn first_item_error(response: &Value) -> Option<String> {
    response
        .get("items")?
        .as_array()?
        .iter()
        .filter_map(|item| item.as_object()?.values().next()?.get("error"))
        .map(|error| error.to_string())
        .next()
}

fn failed_item_count(response: &Value) -> usize {
    response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    item.as_object()
                        .and_then(|actions| actions.values().next())
                        .is_some_and(|result| result.get("error").is_some())
                })
                .count()
        })
        .unwrap_or(0)
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn write_batch(&mut self, batch: &SealedBatch) -> Result<()> {
        let index = self.sink_config.index_rotation.resolve(&self.sink_config.index, Utc::now());
        let request_body = self.render_bulk_body(batch, &index)?;
        debug!(
            batch_id = %batch.id(),
            records = batch.len(),
            bytes = request_body.len(),
            index = %index,
            "📡 sending batch to /_bulk"
        );

        let bulk_url = format!("{}/_bulk", self.sink_config.url.trim_end_matches('/'));
        let response = self
            .authorize(self.client.post(&bulk_url))
            // ⚠️ application/x-ndjson, not application/json. Elasticsearch cares. Deeply.
            .header("Content-Type", "application/x-ndjson")
            .body(request_body)
            .send()
            .await
            .context("💀 The bulk request never made it to Elasticsearch. Check connectivity, check timeouts, check your feelings.")?;

        let status = response.status();
        let response_body = response
            .bytes()
            .await
            .context("💀 Elasticsearch hung up halfway through its bulk response")?;
        if !status.is_success() {
            bail!(
                "💀 Elasticsearch answered the bulk request for batch {} with '{}'. The response read: '{}'",
                batch.id(),
                status,
                String::from_utf8_lossy(&response_body)
            );
        }

        let parsed: Value = serde_json::from_slice(&response_body).with_context(|| {
            format!(
                "💀 Elasticsearch said {} but the bulk response is not JSON, so nobody can vouch for batch {}",
                status,
                batch.id()
            )
        })?;
        if parsed.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            bail!(
                "💀 Elasticsearch rejected {} of {} documents in batch {}. First complaint: {}",
                failed_item_count(&parsed),
                batch.len(),
                batch.id(),
                first_item_error(&parsed).unwrap_or_else(|| "(none given)".to_string())
            );
        }

        trace!(batch_id = %batch.id(), "🚀 bulk request landed. documents have left the building");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("🗑️ Elasticsearch sink closing. No buffer to flush, just vibes to release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::common::Batch;
    use crate::common::tests::record;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    fn config(url: &str) -> ElasticsearchSinkConfig {
        ElasticsearchSinkConfig {
            url: url.to_string(),
            username: None,
            password: None,
            api_key: None,
            index: "events".to_string(),
            type_name: String::new(),
            index_rotation: IndexRotation::NoRotation,
        }
    }

    fn sealed(bodies: &[&str]) -> SealedBatch {
        let mut batch = Batch::open(Instant::now());
        for body in bodies {
            batch.push(record(body));
        }
        batch.seal(Instant::now())
    }

    async fn server_with_ping() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tagline": "You Know, for Search"})))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn the_one_where_a_batch_becomes_exactly_one_bulk_request() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string(
                "{\"index\":{\"_index\":\"events\"}}\n{\"a\":1}\n{\"index\":{\"_index\":\"events\"}}\n{\"b\":2}\n",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut sink = ElasticsearchSink::new(config(&server.uri()), REQUEST_TIMEOUT).await?;
        sink.write_batch(&sealed(&[r#"{"a":1}"#, "{\"b\":2}\n"])).await?;
        sink.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_type_shows_up_when_configured() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(body_string("{\"index\":{\"_index\":\"events\",\"_type\":\"doc\"}}\n{\"a\":1}\n"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.type_name = "doc".to_string();
        let mut sink = ElasticsearchSink::new(cfg, REQUEST_TIMEOUT).await?;
        sink.write_batch(&sealed(&[r#"{"a":1}"#])).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_http_500_is_a_failed_batch() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(503).set_body_string("cluster_block_exception"))
            .mount(&server)
            .await;

        let mut sink = ElasticsearchSink::new(config(&server.uri()), REQUEST_TIMEOUT).await?;
        let err = sink
            .write_batch(&sealed(&["{}"]))
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("💀 a 503 should not count as delivered"))?;
        assert!(format!("{err:#}").contains("cluster_block_exception"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_200_with_item_errors_is_still_a_failure() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    {"index": {"status": 201}},
                    {"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}
                ]
            })))
            .mount(&server)
            .await;

        let mut sink = ElasticsearchSink::new(config(&server.uri()), REQUEST_TIMEOUT).await?;
        let err = sink
            .write_batch(&sealed(&["{}", "{}"]))
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("💀 partial failure should fail the whole batch"))?;
        let message = format!("{err:#}");
        assert!(message.contains("1 of 2"), "got: {message}");
        assert!(message.contains("mapper_parsing_exception"), "got: {message}");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_api_key_wins_the_auth_argument() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Authorization", "ApiKey sesame"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.api_key = Some("sesame".to_string());
        cfg.username = Some("ignored".to_string());
        let mut sink = ElasticsearchSink::new(cfg, REQUEST_TIMEOUT).await?;
        sink.write_batch(&sealed(&["{}"])).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_configured_request_timeout_is_the_one_that_counts() -> Result<()> {
        let server = server_with_ping().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"errors": false, "items": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        // -- 🐌 two seconds is nothing next to a 30s default, and far too slow for a 1s budget
        let mut impatient = ElasticsearchSink::new(config(&server.uri()), Duration::from_secs(1)).await?;
        assert!(impatient.write_batch(&sealed(&["{}"])).await.is_err());

        let mut patient = ElasticsearchSink::new(config(&server.uri()), Duration::from_secs(5)).await?;
        patient.write_batch(&sealed(&["{}"])).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_unreachable_cluster_does_not_block_startup() -> Result<()> {
        // -- 🕳️ nothing listens on port 9 of localhost. probably.
        let mut sink = ElasticsearchSink::new(config("http://127.0.0.1:9"), REQUEST_TIMEOUT).await?;
        assert!(sink.write_batch(&sealed(&["{}"])).await.is_err());
        Ok(())
    }
}
