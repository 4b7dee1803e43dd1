//! HTTP dispatch to the cluster
//!
//! One keep-alive client serves every configured server: at most three
//! idle connections per host, 60 s idle keepalive, and a request budget of
//! the configured timeout plus one second of client-side overhead. Bulk
//! requests and health probes run in spawned tasks and report back to the
//! indexer through its event mailbox.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Completions delivered to the indexer's event mailbox
#[derive(Debug)]
pub enum SinkEvent {
    /// A bulk request finished, one way or the other
    Bulk {
        id: String,
        outcome: Result<HttpReply, String>,
    },
    /// A cluster health probe finished
    Health(bool),
}

/// The parts of an HTTP response the indexer cares about
#[derive(Debug)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// What a 2xx bulk body said
#[derive(Debug, PartialEq, Eq)]
pub struct BulkSummary {
    pub indexed: u64,
    pub item_errors: u64,
}

/// Decode a bulk response body shaped `{ took, items[], errors? }`.
///
/// Anything else returns `None`; a success with an undecodable body is
/// still a success, it just doesn't move the item counters.
pub fn parse_bulk_body(body: &str) -> Option<BulkSummary> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("took")?;
    let items = value.get("items")?.as_array()?;
    let item_errors = items
        .iter()
        .filter(|item| {
            item.get("create")
                .map(|c| c.get("error").is_some())
                .unwrap_or(false)
        })
        .count() as u64;
    Some(BulkSummary {
        indexed: items.len() as u64,
        item_errors,
    })
}

pub struct EsClient {
    http: reqwest::Client,
    servers: Vec<String>,
}

impl EsClient {
    pub fn new(servers: &[String], timeout_secs: u64) -> Result<Self> {
        ensure!(!servers.is_empty(), "no servers configured");
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(3)
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(timeout_secs + 1))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            servers: servers.to_vec(),
        })
    }

    fn pick_server(&self) -> &str {
        let i = rand::rng().random_range(0..self.servers.len());
        &self.servers[i]
    }

    /// Fire one bulk request; the outcome lands in the mailbox.
    pub fn spawn_bulk(&self, id: String, body: Vec<u8>, evt_tx: mpsc::Sender<SinkEvent>) {
        let url = format!("http://{}/_bulk", self.pick_server());
        debug!(batch = %id, %url, bytes = body.len(), "dispatching bulk request");
        let request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        tokio::spawn(async move {
            let outcome = match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    Ok(HttpReply { status, body })
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = evt_tx.send(SinkEvent::Bulk { id, outcome }).await;
        });
    }

    /// Probe cluster health; green or yellow counts as ready.
    pub fn spawn_health(&self, evt_tx: mpsc::Sender<SinkEvent>) {
        let url = format!("http://{}/_cluster/health", self.pick_server());
        let request = self.http.get(&url);
        tokio::spawn(async move {
            let healthy = match request.send().await {
                Ok(resp) if resp.status().is_success() => resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.get("status")
                            .and_then(Value::as_str)
                            .map(|s| s == "green" || s == "yellow")
                    })
                    .unwrap_or(false),
                _ => false,
            };
            let _ = evt_tx.send(SinkEvent::Health(healthy)).await;
        });
    }

    /// Install missing or changed index templates.
    ///
    /// Failures are logged and left for the next startup; ingestion never
    /// waits on templates.
    pub async fn sync_templates(&self, templates: &HashMap<String, Value>) {
        for (name, wanted) in templates {
            let url = format!("http://{}/_template/{}", self.pick_server(), name);
            let current = match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get(name).cloned()),
                Ok(_) => None,
                Err(e) => {
                    warn!(template = %name, error = %e, "template fetch failed");
                    continue;
                }
            };
            if current.as_ref() == Some(wanted) {
                debug!(template = %name, "template up to date");
                continue;
            }
            match self.http.put(&url).json(wanted).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(template = %name, "template installed");
                }
                Ok(resp) => {
                    warn!(template = %name, status = resp.status().as_u16(), "template install rejected");
                }
                Err(e) => {
                    warn!(template = %name, error = %e, "template install failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bulk_body_counts_items_and_item_errors() {
        let body = json!({
            "took": 7,
            "errors": true,
            "items": [
                {"create": {}},
                {"create": {"error": {"type": "mapper_parsing_exception"}}},
                {"create": {}},
            ]
        })
        .to_string();
        assert_eq!(
            parse_bulk_body(&body),
            Some(BulkSummary {
                indexed: 3,
                item_errors: 1
            })
        );
    }

    #[test]
    fn malformed_bodies_are_none() {
        assert_eq!(parse_bulk_body("not json"), None);
        assert_eq!(parse_bulk_body("{}"), None);
        assert_eq!(parse_bulk_body(r#"{"took": 3}"#), None);
    }

    #[test]
    fn empty_server_list_is_refused() {
        assert!(EsClient::new(&[], 5).is_err());
    }
}
