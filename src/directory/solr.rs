//! HTTP backend for Solr-compatible index services.

use crate::directory::error::IndexError;
use crate::directory::index::{Document, IndexConnector, IndexSession};
use crate::directory::query::Query;
use async_trait::async_trait;
use peershare_core::constants::fields;
use peershare_core::core::IndexConfig;
use peershare_core::log_trace;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

const MAX_ERROR_BODY: usize = 512;

/// Opens [`SolrSession`]s over a shared HTTP client.
#[derive(Clone)]
pub struct SolrConnector {
    http: reqwest::Client,
    commit_within_ms: u128,
}

impl SolrConnector {
    /// Build a connector with the configured timeouts.
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            commit_within_ms: config.commit_within.as_millis(),
        })
    }
}

#[async_trait]
impl IndexConnector for SolrConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexSession>, IndexError> {
        let base = parse_base(endpoint)?;
        Ok(Arc::new(SolrSession {
            endpoint: endpoint.to_string(),
            base,
            http: self.http.clone(),
            commit_within: self.commit_within_ms.to_string(),
        }))
    }
}

/// Normalise a core URL so relative joins stay inside the core.
fn parse_base(endpoint: &str) -> Result<Url, IndexError> {
    let with_slash = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{}/", endpoint)
    };
    Url::parse(&with_slash).map_err(|e| IndexError::InvalidUrl {
        url: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// One Solr core reached over HTTP.
pub struct SolrSession {
    endpoint: String,
    base: Url,
    http: reqwest::Client,
    commit_within: String,
}

impl SolrSession {
    fn url(&self, path: &str) -> Result<Url, IndexError> {
        self.base.join(path).map_err(|e| IndexError::InvalidUrl {
            url: format!("{}{}", self.base, path),
            reason: e.to_string(),
        })
    }

    /// POST a JSON update command with the soft-commit window attached.
    async fn update(&self, body: Value) -> Result<(), IndexError> {
        let url = self.url("update")?;
        log_trace!("POST {} {}", url, body);
        let response = self
            .http
            .post(url)
            .query(&[("commitWithin", self.commit_within.as_str()), ("wt", "json")])
            .json(&body)
            .send()
            .await?;
        checked(response).await.map(|_| ())
    }
}

/// Turn a non-success response into [`IndexError::Status`], else parse JSON.
async fn checked(response: reqwest::Response) -> Result<Value, IndexError> {
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(IndexError::Status { status: status.as_u16(), body });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| IndexError::Decode(e.to_string()))
}

#[async_trait]
impl IndexSession for SolrSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), IndexError> {
        let response = self
            .http
            .get(self.url("admin/ping")?)
            .query(&[("wt", "json")])
            .send()
            .await?;
        let body = checked(response).await?;
        match body.get("status").and_then(Value::as_str) {
            None | Some("OK") => Ok(()),
            Some(other) => Err(IndexError::Decode(format!("ping status {}", other))),
        }
    }

    async fn upsert(&self, docs: Vec<Document>) -> Result<(), IndexError> {
        if docs.is_empty() {
            return Ok(());
        }
        self.update(Value::Array(docs.into_iter().map(Value::Object).collect())).await
    }

    async fn set_fields(&self, id: &str, updates: Document) -> Result<(), IndexError> {
        let mut doc = Document::new();
        doc.insert(fields::ID.into(), json!(id));
        for (name, value) in updates {
            doc.insert(name, json!({ "set": value }));
        }
        self.update(json!([doc])).await
    }

    async fn delete_by_ids(&self, ids: Vec<String>) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.update(json!({ "delete": ids })).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError> {
        let q = query.filter.to_solr();
        let fl = query.fields.join(",");
        let rows = query.rows.min(i32::MAX as usize).to_string();
        log_trace!("select q={} fl={} rows={}", q, fl, rows);

        let response = self
            .http
            .get(self.url("select")?)
            .query(&[("q", q.as_str()), ("fl", fl.as_str()), ("rows", rows.as_str()), ("wt", "json")])
            .send()
            .await?;
        let body = checked(response).await?;
        decode_docs(body)
    }

    async fn commit(&self) -> Result<(), IndexError> {
        let response = self
            .http
            .post(self.url("update")?)
            .query(&[("commit", "true"), ("wt", "json")])
            .json(&json!({ "commit": {} }))
            .send()
            .await?;
        checked(response).await.map(|_| ())
    }
}

/// Extract `response.docs` from a select response.
fn decode_docs(mut body: Value) -> Result<Vec<Document>, IndexError> {
    let docs = body
        .pointer_mut("/response/docs")
        .map(Value::take)
        .ok_or_else(|| IndexError::Decode("select response without response.docs".into()))?;
    match docs {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(doc) => Some(doc),
                _ => None,
            })
            .collect()),
        _ => Err(IndexError::Decode("response.docs is not an array".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_gets_trailing_slash() {
        let base = parse_base("http://localhost:8983/solr/napster_clone").unwrap();
        assert_eq!(
            base.join("admin/ping").unwrap().as_str(),
            "http://localhost:8983/solr/napster_clone/admin/ping"
        );
        assert!(matches!(parse_base("not a url"), Err(IndexError::InvalidUrl { .. })));
    }

    #[test]
    fn test_decode_select_response() {
        let body = json!({
            "responseHeader": {"status": 0},
            "response": {"numFound": 1, "docs": [{"id": "file-a-1", "size_l": 3}]}
        });
        let docs = decode_docs(body).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "file-a-1");

        assert!(decode_docs(json!({"error": "boom"})).is_err());
    }
}
