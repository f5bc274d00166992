use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::CitegraphError;
use crate::graph::{GraphStore, Query, Record};

const GRAPH_API: &str = "neo4j";

/// Graph store reached over the Neo4j transactional HTTP endpoint.
pub struct Neo4jHttpStore {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    database: String,
    user: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Neo4jHttpStore {
    pub fn new(config: &GraphConfig) -> Result<Option<Self>, CitegraphError> {
        let Some(url) = config.resolved_url() else {
            return Ok(None);
        };
        let client = crate::sources::middleware_client(
            Duration::from_secs(config.timeout_secs.max(1)),
            config.max_retries,
        )?;
        Ok(Some(Self {
            client,
            base: Cow::Owned(url),
            database: config.database.trim().to_string(),
            user: config.user.trim().to_string(),
            password: config.resolved_password(),
        }))
    }

    #[cfg(test)]
    fn new_for_test(base: String) -> Self {
        Self {
            client: crate::sources::middleware_client(Duration::from_secs(5), 0)
                .expect("test client"),
            base: Cow::Owned(base),
            database: "neo4j".into(),
            user: "neo4j".into(),
            password: Some("secret".into()),
        }
    }

    pub fn base(&self) -> &str {
        self.base.as_ref()
    }

    fn endpoint(&self) -> String {
        crate::sources::join_endpoint(self.base.as_ref(), &format!("db/{}/tx/commit", self.database))
    }

    pub async fn ping(&self) -> Result<(), CitegraphError> {
        self.run(&Query::new("RETURN 1 AS ok")).await.map(|_| ())
    }
}

#[async_trait]
impl GraphStore for Neo4jHttpStore {
    async fn run(&self, query: &Query) -> Result<Vec<Record>, CitegraphError> {
        let body = json!({
            "statements": [{
                "statement": query.text,
                "parameters": query.params,
                "resultDataContents": ["row"],
            }]
        });
        let mut req = self.client.post(self.endpoint()).json(&body);
        if !self.user.is_empty() {
            req = req.basic_auth(&self.user, self.password.as_deref());
        }
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, GRAPH_API).await?;
        if !status.is_success() {
            return Err(CitegraphError::Api {
                api: GRAPH_API.to_string(),
                message: format!("HTTP {status}: {}", crate::sources::body_excerpt(&bytes)),
            });
        }
        let parsed: TxResponse =
            serde_json::from_slice(&bytes).map_err(|source| CitegraphError::ApiJson {
                api: GRAPH_API.to_string(),
                source,
            })?;
        if let Some(err) = parsed.errors.into_iter().next() {
            return Err(CitegraphError::Graph {
                code: err.code,
                message: err.message,
            });
        }
        let Some(result) = parsed.results.into_iter().next() else {
            return Ok(Vec::new());
        };
        let records: Vec<Record> = result
            .data
            .into_iter()
            .map(|row| {
                result
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.row)
                    .collect::<Record>()
            })
            .collect();
        debug!(rows = records.len(), "graph query finished");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn run_posts_statement_with_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "statements": [{"statement": "MATCH (a:Article {name: $p0}) RETURN a.name AS name", "parameters": {"p0": "1"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"columns": ["name", "n"], "data": [{"row": ["1", 3], "meta": [null, null]}]}],
                "errors": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Neo4jHttpStore::new_for_test(server.uri());
        let mut q = Query::new("MATCH (a:Article {name: $p0}) RETURN a.name AS name");
        q.params.insert("p0".into(), json!("1"));
        let records = store.run(&q).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], json!("1"));
        assert_eq!(records[0]["n"], json!(3));
    }

    #[tokio::test]
    async fn reported_errors_become_graph_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "bad"}]
            })))
            .mount(&server)
            .await;

        let store = Neo4jHttpStore::new_for_test(server.uri());
        let err = store.run(&Query::new("RETURN")).await.unwrap_err();
        assert!(matches!(err, CitegraphError::Graph { ref code, .. } if code.ends_with("SyntaxError")));
    }

    #[test]
    fn store_is_absent_without_url() {
        let config = GraphConfig::default();
        if std::env::var("CITEGRAPH_GRAPH_URL").is_err() {
            assert!(Neo4jHttpStore::new(&config).unwrap().is_none());
        }
    }
}
