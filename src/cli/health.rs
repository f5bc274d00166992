use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::CitegraphError;
use crate::graph::neo4j::Neo4jHttpStore;
use crate::pipeline::Upstream;

const PROBE_PMID: &str = "22663011";
const NOT_CONFIGURED: &str = "not configured";

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRow {
    pub api: String,
    pub status: String,
    pub latency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affects: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub total: usize,
    pub rows: Vec<HealthRow>,
}

impl HealthReport {
    fn from_rows(rows: Vec<HealthRow>) -> Self {
        let checked = rows.iter().filter(|r| r.status != NOT_CONFIGURED);
        let total = checked.clone().count();
        let healthy = checked.filter(|r| r.status == "ok").count();
        Self { healthy, total, rows }
    }

    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let show_affects = self.rows.iter().any(|row| row.affects.is_some());
        out.push_str("# Citegraph Health Check\n\n");
        if show_affects {
            out.push_str("| Service | Status | Latency | Affects |\n");
            out.push_str("|---------|--------|---------|---------|\n");
        } else {
            out.push_str("| Service | Status | Latency |\n");
            out.push_str("|---------|--------|---------|\n");
        }
        for row in &self.rows {
            if show_affects {
                let affects = row.affects.as_deref().unwrap_or("-");
                out.push_str(&format!(
                    "| {} | {} | {} | {affects} |\n",
                    row.api, row.status, row.latency
                ));
            } else {
                out.push_str(&format!("| {} | {} | {} |\n", row.api, row.status, row.latency));
            }
        }
        out.push_str(&format!(
            "\nStatus: {}/{} services healthy\n",
            self.healthy, self.total
        ));
        out
    }
}

fn affects_for(service: &str) -> Option<&'static str> {
    match service {
        "E-utilities" => Some("identifier search, metadata and citation links"),
        "PubTator3" => Some("entity annotations"),
        "Graph store" => Some("crawl loading and enrich"),
        _ if service.starts_with("Data dir") => Some("id lists, edge files and the ledger"),
        _ => None,
    }
}

fn ok_row(service: &str, start: Instant) -> HealthRow {
    HealthRow {
        api: service.to_string(),
        status: "ok".into(),
        latency: format!("{}ms", start.elapsed().as_millis()),
        affects: None,
    }
}

fn error_row(service: &str, latency: String) -> HealthRow {
    HealthRow {
        api: service.to_string(),
        status: "error".into(),
        latency,
        affects: affects_for(service).map(str::to_string),
    }
}

async fn check_one(client: reqwest::Client, service: &str, url: String) -> HealthRow {
    let start = Instant::now();
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => ok_row(service, start),
        Ok(resp) => error_row(
            service,
            format!(
                "{}ms (HTTP {})",
                start.elapsed().as_millis(),
                resp.status().as_u16()
            ),
        ),
        Err(err) => {
            let reason = if err.is_timeout() {
                "timeout"
            } else if err.is_connect() {
                "connect"
            } else {
                "error"
            };
            error_row(service, reason.into())
        }
    }
}

async fn check_graph(store: Option<&Neo4jHttpStore>) -> HealthRow {
    let service = "Graph store";
    let Some(store) = store else {
        return HealthRow {
            api: service.into(),
            status: NOT_CONFIGURED.into(),
            latency: "-".into(),
            affects: None,
        };
    };
    let start = Instant::now();
    match store.ping().await {
        Ok(()) => ok_row(service, start),
        Err(CitegraphError::Graph { code, .. }) => error_row(service, code),
        Err(CitegraphError::HttpMiddleware(err)) if err.is_timeout() => error_row(service, "timeout".into()),
        Err(CitegraphError::HttpMiddleware(err)) if err.is_connect() => error_row(service, "connect".into()),
        Err(_) => error_row(service, "error".into()),
    }
}

async fn check_data_dir(dir: PathBuf) -> HealthRow {
    let start = Instant::now();
    let service = format!("Data dir ({})", dir.display());
    let scratch = dir.join(format!(".citegraph-healthcheck-{}.tmp", std::process::id()));
    let result = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&scratch, b"ok").await?;
        match tokio::fs::remove_file(&scratch).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
    .await;
    match result {
        Ok(()) => ok_row(&service, start),
        Err(err) => error_row(&service, format!("{:?}", err.kind())),
    }
}

/// Probe both literature services, the graph store, and (unless `apis_only`) the data
/// directory, concurrently.
///
/// # Errors
///
/// Returns an error when an HTTP client or the graph client cannot be created.
pub async fn check(config: &Config, apis_only: bool) -> Result<HealthReport, CitegraphError> {
    let upstream = Upstream::from_config(config, CancellationToken::new())?;
    let client = crate::sources::streaming_http_client(Duration::from_secs(10))?;
    let store = Neo4jHttpStore::new(&config.graph)?;

    let eutils_url = crate::sources::join_endpoint(upstream.eutils.base(), "einfo.fcgi?db=pubmed&retmode=json");
    let pubtator_url = crate::sources::join_endpoint(
        upstream.pubtator.base(),
        &format!("publications/export/pubtator?pmids={PROBE_PMID}"),
    );
    let (eutils, pubtator, graph) = tokio::join!(
        check_one(client.clone(), "E-utilities", eutils_url),
        check_one(client, "PubTator3", pubtator_url),
        check_graph(store.as_ref()),
    );

    let mut rows = vec![eutils, pubtator, graph];
    if !apis_only {
        let dir = config.run.data_dir(&config.general.project_name);
        rows.push(check_data_dir(dir).await);
    }
    Ok(HealthReport::from_rows(rows))
}
