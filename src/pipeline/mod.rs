//! Crawl orchestration: search → metadata → citation edges → graph load, one batch at a time.

pub mod citations;
pub mod ledger;
pub mod metadata;
pub mod resolve;

use std::path::{Path, PathBuf};

use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::entities::article::ArticleRecord;
use crate::error::CitegraphError;
use crate::graph::GraphStore;
use crate::graph::curation::{self, CurationSummary};
use crate::graph::load::{GraphLoader, PostProcessSummary, import_url};
use crate::sources::Fetcher;
use crate::sources::eutils::EutilsClient;
use crate::sources::pubtator::PubTatorClient;
use crate::utils::date;

use citations::{AssembleOptions, Assembler, EdgeFileWriter};
use ledger::Ledger;
use metadata::{MetadataFetcher, MetadataOptions};
use resolve::ResolveParams;

pub const ID_LIST_FILE: &str = "pmids.csv";
pub const LEDGER_FILE: &str = "integrated.csv";
pub const EDGE_FILE: &str = "citations.csv";

/// Upstream clients built from one configuration, sharing one rate-limited fetcher.
#[derive(Clone)]
pub struct Upstream {
    pub eutils: EutilsClient,
    pub pubtator: PubTatorClient,
}

impl Upstream {
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self, CitegraphError> {
        let fetcher = Fetcher::new(&config.run.fetch_settings(), cancel)?;
        Ok(Self {
            eutils: EutilsClient::new(
                fetcher.clone(),
                config.services.eutils_base.as_deref(),
                &config.services.tool,
                &config.services.email,
            ),
            pubtator: PubTatorClient::new(fetcher, config.services.pubtator_base.as_deref()),
        })
    }

    pub fn metadata_fetcher(&self, options: MetadataOptions) -> MetadataFetcher {
        MetadataFetcher::new(self.eutils.clone(), self.pubtator.clone(), options)
    }
}

pub fn resolve_params(config: &Config) -> Result<ResolveParams, CitegraphError> {
    let parse = |value: &str, key: &str| {
        date::parse_slash(value).ok_or_else(|| {
            CitegraphError::Config(format!("[search] {key} '{value}' is not YYYY/MM/DD"))
        })
    };
    Ok(ResolveParams {
        term: config.search.query.trim().to_string(),
        retmax: config.search.retmax,
        page_ceiling: config.search.page_ceiling,
        min_date: parse(&config.search.min_date, "min_date")?,
        max_date: parse(&config.search.max_date_or_default(), "max_date")?,
        max_iterations: config.run.max_halving_iterations,
    })
}

pub fn metadata_options(config: &Config) -> Result<MetadataOptions, CitegraphError> {
    Ok(MetadataOptions {
        classes: config.filter.entity_classes()?,
        batch_size: config.run.batch_size,
        run_pubtator: config.run.run_pubtator,
        fetch_full_text: config.run.fetch_full_text,
    })
}

pub fn assemble_options(config: &Config) -> Result<AssembleOptions, CitegraphError> {
    Ok(AssembleOptions {
        classes: config.filter.entity_classes()?,
        filter_terms: config.filter.filter_terms.clone(),
        keywords: config.filter.additional_keywords.clone(),
        test_mode: config.run.test_mode,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub resolved: usize,
    pub resolve_complete: bool,
    pub skipped: usize,
    pub refreshed: usize,
    pub integrated: usize,
    pub exported: usize,
    pub rows: usize,
    pub dropped_batches: usize,
    pub dropped_ids: usize,
    pub edge_file: PathBuf,
    pub cleared: bool,
    pub post_process: Option<PostProcessSummary>,
    pub curation: Option<CurationSummary>,
}

async fn write_focal_rows(
    assembler: &mut Assembler<'_>,
    focal: &[ArticleRecord],
    writer: &mut EdgeFileWriter,
    cancel: &CancellationToken,
) -> Result<(), CitegraphError> {
    for record in focal {
        if cancel.is_cancelled() {
            return Err(CitegraphError::Cancelled);
        }
        for row in assembler.assemble(record).await? {
            writer.append(&row)?;
        }
    }
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<(), CitegraphError> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Run one crawl pass. With a graph store every batch is bulk-loaded as soon as its edge
/// file is written and its focal articles enter the ledger. Without one all batches go to
/// a single edge file and the ledger is left untouched, so a later loading pass still
/// picks those articles up.
pub async fn crawl(
    config: &Config,
    graph: Option<&dyn GraphStore>,
    cancel: CancellationToken,
) -> Result<CrawlSummary, CitegraphError> {
    let data_dir = config.run.data_dir(&config.general.project_name);
    ensure_dir(&data_dir)?;
    let classes = config.filter.entity_classes()?;
    let upstream = Upstream::from_config(config, cancel.clone())?;
    let mut summary = CrawlSummary {
        edge_file: data_dir.join(EDGE_FILE),
        ..CrawlSummary::default()
    };

    let outcome = resolve::resolve(&upstream.eutils, &resolve_params(config)?).await?;
    resolve::write_id_list(&data_dir.join(ID_LIST_FILE), &outcome.ids)?;
    summary.resolved = outcome.ids.len();
    summary.resolve_complete = outcome.complete;

    let mut ledger = Ledger::open(&data_dir.join(LEDGER_FILE))?;
    let loader = graph.map(|store| GraphLoader::new(store, &classes));
    if config.run.delete_graph {
        match &loader {
            Some(loader) => {
                loader.clear_graph().await?;
                ledger.clear()?;
                summary.cleared = true;
            }
            None => warn!("delete_graph ignored without a graph store"),
        }
    }
    if config.run.refresh_old_articles {
        let max_age = time::Duration::seconds(
            i64::try_from(config.run.max_integration_age_secs).unwrap_or(i64::MAX),
        );
        summary.refreshed = ledger
            .refresh(
                OffsetDateTime::now_utc(),
                max_age,
                config.run.max_count_integration_batch,
            )?
            .len();
    }
    let pending = ledger.filter_new(&outcome.ids);
    summary.skipped = outcome.ids.len() - pending.len();
    info!(
        resolved = summary.resolved,
        pending = pending.len(),
        skipped = summary.skipped,
        "crawl planned"
    );

    if let Some(loader) = &loader {
        loader.setup_indexes().await?;
    }

    let fetcher = upstream.metadata_fetcher(metadata_options(config)?);
    let mut assembler = Assembler::new(&fetcher, assemble_options(config)?);
    let integration_date = date::to_iso(date::today_utc());
    let mut next_row_id = 0u64;
    let mut shared_writer = if loader.is_some() {
        None
    } else {
        Some(EdgeFileWriter::create(&summary.edge_file, &classes, 0)?)
    };

    for (n, batch) in pending.chunks(config.run.batch_size.max(1)).enumerate() {
        if cancel.is_cancelled() {
            return Err(CitegraphError::Cancelled);
        }
        let table = fetcher.fetch_batch(batch).await?;
        if !table.dropped.is_empty() {
            summary.dropped_batches += 1;
            summary.dropped_ids += table.dropped.len();
            warn!(batch = n, dropped = table.dropped.len(), "batch left out of the ledger");
        }
        if table.is_empty() {
            continue;
        }
        let focal_ids: Vec<String> = table.records().iter().map(|r| r.pmid.clone()).collect();
        assembler.remember(table.records().iter().cloned());

        match (&loader, shared_writer.as_mut()) {
            (_, Some(writer)) => {
                let before = writer.written();
                write_focal_rows(&mut assembler, table.records(), writer, &cancel).await?;
                summary.rows += writer.written() - before;
                summary.exported += focal_ids.len();
            }
            (Some(loader), None) => {
                let mut writer = EdgeFileWriter::create(&summary.edge_file, &classes, next_row_id)?;
                write_focal_rows(&mut assembler, table.records(), &mut writer, &cancel).await?;
                next_row_id = writer.next_row_id();
                summary.rows += writer.written();
                let path = writer.finish()?;
                let url = import_url(config.graph.import_file_url.as_deref(), &path);
                loader.load_edges(&url, &integration_date).await?;
                loader.tag_main(&focal_ids).await?;
                summary.integrated += ledger.append(&focal_ids, OffsetDateTime::now_utc())?;
            }
            (None, None) => {
                return Err(CitegraphError::Config("no edge file writer".into()));
            }
        }
        assembler.end_batch();

        info!(
            batch = n,
            focal = focal_ids.len(),
            integrated = summary.integrated,
            exported = summary.exported,
            rows = summary.rows,
            "batch written"
        );
    }

    if let Some(writer) = shared_writer {
        writer.finish()?;
    }
    if let Some(loader) = &loader {
        summary.post_process = Some(loader.post_process().await?);
    }
    if let (Some(store), Some(path)) = (graph, config.run.curation_file.as_deref()) {
        summary.curation = Some(curation::apply_file(store, path).await?);
    }
    info!(
        integrated = summary.integrated,
        rows = summary.rows,
        dropped_batches = summary.dropped_batches,
        "crawl finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::RecordingStore;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer, dir: &Path) -> Config {
        let mut config = Config::default();
        config.search.query = "kidney injury".into();
        config.filter.bioconcepts = "gene,disease".into();
        config.filter.filter_terms = vec!["kidney".into()];
        config.run.run_pubtator = false;
        config.run.fetch_full_text = false;
        config.run.request_delay_ms = 0;
        config.run.min_host_interval_ms = 0;
        config.run.max_attempts = 2;
        config.run.backoff_base_ms = 1;
        config.run.backoff_max_ms = 2;
        config.run.data_dir = Some(dir.to_path_buf());
        config.services.eutils_base = Some(server.uri());
        config.services.pubtator_base = Some(server.uri());
        config
    }

    async fn mount_eutils(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"count": "2", "idlist": ["1", "2"]}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/esummary.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "uids": ["1", "2", "3"],
                    "1": {"uid": "1", "title": "Kidney injury", "sortpubdate": "2020/01/01 00:00",
                          "epubdate": "2020 Jan 5", "pubdate": "2020", "fulljournalname": "J"},
                    "2": {"uid": "2", "title": "Heart", "sortpubdate": "2021/01/01 00:00",
                          "epubdate": "", "pubdate": "2021 Spring", "fulljournalname": "J"},
                    "3": {"uid": "3", "title": "Kidney fibrosis", "sortpubdate": "2022/01/01 00:00",
                          "epubdate": "2022 Feb 1", "pubdate": "2022", "fulljournalname": "K"}
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/elink.fcgi"))
            .and(query_param("id", "1"))
            .and(query_param("linkname", "pubmed_pubmed_citedin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "linksets": [{"linksetdbs": [{"links": ["3"]}]}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/elink.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "linksets": [{"dbfrom": "pubmed"}]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn crawl_without_graph_exports_edges_and_leaves_ledger_alone() {
        let server = MockServer::start().await;
        mount_eutils(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&server, dir.path());

        let summary = crawl(&config, None, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.exported, 2);
        assert_eq!(summary.integrated, 0);
        assert_eq!(summary.rows, 2);

        let text = std::fs::read_to_string(dir.path().join(EDGE_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0|3|Kidney fibrosis|"));
        assert!(lines[2].starts_with("1|2|Heart|"));
        assert!(lines[2].contains("|2021-03-01|"));
        assert!(!dir.path().join(LEDGER_FILE).exists());

        let again = crawl(&config, None, CancellationToken::new()).await.unwrap();
        assert_eq!(again.skipped, 0);
        assert_eq!(again.rows, 2);
        let rerun = std::fs::read_to_string(dir.path().join(EDGE_FILE)).unwrap();
        assert_eq!(rerun, text);
    }

    #[tokio::test]
    async fn loaded_crawl_skips_ledgered_ids_on_rerun() {
        let server = MockServer::start().await;
        mount_eutils(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&server, dir.path());
        let store = RecordingStore::default();

        let first = crawl(&config, Some(&store as &dyn GraphStore), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.integrated, 2);
        assert_eq!(Ledger::open(&dir.path().join(LEDGER_FILE)).unwrap().len(), 2);

        let again = crawl(&config, Some(&store as &dyn GraphStore), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(again.integrated, 0);
        assert_eq!(again.rows, 0);
    }

    #[tokio::test]
    async fn crawl_loads_each_batch_and_post_processes() {
        let server = MockServer::start().await;
        mount_eutils(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&server, dir.path());
        config.run.batch_size = 1;
        config.graph.import_file_url = Some("file:///import/citations.csv".into());

        let store = RecordingStore::default();
        let summary = crawl(&config, Some(&store as &dyn GraphStore), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.integrated, 2);
        assert!(summary.post_process.is_some());

        let queries = store.queries.lock().unwrap();
        let loads: Vec<_> = queries
            .iter()
            .filter(|q| q.text.starts_with("LOAD CSV"))
            .collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].params["file_url"], json!("file:///import/citations.csv"));
        let tags = queries.iter().filter(|q| q.text.contains("SET a.query")).count();
        assert_eq!(tags, 2);

        let text = std::fs::read_to_string(dir.path().join(EDGE_FILE)).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("1|2|"));
    }

    #[tokio::test]
    async fn delete_graph_clears_store_and_ledger_then_curates() {
        let server = MockServer::start().await;
        mount_eutils(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&server, dir.path());
        let store = RecordingStore::default();
        crawl(&config, Some(&store as &dyn GraphStore), CancellationToken::new())
            .await
            .unwrap();

        let curation_file = dir.path().join("curate.json");
        std::fs::write(
            &curation_file,
            r#"{"fix": {"name": "fix", "description": "", "from_keys": ["name"],
                "from_values": ["p53"], "to_keys": ["name"], "to_values": ["7157"],
                "method": "rename"}}"#,
        )
        .unwrap();
        config.run.delete_graph = true;
        config.run.curation_file = Some(curation_file);
        store.queries.lock().unwrap().clear();

        let summary = crawl(&config, Some(&store as &dyn GraphStore), CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.cleared);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.integrated, 2);
        assert_eq!(summary.curation.as_ref().map(|c| c.applied), Some(1));

        let queries = store.queries.lock().unwrap();
        assert_eq!(queries[0].text, "MATCH (n) DETACH DELETE n");
        assert!(queries.last().unwrap().text.starts_with("MATCH (n) WHERE n.name = $p0 SET n.name = $p1"));
    }

    #[tokio::test]
    async fn cancelled_crawl_stops() {
        let server = MockServer::start().await;
        mount_eutils(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&server, dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = crawl(&config, None, cancel).await.unwrap_err();
        assert!(matches!(err, CitegraphError::Cancelled));
    }
}
