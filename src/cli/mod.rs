//! Top-level CLI parsing and command execution.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::entities::EntityClass;
use crate::entities::article::ArticleRecord;
use crate::error::CitegraphError;
use crate::graph::GraphStore;
use crate::graph::curation;
use crate::graph::enrichment::{EnrichmentParams, FilterLists, run_enrichment};
use crate::graph::neo4j::Neo4jHttpStore;
use crate::pipeline::citations::{Assembler, EdgeFileWriter, EdgeRow};
use crate::pipeline::{self, ID_LIST_FILE, Upstream, resolve};
use crate::render;

pub mod health;
pub mod list;

#[derive(Parser, Debug)]
#[command(
    name = "citegraph",
    about = "Build a citation and named-entity graph from PubMed, and rank entities enriched in article subsets",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: citegraph.toml in the working directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output as JSON instead of Markdown
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect PubMed identifiers for a query, halving the date window past the page ceiling
    #[command(after_help = "\
EXAMPLES:
  citegraph resolve \"amyotrophic lateral sclerosis\"
  citegraph resolve --retmax 500 --out als.csv")]
    Resolve {
        /// Search query (default: [search] query)
        query: Option<String>,
        /// Maximum identifiers to collect
        #[arg(long)]
        retmax: Option<usize>,
        /// Identifier list to write (default: <data_dir>/pmids.csv)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Fetch summaries and entity annotations for PMIDs
    Metadata {
        /// Comma-separated PMIDs
        ids: String,
        /// Entity classes to keep (default: [filter] bioconcepts)
        #[arg(long)]
        classes: Option<String>,
        /// Skip the annotation service
        #[arg(long)]
        no_pubtator: bool,
        /// Also annotate open-access full text
        #[arg(long)]
        full_text: bool,
    },
    /// Citation edge rows for one article
    Assemble {
        /// Focal PMID
        pmid: String,
        /// Also write the rows to this edge file
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Keep only the first few links in each direction
        #[arg(long)]
        test_mode: bool,
    },
    /// Resolve, fetch, assemble and load the configured query
    Crawl {
        /// Write edge files without loading them into the graph store
        #[arg(long)]
        no_load: bool,
    },
    /// Apply merge/rename/query steps from a curation file to the graph store
    Curate {
        /// Curation JSON file (defaults to [run] curation_file)
        file: Option<PathBuf>,
    },
    /// Rank entities over-represented in a subset of the graph
    #[command(after_help = "\
EXAMPLES:
  citegraph enrich --goal gene --label disease --attribute label --operator contains --value ALS
  citegraph enrich --goal article --label gene --attribute name --operator = --value 6647 \\
      --article-attribute age_in_days --article-operator '<' --article-value 3650 --normalize-by-age

See also: citegraph list goal")]
    Enrich(EnrichArgs),
    /// Check upstream services, the graph store and the data directory
    Health {
        /// Check remote services only
        #[arg(long)]
        apis_only: bool,
    },
    /// Command, goal-class and configuration reference
    List {
        /// goal, operators, config, or a goal class name
        topic: Option<String>,
    },
    /// Show version
    Version,
}

/// Parallel filter lists are given by repeating each flag, one occurrence per condition.
#[derive(Args, Debug, Default)]
pub struct EnrichArgs {
    /// Entity class to rank
    #[arg(long)]
    pub goal: String,
    #[arg(long)]
    pub goal_attribute: Option<String>,
    #[arg(long)]
    pub goal_operator: Option<String>,
    #[arg(long)]
    pub goal_value: Option<String>,

    /// First subset: entity class of each condition
    #[arg(long = "label")]
    pub labels: Vec<String>,
    #[arg(long = "attribute")]
    pub attributes: Vec<String>,
    #[arg(long = "operator")]
    pub operators: Vec<String>,
    #[arg(long = "value")]
    pub values: Vec<String>,

    /// Second subset; when given, scores are the ratio of subset 2 to subset 1
    #[arg(long = "label-2")]
    pub labels_2: Vec<String>,
    #[arg(long = "attribute-2")]
    pub attributes_2: Vec<String>,
    #[arg(long = "operator-2")]
    pub operators_2: Vec<String>,
    #[arg(long = "value-2")]
    pub values_2: Vec<String>,

    /// Conditions on the articles mentions are counted in
    #[arg(long = "article-attribute")]
    pub article_attributes: Vec<String>,
    #[arg(long = "article-operator")]
    pub article_operators: Vec<String>,
    #[arg(long = "article-value")]
    pub article_values: Vec<String>,

    /// Entities mentioned this many times or fewer are left out (default: 10)
    #[arg(long)]
    pub min_mentions: Option<u64>,
    /// Sort expression, e.g. "score DESC, symbol"
    #[arg(long)]
    pub sort: Option<String>,
    /// Divide article scores by age in days
    #[arg(long)]
    pub normalize_by_age: bool,
}

impl EnrichArgs {
    fn into_params(self) -> EnrichmentParams {
        let subset_2 = FilterLists {
            labels: self.labels_2,
            attributes: self.attributes_2,
            operators: self.operators_2,
            values: self.values_2,
        };
        let has_subset_2 = !(subset_2.labels.is_empty()
            && subset_2.attributes.is_empty()
            && subset_2.operators.is_empty()
            && subset_2.values.is_empty());
        EnrichmentParams {
            goal: Some(self.goal),
            goal_attribute: self.goal_attribute,
            goal_operator: self.goal_operator,
            goal_value: self.goal_value,
            subset_1: FilterLists {
                labels: self.labels,
                attributes: self.attributes,
                operators: self.operators,
                values: self.values,
            },
            subset_2: has_subset_2.then_some(subset_2),
            article_attributes: self.article_attributes,
            article_operators: self.article_operators,
            article_values: self.article_values,
            min_mentions: self.min_mentions,
            sort: self.sort,
            normalize_by_age: self.normalize_by_age,
        }
    }
}

fn version_output() -> String {
    let cargo_version = env!("CARGO_PKG_VERSION");
    let git_tag = option_env!("CITEGRAPH_BUILD_GIT_TAG");
    let git = option_env!("CITEGRAPH_BUILD_GIT_SHA").unwrap_or("unknown");
    let build = option_env!("CITEGRAPH_BUILD_DATE").unwrap_or("unknown");
    let version = git_tag
        .and_then(|t| t.strip_prefix('v'))
        .filter(|t| !t.contains('-'))
        .unwrap_or(cargo_version);
    format!("citegraph {version} (git {git}, build {build})")
}

fn parse_pmids(raw: &str) -> Result<Vec<String>, CitegraphError> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split([',', ' ', '\n']).map(str::trim).filter(|v| !v.is_empty()) {
        if !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(CitegraphError::InvalidArgument(format!(
                "'{id}' is not a PMID. Example: citegraph metadata 22663011,31452104"
            )));
        }
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    if ids.is_empty() {
        return Err(CitegraphError::InvalidArgument(
            "At least one PMID is required".into(),
        ));
    }
    Ok(ids)
}

fn ensure_parent(path: &Path) -> Result<(), CitegraphError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn graph_store(config: &Config) -> Result<Neo4jHttpStore, CitegraphError> {
    Neo4jHttpStore::new(&config.graph)?.ok_or_else(|| {
        CitegraphError::Config(
            "No graph store configured. Set [graph] url or CITEGRAPH_GRAPH_URL.".into(),
        )
    })
}

#[derive(Serialize)]
struct MetadataResponse<'a> {
    count: usize,
    records: &'a [ArticleRecord],
    dropped: &'a [String],
}

#[derive(Serialize)]
struct AssembleResponse<'a> {
    pmid: &'a str,
    count: usize,
    rows: &'a [EdgeRow],
    #[serde(skip_serializing_if = "Option::is_none")]
    edge_file: Option<&'a Path>,
}

/// Executes one parsed CLI command and returns rendered output.
///
/// # Errors
///
/// Returns an error if configuration or argument validation fails, an upstream service
/// or the graph store fails, or the crawl is cancelled.
pub async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<String> {
    let json = cli.json;
    let config_path = cli.config;
    let load_config = || Config::load(config_path.as_deref());

    match cli.command {
        Commands::Resolve { query, retmax, out } => {
            let config = load_config()?;
            let upstream = Upstream::from_config(&config, cancel)?;
            let mut params = pipeline::resolve_params(&config)?;
            if let Some(query) = query {
                params.term = query.trim().to_string();
            }
            if let Some(retmax) = retmax {
                params.retmax = retmax;
            }
            let outcome = resolve::resolve(&upstream.eutils, &params).await?;
            let path = out.unwrap_or_else(|| {
                config
                    .run
                    .data_dir(&config.general.project_name)
                    .join(ID_LIST_FILE)
            });
            ensure_parent(&path)?;
            resolve::write_id_list(&path, &outcome.ids)?;
            debug!(path = %path.display(), ids = outcome.ids.len(), "identifier list written");
            if json {
                Ok(render::json::to_pretty(&outcome)?)
            } else {
                Ok(render::markdown::resolve_markdown(&params.term, &outcome, Some(&path))?)
            }
        }
        Commands::Metadata {
            ids,
            classes,
            no_pubtator,
            full_text,
        } => {
            let ids = parse_pmids(&ids)?;
            let config = load_config()?;
            let mut options = pipeline::metadata_options(&config)?;
            if let Some(classes) = classes {
                options.classes = EntityClass::parse_list(&classes)?;
            }
            if no_pubtator {
                options.run_pubtator = false;
            }
            if full_text {
                options.fetch_full_text = true;
            }
            let classes = options.classes.clone();
            let fetcher = Upstream::from_config(&config, cancel)?.metadata_fetcher(options);
            let table = fetcher.fetch_batch(&ids).await?;
            if json {
                Ok(render::json::to_pretty(&MetadataResponse {
                    count: table.len(),
                    records: table.records(),
                    dropped: &table.dropped,
                })?)
            } else {
                Ok(render::markdown::articles_markdown(
                    table.records(),
                    &classes,
                    &table.dropped,
                )?)
            }
        }
        Commands::Assemble {
            pmid,
            out,
            test_mode,
        } => {
            let pmid = match parse_pmids(&pmid)?.as_slice() {
                [one] => one.clone(),
                _ => {
                    return Err(CitegraphError::InvalidArgument(
                        "assemble takes exactly one PMID".into(),
                    )
                    .into());
                }
            };
            let config = load_config()?;
            let mut options = pipeline::assemble_options(&config)?;
            options.test_mode |= test_mode;
            let classes = options.classes.clone();
            let fetcher = Upstream::from_config(&config, cancel)?
                .metadata_fetcher(pipeline::metadata_options(&config)?);
            let focal = fetcher
                .fetch_batch(std::slice::from_ref(&pmid))
                .await?
                .get(&pmid)
                .cloned()
                .ok_or_else(|| CitegraphError::Api {
                    api: "eutils".into(),
                    message: format!("No summary returned for PMID {pmid}"),
                })?;
            let mut assembler = Assembler::new(&fetcher, options);
            let rows = assembler.assemble(&focal).await?;
            let edge_file = match out {
                Some(path) => {
                    ensure_parent(&path)?;
                    let mut writer = EdgeFileWriter::create(&path, &classes, 0)?;
                    for row in &rows {
                        writer.append(row)?;
                    }
                    Some(writer.finish()?)
                }
                None => None,
            };
            if json {
                Ok(render::json::to_pretty(&AssembleResponse {
                    pmid: &pmid,
                    count: rows.len(),
                    rows: &rows,
                    edge_file: edge_file.as_deref(),
                })?)
            } else {
                Ok(render::markdown::edges_markdown(
                    &pmid,
                    &rows,
                    edge_file.as_deref(),
                )?)
            }
        }
        Commands::Crawl { no_load } => {
            let config = load_config()?;
            let store = if no_load {
                None
            } else {
                Neo4jHttpStore::new(&config.graph)?
            };
            match &store {
                Some(store) => info!(graph = store.base(), "crawl will load into the graph store"),
                None => info!("crawl writes edge files only"),
            }
            let summary = pipeline::crawl(
                &config,
                store.as_ref().map(|s| s as &dyn GraphStore),
                cancel,
            )
            .await?;
            if json {
                Ok(render::json::to_pretty(&summary)?)
            } else {
                Ok(render::markdown::crawl_markdown(&summary)?)
            }
        }
        Commands::Curate { file } => {
            let config = load_config()?;
            let path = file.or_else(|| config.run.curation_file.clone()).ok_or_else(|| {
                CitegraphError::InvalidArgument(
                    "No curation file given. Pass FILE or set [run] curation_file.".into(),
                )
            })?;
            let store = graph_store(&config)?;
            let summary = curation::apply_file(&store, &path).await?;
            if json {
                Ok(render::json::to_pretty(&summary)?)
            } else {
                Ok(format!(
                    "# Curation\n\nApplied {} steps from `{}` ({} skipped, {} nodes touched).\n",
                    summary.applied,
                    path.display(),
                    summary.skipped,
                    summary.touched
                ))
            }
        }
        Commands::Enrich(args) => {
            let request = args.into_params().validate()?;
            let config = load_config()?;
            let store = graph_store(&config)?;
            let table = run_enrichment(&store, &request).await?;
            if json {
                Ok(render::json::to_pretty(&table)?)
            } else {
                Ok(render::markdown::enrichment_markdown(&table)?)
            }
        }
        Commands::Health { apis_only } => {
            let config = load_config()?;
            let report = health::check(&config, apis_only).await?;
            if json {
                Ok(render::json::to_pretty(&report)?)
            } else {
                Ok(report.to_markdown())
            }
        }
        Commands::List { topic } => Ok(list::render(topic.as_deref())?),
        Commands::Version => Ok(version_output()),
    }
}

/// Parse `args` (including the program name) and run the command.
///
/// # Errors
///
/// Returns an error when CLI args cannot be parsed or when command execution fails.
pub async fn execute(mut args: Vec<String>) -> anyhow::Result<String> {
    if args.is_empty() {
        args.push("citegraph".to_string());
    }
    let cli = Cli::try_parse_from(args)?;
    run(cli, CancellationToken::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn enrich_flags_build_parallel_lists() {
        let cli = Cli::try_parse_from(args(&[
            "citegraph",
            "enrich",
            "--goal",
            "gene",
            "--label",
            "disease",
            "--attribute",
            "label",
            "--operator",
            "starts with",
            "--value",
            "ALS, familial",
            "--min-mentions",
            "3",
        ]))
        .unwrap();
        let Commands::Enrich(enrich) = cli.command else {
            panic!("expected enrich");
        };
        let params = enrich.into_params();
        assert_eq!(params.goal.as_deref(), Some("gene"));
        assert_eq!(params.subset_1.operators, vec!["starts with"]);
        assert_eq!(params.subset_1.values, vec!["ALS, familial"]);
        assert!(params.subset_2.is_none());
        assert_eq!(params.min_mentions, Some(3));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn second_subset_is_present_when_any_flag_is_given() {
        let cli = Cli::try_parse_from(args(&[
            "citegraph", "enrich", "--goal", "gene", "--label-2", "disease",
        ]))
        .unwrap();
        let Commands::Enrich(enrich) = cli.command else {
            panic!("expected enrich");
        };
        assert!(enrich.into_params().subset_2.is_some());
    }

    #[test]
    fn pmids_are_validated_and_deduplicated() {
        assert_eq!(parse_pmids("1, 2,1").unwrap(), vec!["1", "2"]);
        assert!(parse_pmids("PMC123").is_err());
        assert!(parse_pmids(" , ").is_err());
    }

    #[test]
    fn version_names_the_binary() {
        assert!(version_output().starts_with("citegraph "));
    }

    #[tokio::test]
    async fn list_and_version_need_no_config() {
        let out = execute(args(&["citegraph", "list", "operators"])).await.unwrap();
        assert!(out.contains("# Filter operators"));
        let out = execute(args(&["citegraph", "version"])).await.unwrap();
        assert!(out.contains("(git "));
    }

    #[tokio::test]
    async fn enrich_rejects_mismatched_lists_before_touching_the_graph() {
        let err = execute(args(&[
            "citegraph",
            "enrich",
            "--goal",
            "gene",
            "--label",
            "disease",
            "--attribute",
            "label",
        ]))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("same length"));
    }

    #[tokio::test]
    async fn enrich_without_graph_store_is_a_config_error() {
        if std::env::var("CITEGRAPH_GRAPH_URL").is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("absent.toml");
        let err = execute(args(&[
            "citegraph",
            "--config",
            config.to_str().unwrap(),
            "enrich",
            "--goal",
            "gene",
        ]))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("No graph store configured"));
    }

    #[tokio::test]
    async fn curate_needs_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("absent.toml");
        let err = execute(args(&["citegraph", "--config", config.to_str().unwrap(), "curate"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No curation file given"));
    }

    #[tokio::test]
    async fn resolve_writes_identifier_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"count": "2", "idlist": ["11", "12"]}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("citegraph.toml");
        std::fs::write(
            &config_path,
            format!(
                "[search]\nquery = \"kidney\"\n\n[run]\nrequest_delay_ms = 0\nmin_host_interval_ms = 0\ndata_dir = \"{}\"\n\n[services]\neutils_base = \"{}\"\n",
                dir.path().display(),
                server.uri()
            ),
        )
        .unwrap();

        let out = execute(args(&[
            "citegraph",
            "--json",
            "--config",
            config_path.to_str().unwrap(),
            "resolve",
        ]))
        .await
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["ids"], json!(["11", "12"]));
        assert_eq!(value["complete"], json!(true));
        let written = resolve::read_id_list(&dir.path().join(ID_LIST_FILE)).unwrap();
        assert_eq!(written, vec!["11", "12"]);
    }
}
