//! TOML configuration. A missing file means defaults; a malformed one is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entities::EntityClass;
use crate::error::CitegraphError;
use crate::sources::{FetchSettings, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "citegraph.toml";
const GRAPH_URL_ENV: &str = "CITEGRAPH_GRAPH_URL";
const GRAPH_PASSWORD_ENV: &str = "CITEGRAPH_GRAPH_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub search: SearchConfig,
    pub filter: FilterConfig,
    pub run: RunConfig,
    pub services: ServicesConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub project_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: "citegraph".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub query: String,
    pub retmax: usize,
    pub page_ceiling: usize,
    pub min_date: String,
    pub max_date: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            retmax: 9999,
            page_ceiling: 9999,
            min_date: "1900/01/01".into(),
            max_date: None,
        }
    }
}

impl SearchConfig {
    /// Upper bound of the search window; defaults to 31 December of the current year.
    pub fn max_date_or_default(&self) -> String {
        self.max_date
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/12/31", crate::utils::date::today_utc().year()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter_terms: Vec<String>,
    pub additional_keywords: Vec<String>,
    pub bioconcepts: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            filter_terms: Vec::new(),
            additional_keywords: Vec::new(),
            bioconcepts: "gene,disease,chemical,species,mutation,cellline".into(),
        }
    }
}

impl FilterConfig {
    pub fn entity_classes(&self) -> Result<Vec<EntityClass>, CitegraphError> {
        let classes = EntityClass::parse_list(&self.bioconcepts)
            .map_err(|err| CitegraphError::Config(format!("[filter] bioconcepts: {err}")))?;
        if classes.is_empty() {
            return Err(CitegraphError::Config(
                "[filter] bioconcepts must name at least one entity class".into(),
            ));
        }
        Ok(classes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub batch_size: usize,
    pub test_mode: bool,
    pub run_pubtator: bool,
    pub fetch_full_text: bool,
    pub refresh_old_articles: bool,
    pub max_integration_age_secs: u64,
    pub max_count_integration_batch: usize,
    pub request_delay_ms: u64,
    pub min_host_interval_ms: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_halving_iterations: usize,
    pub data_dir: Option<PathBuf>,
    /// Empty the graph store and the ledger before crawling.
    pub delete_graph: bool,
    /// JSON file of merge/rename/query steps applied after post-processing.
    pub curation_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            test_mode: false,
            run_pubtator: true,
            fetch_full_text: true,
            refresh_old_articles: false,
            max_integration_age_secs: 60 * 60 * 24 * 180,
            max_count_integration_batch: 1000,
            request_delay_ms: 350,
            min_host_interval_ms: crate::sources::rate_limit::DEFAULT_MIN_INTERVAL.as_millis() as u64,
            timeout_secs: 20,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_halving_iterations: 10_000,
            data_dir: None,
            delete_graph: false,
            curation_file: None,
        }
    }
}

impl RunConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            delay: Duration::from_millis(self.request_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            min_host_interval: Duration::from_millis(self.min_host_interval_ms),
            retry: self.retry_policy(),
        }
    }

    /// Working directory for identifier lists, edge files and the ledger.
    pub fn data_dir(&self, project_name: &str) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("citegraph")
                .join(project_name)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub eutils_base: Option<String>,
    pub pubtator_base: Option<String>,
    pub tool: String,
    pub email: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            eutils_base: None,
            pubtator_base: None,
            tool: "citegraph".into(),
            email: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub url: Option<String>,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    /// URL prefix under which the graph server sees `data_dir` for `LOAD CSV`.
    pub import_file_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: None,
            database: "neo4j".into(),
            user: "neo4j".into(),
            password: None,
            import_file_url: None,
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl GraphConfig {
    pub fn resolved_url(&self) -> Option<String> {
        std::env::var(GRAPH_URL_ENV)
            .ok()
            .or_else(|| self.url.clone())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn resolved_password(&self) -> Option<String> {
        std::env::var(GRAPH_PASSWORD_ENV)
            .ok()
            .or_else(|| self.password.clone())
            .filter(|v| !v.is_empty())
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, CitegraphError> {
        let config: Config =
            toml::from_str(text).map_err(|err| CitegraphError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or [`DEFAULT_CONFIG_FILE`] in the working directory when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, CitegraphError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text).map_err(|err| match err {
                CitegraphError::Config(msg) => {
                    CitegraphError::Config(format!("{}: {msg}", path.display()))
                }
                other => other,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn validate(&self) -> Result<(), CitegraphError> {
        if self.run.batch_size == 0 {
            return Err(CitegraphError::Config("[run] batch_size must be positive".into()));
        }
        if self.search.page_ceiling == 0 {
            return Err(CitegraphError::Config(
                "[search] page_ceiling must be positive".into(),
            ));
        }
        if crate::utils::date::parse_slash(&self.search.min_date).is_none() {
            return Err(CitegraphError::Config(format!(
                "[search] min_date '{}' is not YYYY/MM/DD",
                self.search.min_date
            )));
        }
        if let Some(max) = self.search.max_date.as_deref()
            && !max.trim().is_empty()
            && crate::utils::date::parse_slash(max).is_none()
        {
            return Err(CitegraphError::Config(format!(
                "[search] max_date '{max}' is not YYYY/MM/DD"
            )));
        }
        self.filter.entity_classes()?;
        Ok(())
    }
}
