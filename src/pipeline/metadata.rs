use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::entities::EntityClass;
use crate::entities::article::ArticleRecord;
use crate::error::CitegraphError;
use crate::sources::eutils::{EutilsClient, LinkDirection};
use crate::sources::pubtator::{PubTatorClient, PubtatorEntry};
use crate::transform;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Per-article metadata in input order.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    records: Vec<ArticleRecord>,
    index: HashMap<String, usize>,
    /// Identifiers whose batch could not be aligned or fetched.
    pub dropped: Vec<String>,
}

impl MetadataTable {
    pub fn push(&mut self, record: ArticleRecord) {
        if let Some(&idx) = self.index.get(&record.pmid) {
            self.records[idx] = record;
            return;
        }
        self.index.insert(record.pmid.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn get(&self, pmid: &str) -> Option<&ArticleRecord> {
        self.index.get(pmid).map(|&idx| &self.records[idx])
    }

    pub fn records(&self) -> &[ArticleRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ArticleRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn merge(&mut self, other: MetadataTable) {
        self.dropped.extend(other.dropped);
        for record in other.records {
            self.push(record);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub classes: Vec<EntityClass>,
    pub batch_size: usize,
    pub run_pubtator: bool,
    pub fetch_full_text: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            classes: EntityClass::ALL.to_vec(),
            batch_size: DEFAULT_BATCH_SIZE,
            run_pubtator: true,
            fetch_full_text: true,
        }
    }
}

/// Bibliographic metadata plus named-entity annotations for batches of PMIDs.
#[derive(Clone)]
pub struct MetadataFetcher {
    eutils: EutilsClient,
    pubtator: PubTatorClient,
    options: MetadataOptions,
}

impl MetadataFetcher {
    pub fn new(eutils: EutilsClient, pubtator: PubTatorClient, options: MetadataOptions) -> Self {
        Self {
            eutils,
            pubtator,
            options,
        }
    }

    pub fn options(&self) -> &MetadataOptions {
        &self.options
    }

    pub fn eutils(&self) -> &EutilsClient {
        &self.eutils
    }

    /// Fetch every identifier in batches. A batch that fails or cannot be aligned is
    /// dropped as a whole and its identifiers listed in [`MetadataTable::dropped`].
    pub async fn fetch_batch(&self, pmids: &[String]) -> Result<MetadataTable, CitegraphError> {
        let mut table = MetadataTable::default();
        let batch_size = self.options.batch_size.max(1);
        for (n, chunk) in pmids.chunks(batch_size).enumerate() {
            match self.fetch_chunk(chunk).await {
                Ok(records) => {
                    debug!(batch = n, size = records.len(), "metadata batch fetched");
                    for record in records {
                        table.push(record);
                    }
                }
                Err(CitegraphError::Cancelled) => return Err(CitegraphError::Cancelled),
                Err(err) => {
                    warn!(
                        batch = n,
                        first = chunk.first().map(String::as_str).unwrap_or_default(),
                        size = chunk.len(),
                        "dropping metadata batch: {err}"
                    );
                    table.dropped.extend(chunk.iter().cloned());
                }
            }
        }
        Ok(table)
    }

    async fn fetch_chunk(&self, chunk: &[String]) -> Result<Vec<ArticleRecord>, CitegraphError> {
        let classes = &self.options.classes;
        let entries: HashMap<String, PubtatorEntry> = if self.options.run_pubtator {
            self.pubtator
                .export_pubtator(chunk, classes)
                .await?
                .into_iter()
                .map(|entry| (entry.pmid.clone(), entry))
                .collect()
        } else {
            HashMap::new()
        };

        let summaries = self.eutils.esummary(chunk).await?;

        let mut records = Vec::with_capacity(chunk.len());
        for pmid in chunk {
            let Some(summary) = summaries.get(pmid) else {
                return Err(CitegraphError::MalformedResponse {
                    api: "eutils".into(),
                    message: format!("esummary has no record for {pmid}"),
                });
            };
            let entry = entries.get(pmid);
            if self.options.run_pubtator && entry.is_none() {
                debug!(pmid = %pmid, "no annotation entry, using placeholder annotations");
            }
            let mut record = transform::article::from_summary(pmid, summary, entry, classes);

            if self.options.fetch_full_text && record.pmc_id.is_some() {
                match self.pubtator.export_biocxml_full(pmid).await {
                    Ok(mentions) => {
                        if transform::article::apply_full_text(&mut record, &mentions, classes) {
                            debug!(pmid = %pmid, "annotations replaced from full text");
                        }
                    }
                    Err(CitegraphError::Cancelled) => return Err(CitegraphError::Cancelled),
                    Err(err) => {
                        warn!(pmid = %pmid, "full-text annotations unavailable: {err}");
                    }
                }
            }
            records.push(record);
        }

        if records.len() != chunk.len() {
            return Err(CitegraphError::MalformedResponse {
                api: "metadata".into(),
                message: format!(
                    "batch produced {} rows for {} identifiers",
                    records.len(),
                    chunk.len()
                ),
            });
        }
        Ok(records)
    }
}

/// Link graph and metadata lookups needed to expand a focal article.
#[async_trait]
pub trait CitationSource: Send + Sync {
    async fn links(
        &self,
        pmid: &str,
        direction: LinkDirection,
    ) -> Result<Vec<String>, CitegraphError>;

    async fn metadata(&self, pmids: &[String]) -> Result<MetadataTable, CitegraphError>;
}

#[async_trait]
impl CitationSource for MetadataFetcher {
    async fn links(
        &self,
        pmid: &str,
        direction: LinkDirection,
    ) -> Result<Vec<String>, CitegraphError> {
        let links = self.eutils.elink(pmid, direction).await?;
        info!(pmid, direction = direction.linkname(), count = links.len(), "links fetched");
        Ok(links)
    }

    async fn metadata(&self, pmids: &[String]) -> Result<MetadataTable, CitegraphError> {
        self.fetch_batch(pmids).await
    }
}
