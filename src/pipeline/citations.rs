//! Citation edge rows: one row per relevant (citing, cited) pair, written to the
//! pipe-delimited file the bulk loader consumes.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use csv::StringRecord;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entities::EntityClass;
use crate::entities::article::{ArticleRecord, NULL_SENTINEL};
use crate::error::CitegraphError;
use crate::pipeline::metadata::CitationSource;
use crate::sources::eutils::LinkDirection;

pub const FIELD_DELIMITER: u8 = b'|';
pub const ROW_ID_COLUMN: &str = "reference_id";
pub const TEST_MODE_LINK_CAP: usize = 3;

/// Flattened metadata of one end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEndpoint {
    pub pmid: String,
    pub title: String,
    pub pmc_id: String,
    pub epubdate: String,
    pub authors: String,
    pub journal: String,
    pub abstract_text: String,
    pub keywords: String,
    pub entities: Vec<(EntityClass, String)>,
}

impl EdgeEndpoint {
    pub fn from_record(record: &ArticleRecord, keywords: &[String], classes: &[EntityClass]) -> Self {
        Self {
            pmid: record.pmid.clone(),
            title: record.title.clone(),
            pmc_id: record
                .pmc_id
                .clone()
                .unwrap_or_else(|| NULL_SENTINEL.to_string()),
            epubdate: record.epubdate.clone(),
            authors: record.authors_field(),
            journal: record.journal.clone(),
            abstract_text: record.abstract_text.clone(),
            keywords: record.keyword_label(keywords),
            entities: classes
                .iter()
                .map(|class| (*class, record.annotations.column(*class)))
                .collect(),
        }
    }

    /// Every field set to the sentinel.
    pub fn null(classes: &[EntityClass]) -> Self {
        let null = || NULL_SENTINEL.to_string();
        Self {
            pmid: null(),
            title: null(),
            pmc_id: null(),
            epubdate: null(),
            authors: null(),
            journal: null(),
            abstract_text: null(),
            keywords: null(),
            entities: classes.iter().map(|class| (*class, null())).collect(),
        }
    }

    fn push_cells<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a str)>) {
        out.push((prefix.to_string(), self.pmid.as_str()));
        out.push((format!("{prefix}_title"), self.title.as_str()));
        out.push((format!("{prefix}_pmc_id"), self.pmc_id.as_str()));
        out.push((format!("{prefix}_epubdate"), self.epubdate.as_str()));
        out.push((format!("{prefix}_authors"), self.authors.as_str()));
        out.push((format!("{prefix}_journal"), self.journal.as_str()));
        out.push((format!("{prefix}_abstract"), self.abstract_text.as_str()));
        out.push((format!("{prefix}_keywords"), self.keywords.as_str()));
        for (class, value) in &self.entities {
            out.push((format!("{prefix}_{}", class.as_str()), value.as_str()));
        }
    }
}

/// `article` cites `reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeRow {
    pub article: EdgeEndpoint,
    pub reference: EdgeEndpoint,
}

impl EdgeRow {
    /// Column names paired with values, in file order. Both the header and every row
    /// are produced from this list.
    fn cells(&self, row_id: &str) -> Vec<(String, String)> {
        let mut cells: Vec<(String, &str)> = vec![(ROW_ID_COLUMN.to_string(), row_id)];
        self.article.push_cells("article", &mut cells);
        self.reference.push_cells("reference", &mut cells);
        cells
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect()
    }

    pub fn key(&self) -> (String, String) {
        (self.article.pmid.clone(), self.reference.pmid.clone())
    }
}

pub fn sanitize_field(value: &str) -> String {
    let cleaned = value
        .replace(char::from(FIELD_DELIMITER), ";")
        .replace('"', "")
        .replace(['\r', '\n', '\t'], " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        NULL_SENTINEL.to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn header_columns(classes: &[EntityClass]) -> Vec<String> {
    let template = EdgeRow {
        article: EdgeEndpoint::null(classes),
        reference: EdgeEndpoint::null(classes),
    };
    template
        .cells("")
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

/// Build the record of one row, refusing any row whose field count differs from the
/// header's.
pub fn edge_record(row: &EdgeRow, row_id: u64, expected: usize) -> Result<StringRecord, CitegraphError> {
    let record: StringRecord = row
        .cells(&row_id.to_string())
        .into_iter()
        .map(|(_, value)| sanitize_field(&value))
        .collect();
    if record.len() != expected {
        return Err(CitegraphError::RowShape {
            expected,
            actual: record.len(),
            row: record.iter().collect::<Vec<_>>().join("|"),
        });
    }
    Ok(record)
}

fn edge_writer(file: File) -> csv::Writer<File> {
    csv::WriterBuilder::new()
        .delimiter(FIELD_DELIMITER)
        .quote_style(csv::QuoteStyle::Never)
        .has_headers(false)
        .from_writer(file)
}

#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    pub classes: Vec<EntityClass>,
    pub filter_terms: Vec<String>,
    pub keywords: Vec<String>,
    pub test_mode: bool,
}

/// Build the rows of one focal article from already-fetched candidates.
///
/// Cited-by rows put the citing candidate first; reference rows put the focal article
/// first. Without any relevant candidate the focal article still gets one row whose
/// counterpart is all sentinel values.
pub fn assemble_rows(
    focal: &ArticleRecord,
    cited_by: &[ArticleRecord],
    references: &[ArticleRecord],
    options: &AssembleOptions,
) -> Vec<EdgeRow> {
    let classes = &options.classes;
    let focal_side = EdgeEndpoint::from_record(focal, &options.keywords, classes);
    let mut rows = Vec::new();

    for candidate in cited_by {
        if candidate.pmid == focal.pmid || !candidate.is_relevant(&options.filter_terms) {
            continue;
        }
        rows.push(EdgeRow {
            article: EdgeEndpoint::from_record(candidate, &options.keywords, classes),
            reference: focal_side.clone(),
        });
    }
    for candidate in references {
        if candidate.pmid == focal.pmid || !candidate.is_relevant(&options.filter_terms) {
            continue;
        }
        rows.push(EdgeRow {
            article: focal_side.clone(),
            reference: EdgeEndpoint::from_record(candidate, &options.keywords, classes),
        });
    }

    if rows.is_empty() {
        rows.push(EdgeRow {
            article: focal_side,
            reference: EdgeEndpoint::null(classes),
        });
    }
    rows
}

/// Expands focal articles through a [`CitationSource`], caching candidate metadata for
/// the current batch.
pub struct Assembler<'a> {
    source: &'a dyn CitationSource,
    options: AssembleOptions,
    cache: HashMap<String, ArticleRecord>,
}

impl<'a> Assembler<'a> {
    pub fn new(source: &'a dyn CitationSource, options: AssembleOptions) -> Self {
        Self {
            source,
            options,
            cache: HashMap::new(),
        }
    }

    pub fn options(&self) -> &AssembleOptions {
        &self.options
    }

    /// Seed the cache with records fetched elsewhere, e.g. the focal batch.
    pub fn remember<I: IntoIterator<Item = ArticleRecord>>(&mut self, records: I) {
        for record in records {
            self.cache.insert(record.pmid.clone(), record);
        }
    }

    /// Drop every cached record once a batch is written.
    pub fn end_batch(&mut self) {
        debug!(cached = self.cache.len(), "candidate cache cleared");
        self.cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn linked(&self, pmid: &str, direction: LinkDirection) -> Result<Vec<String>, CitegraphError> {
        let mut ids = match self.source.links(pmid, direction).await {
            Ok(ids) => ids,
            Err(CitegraphError::Cancelled) => return Err(CitegraphError::Cancelled),
            Err(err) => {
                warn!(pmid, direction = direction.linkname(), "no links: {err}");
                Vec::new()
            }
        };
        if self.options.test_mode {
            ids.truncate(TEST_MODE_LINK_CAP);
        }
        Ok(ids)
    }

    async fn records_for(&mut self, ids: &[String]) -> Result<Vec<ArticleRecord>, CitegraphError> {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !self.cache.contains_key(*id))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            let table = self.source.metadata(&missing).await?;
            if !table.dropped.is_empty() {
                warn!(count = table.dropped.len(), "candidates without metadata are skipped");
            }
            self.remember(table.into_records());
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.cache.get(id).cloned())
            .collect())
    }

    pub async fn assemble(&mut self, focal: &ArticleRecord) -> Result<Vec<EdgeRow>, CitegraphError> {
        let (cited_by_ids, reference_ids) = futures::future::try_join(
            self.linked(&focal.pmid, LinkDirection::CitedBy),
            self.linked(&focal.pmid, LinkDirection::References),
        )
        .await?;
        let cited_by = self.records_for(&cited_by_ids).await?;
        let references = self.records_for(&reference_ids).await?;
        let rows = assemble_rows(focal, &cited_by, &references, &self.options);
        debug!(
            pmid = %focal.pmid,
            cited_by = cited_by.len(),
            references = references.len(),
            rows = rows.len(),
            "focal article assembled"
        );
        Ok(rows)
    }
}

/// Append-only writer for one edge file. Rows repeating an (article, reference) pair
/// are skipped; row identifiers keep counting from `first_row_id`.
pub struct EdgeFileWriter {
    out: csv::Writer<File>,
    path: PathBuf,
    columns: usize,
    next_row_id: u64,
    seen: HashSet<(String, String)>,
    written: usize,
}

impl EdgeFileWriter {
    pub fn create(path: &Path, classes: &[EntityClass], first_row_id: u64) -> Result<Self, CitegraphError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = edge_writer(File::create(path)?);
        let header = header_columns(classes);
        out.write_record(&header)?;
        Ok(Self {
            out,
            path: path.to_path_buf(),
            columns: header.len(),
            next_row_id: first_row_id,
            seen: HashSet::new(),
            written: 0,
        })
    }

    /// Returns `false` for a duplicate pair.
    pub fn append(&mut self, row: &EdgeRow) -> Result<bool, CitegraphError> {
        let key = row.key();
        if self.seen.contains(&key) {
            return Ok(false);
        }
        let record = edge_record(row, self.next_row_id, self.columns)?;
        self.out.write_record(&record)?;
        self.seen.insert(key);
        self.next_row_id += 1;
        self.written += 1;
        Ok(true)
    }

    pub fn next_row_id(&self) -> u64 {
        self.next_row_id
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<PathBuf, CitegraphError> {
        self.out.flush()?;
        info!(path = %self.path.display(), rows = self.written, "edge file written");
        Ok(self.path)
    }
}
