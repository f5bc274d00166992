use std::borrow::Cow;
use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::CitegraphError;
use crate::sources::Fetcher;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const EUTILS_API: &str = "eutils";
const EUTILS_BASE_ENV: &str = "CITEGRAPH_EUTILS_BASE";

/// Client for the NCBI E-utilities search, summary and link endpoints.
#[derive(Clone)]
pub struct EutilsClient {
    fetcher: Fetcher,
    base: Cow<'static, str>,
    tool: String,
    email: String,
}

/// Inclusive publication-date window, `YYYY/MM/DD` on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub min: String,
    pub max: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub count: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Articles citing the focal article.
    CitedBy,
    /// Articles the focal article cites.
    References,
}

impl LinkDirection {
    pub fn linkname(self) -> &'static str {
        match self {
            Self::CitedBy => "pubmed_pubmed_citedin",
            Self::References => "pubmed_pubmed_refs",
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsearchEnvelope {
    esearchresult: Option<EsearchResult>,
}

#[derive(Debug, Deserialize)]
struct EsearchResult {
    count: Option<String>,
    #[serde(default)]
    idlist: Option<Vec<String>>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EsummaryEnvelope {
    result: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ElinkEnvelope {
    linksets: Option<Vec<LinkSet>>,
}

#[derive(Debug, Deserialize)]
struct LinkSet {
    #[serde(default)]
    linksetdbs: Vec<LinkSetDb>,
}

#[derive(Debug, Deserialize)]
struct LinkSetDb {
    #[serde(default)]
    links: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryAuthor {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryArticleId {
    #[serde(default)]
    pub idtype: String,
    #[serde(default)]
    pub value: String,
}

/// One `result[<pmid>]` entry of an esummary response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryRecord {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sortpubdate: String,
    #[serde(default)]
    pub epubdate: String,
    #[serde(default)]
    pub pubdate: String,
    #[serde(default)]
    pub authors: Vec<SummaryAuthor>,
    #[serde(default)]
    pub fulljournalname: String,
    #[serde(default)]
    pub articleids: Vec<SummaryArticleId>,
}

impl SummaryRecord {
    pub fn pmc_id(&self) -> Option<String> {
        self.articleids
            .iter()
            .find(|id| id.idtype.eq_ignore_ascii_case("pmc"))
            .map(|id| id.value.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn author_names(&self) -> Vec<String> {
        self.authors
            .iter()
            .map(|a| a.name.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn link_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|v| !v.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EutilsClient {
    /// `base` comes from configuration; `CITEGRAPH_EUTILS_BASE` overrides it.
    pub fn new(fetcher: Fetcher, base: Option<&str>, tool: &str, email: &str) -> Self {
        Self {
            fetcher,
            base: crate::sources::configured_base(base, EUTILS_BASE, EUTILS_BASE_ENV),
            tool: tool.trim().to_string(),
            email: email.trim().to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            fetcher: Fetcher::for_test(),
            base: Cow::Owned(base),
            tool: "citegraph".into(),
            email: "test@example.org".into(),
        }
    }

    pub fn base(&self) -> &str {
        self.base.as_ref()
    }

    fn endpoint(&self, path: &str) -> String {
        crate::sources::join_endpoint(self.base.as_ref(), path)
    }

    fn identity(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if !self.tool.is_empty() {
            params.push(("tool", self.tool.clone()));
        }
        if !self.email.is_empty() {
            params.push(("email", self.email.clone()));
        }
        params
    }

    /// One esearch page. A missing `esearchresult` is reported as a malformed response.
    pub async fn esearch(
        &self,
        term: &str,
        retmax: usize,
        range: Option<&DateRange>,
    ) -> Result<SearchPage, CitegraphError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(CitegraphError::InvalidArgument(
                "Search query is required".into(),
            ));
        }

        let url = self.endpoint("esearch.fcgi");
        let mut params: Vec<(&str, String)> = vec![
            ("db", "pubmed".into()),
            ("retmode", "json".into()),
            ("retmax", retmax.to_string()),
            ("term", term.to_string()),
        ];
        if let Some(range) = range {
            params.push(("datetype", "pdat".into()));
            params.push(("mindate", range.min.clone()));
            params.push(("maxdate", range.max.clone()));
        }
        params.extend(self.identity());

        let envelope: EsearchEnvelope = self
            .fetcher
            .get_json(EUTILS_API, || self.fetcher.client().get(&url).query(&params))
            .await?;
        let Some(result) = envelope.esearchresult else {
            return Err(CitegraphError::MalformedResponse {
                api: EUTILS_API.to_string(),
                message: "esearch response has no esearchresult".into(),
            });
        };
        if let Some(error) = result.error.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            return Err(CitegraphError::MalformedResponse {
                api: EUTILS_API.to_string(),
                message: format!("esearch error: {error}"),
            });
        }
        let count = result
            .count
            .as_deref()
            .and_then(|c| c.trim().parse::<usize>().ok())
            .ok_or_else(|| CitegraphError::MalformedResponse {
                api: EUTILS_API.to_string(),
                message: "esearch response has no numeric count".into(),
            })?;
        Ok(SearchPage {
            count,
            ids: result.idlist.unwrap_or_default(),
        })
    }

    /// Summary records keyed by PMID. Identifiers absent from the response are absent here.
    pub async fn esummary(
        &self,
        pmids: &[String],
    ) -> Result<HashMap<String, SummaryRecord>, CitegraphError> {
        if pmids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.endpoint("esummary.fcgi");
        let mut params: Vec<(&str, String)> = vec![
            ("db", "pubmed".into()),
            ("retmode", "json".into()),
            ("id", pmids.join(",")),
        ];
        params.extend(self.identity());

        let envelope: EsummaryEnvelope = self
            .fetcher
            .get_json(EUTILS_API, || self.fetcher.client().get(&url).query(&params))
            .await?;
        let Some(result) = envelope.result else {
            return Err(CitegraphError::MalformedResponse {
                api: EUTILS_API.to_string(),
                message: "esummary response has no result".into(),
            });
        };

        let mut out = HashMap::new();
        for pmid in pmids {
            let Some(value) = result.get(pmid) else {
                continue;
            };
            if value.get("error").is_some() {
                continue;
            }
            match serde_json::from_value::<SummaryRecord>(value.clone()) {
                Ok(mut record) => {
                    if record.uid.is_empty() {
                        record.uid = pmid.clone();
                    }
                    out.insert(pmid.clone(), record);
                }
                Err(err) => {
                    tracing::warn!(pmid = %pmid, "unreadable esummary record: {err}");
                }
            }
        }
        Ok(out)
    }

    /// Linked PMIDs in one direction; an article without links yields an empty list.
    pub async fn elink(
        &self,
        pmid: &str,
        direction: LinkDirection,
    ) -> Result<Vec<String>, CitegraphError> {
        let pmid = pmid.trim();
        if pmid.is_empty() {
            return Err(CitegraphError::InvalidArgument("PMID is required".into()));
        }
        let url = self.endpoint("elink.fcgi");
        let mut params: Vec<(&str, String)> = vec![
            ("dbfrom", "pubmed".into()),
            ("linkname", direction.linkname().into()),
            ("id", pmid.to_string()),
            ("retmode", "json".into()),
        ];
        params.extend(self.identity());

        let envelope: ElinkEnvelope = self
            .fetcher
            .get_json(EUTILS_API, || self.fetcher.client().get(&url).query(&params))
            .await?;
        let Some(linksets) = envelope.linksets else {
            return Err(CitegraphError::MalformedResponse {
                api: EUTILS_API.to_string(),
                message: format!("elink response for {pmid} has no linksets"),
            });
        };
        Ok(linksets
            .first()
            .and_then(|set| set.linksetdbs.first())
            .map(|db| db.links.iter().filter_map(link_id).collect())
            .unwrap_or_default())
    }
}
