use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::warn;

use crate::entities::EntityClass;
use crate::error::CitegraphError;
use crate::sources::Fetcher;

const PUBTATOR_BASE: &str = "https://www.ncbi.nlm.nih.gov/research/pubtator3-api";
const PUBTATOR_API: &str = "pubtator3";
const PUBTATOR_BASE_ENV: &str = "CITEGRAPH_PUBTATOR_BASE";

#[derive(Clone)]
pub struct PubTatorClient {
    fetcher: Fetcher,
    base: Cow<'static, str>,
}

/// One tagged mention: surface text, concept type, normalized identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub text: String,
    pub concept: String,
    pub identifier: String,
}

impl Mention {
    pub fn entity_class(&self) -> Option<EntityClass> {
        EntityClass::from_concept(&self.concept)
    }
}

/// One document of a PubTator tagged-text export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubtatorEntry {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub mentions: Vec<Mention>,
}

impl PubTatorClient {
    /// `base` comes from configuration; `CITEGRAPH_PUBTATOR_BASE` overrides it.
    pub fn new(fetcher: Fetcher, base: Option<&str>) -> Self {
        Self {
            fetcher,
            base: crate::sources::configured_base(base, PUBTATOR_BASE, PUBTATOR_BASE_ENV),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            fetcher: Fetcher::for_test(),
            base: Cow::Owned(base),
        }
    }

    pub fn base(&self) -> &str {
        self.base.as_ref()
    }

    fn endpoint(&self, path: &str) -> String {
        crate::sources::join_endpoint(self.base.as_ref(), path)
    }

    /// Title/abstract annotations for a batch, in tagged-text form.
    pub async fn export_pubtator(
        &self,
        pmids: &[String],
        classes: &[EntityClass],
    ) -> Result<Vec<PubtatorEntry>, CitegraphError> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint("publications/export/pubtator");
        let ids = pmids.join(",");
        let concepts = classes
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let text = self
            .fetcher
            .get_text(PUBTATOR_API, || {
                let req = self.fetcher.client().get(&url).query(&[("pmids", ids.as_str())]);
                if concepts.is_empty() {
                    req
                } else {
                    req.query(&[("concepts", concepts.as_str())])
                }
            })
            .await?;
        Ok(parse_pubtator_text(&text))
    }

    /// Full-text annotations of one article as BioC XML.
    pub async fn export_biocxml_full(&self, pmid: &str) -> Result<Vec<Mention>, CitegraphError> {
        let pmid = pmid.trim();
        if pmid.is_empty() {
            return Err(CitegraphError::InvalidArgument("PMID is required".into()));
        }
        let url = self.endpoint("publications/export/biocxml");
        let xml = self
            .fetcher
            .get_text(PUBTATOR_API, || {
                self.fetcher
                    .client()
                    .get(&url)
                    .query(&[("pmids", pmid), ("full", "true")])
            })
            .await?;
        parse_biocxml_annotations(&xml)
    }
}

/// Parse a tagged-text export. Documents are separated by blank lines; the first two
/// lines carry `pmid|t|title` and `pmid|a|abstract`, the rest are tab-separated mentions.
pub fn parse_pubtator_text(text: &str) -> Vec<PubtatorEntry> {
    let normalized = text.replace("\r\n", "\n");
    let mut out = Vec::new();
    for block in normalized.split("\n\n") {
        let block = block.trim_matches('\n');
        if block.trim().is_empty() {
            continue;
        }
        let mut entry = PubtatorEntry::default();
        for line in block.lines() {
            let mut pipe = line.splitn(3, '|');
            if let (Some(id), Some(kind @ ("t" | "a")), Some(value)) =
                (pipe.next(), pipe.next(), pipe.next())
            {
                if entry.pmid.is_empty() {
                    entry.pmid = id.trim().to_string();
                }
                if kind == "t" {
                    entry.title = value.trim().to_string();
                } else {
                    entry.abstract_text = value.trim().to_string();
                }
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 5 {
                warn!(line, "skipping unreadable PubTator line");
                continue;
            }
            if entry.pmid.is_empty() {
                entry.pmid = fields[0].trim().to_string();
            }
            entry.mentions.push(Mention {
                text: fields[3].trim().to_string(),
                concept: fields[4].trim().to_string(),
                identifier: fields.get(5).map(|v| v.trim()).unwrap_or_default().to_string(),
            });
        }
        if entry.pmid.is_empty() {
            continue;
        }
        out.push(entry);
    }
    out
}

fn attribute_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Collect `<annotation>` elements of a BioC XML document.
pub fn parse_biocxml_annotations(xml: &str) -> Result<Vec<Mention>, CitegraphError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut current: Option<Mention> = None;
    let mut infon_key: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"annotation" => {
                    current = Some(Mention {
                        text: String::new(),
                        concept: String::new(),
                        identifier: String::new(),
                    });
                }
                b"infon" if current.is_some() => infon_key = attribute_value(e, b"key"),
                b"text" if current.is_some() => in_text = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let Some(mention) = current.as_mut() else {
                    continue;
                };
                let value = e.unescape().unwrap_or_default();
                let value = value.trim();
                if in_text {
                    mention.text.push_str(value);
                } else if let Some(key) = infon_key.as_deref() {
                    match key {
                        "type" => mention.concept = value.to_string(),
                        "identifier" | "Identifier" => mention.identifier = value.to_string(),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"annotation" => {
                    if let Some(mention) = current.take()
                        && !mention.concept.is_empty()
                    {
                        out.push(mention);
                    }
                }
                b"infon" => infon_key = None,
                b"text" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(CitegraphError::MalformedResponse {
                    api: PUBTATOR_API.to_string(),
                    message: format!(
                        "BioC XML parse error at byte {}: {err}",
                        reader.buffer_position()
                    ),
                });
            }
            _ => {}
        }
    }
    Ok(out)
}
