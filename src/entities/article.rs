use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::entities::EntityClass;

/// Placeholder written wherever a value is absent so column arity stays fixed.
pub const NULL_SENTINEL: &str = "Null";

/// One named-entity mention, rendered as `Concept:identifier;text` for the bulk loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub concept: String,
    pub identifier: String,
    pub text: String,
}

fn clean_token(value: &str) -> String {
    value
        .replace([',', ';', '|', '"', '\n', '\r', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl Annotation {
    pub fn new(concept: &str, identifier: &str, text: &str) -> Self {
        let text = clean_token(text);
        let identifier = match identifier.trim() {
            "" | "-" => text.clone(),
            id => clean_token(id),
        };
        Self {
            concept: clean_token(concept),
            identifier,
            text,
        }
    }

    pub fn node_name(&self) -> String {
        format!("{}:{}", self.concept, self.identifier)
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};{}", self.concept, self.identifier, self.text)
    }
}

/// Per-class annotations of one article, insertion-ordered within a class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationSet {
    entries: BTreeMap<EntityClass, Vec<Annotation>>,
}

impl AnnotationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mention unless the same identifier and surface text is already present.
    pub fn insert(&mut self, class: EntityClass, annotation: Annotation) -> bool {
        let list = self.entries.entry(class).or_default();
        if list
            .iter()
            .any(|a| a.identifier == annotation.identifier && a.text == annotation.text)
        {
            return false;
        }
        list.push(annotation);
        true
    }

    /// Adds a mention unless its normalized identifier is already present.
    pub fn insert_distinct_identifier(&mut self, class: EntityClass, annotation: Annotation) -> bool {
        let list = self.entries.entry(class).or_default();
        if list.iter().any(|a| a.identifier == annotation.identifier) {
            return false;
        }
        list.push(annotation);
        true
    }

    pub fn get(&self, class: EntityClass) -> &[Annotation] {
        self.entries.get(&class).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Edge-file column value for one class: comma-joined mentions, or the sentinel.
    pub fn column(&self, class: EntityClass) -> String {
        let list = self.get(class);
        if list.is_empty() {
            return NULL_SENTINEL.to_string();
        }
        list.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// All requested classes in order, joined with `|`.
    pub fn render(&self, classes: &[EntityClass]) -> String {
        classes
            .iter()
            .map(|class| self.column(*class))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub journal: String,
    #[serde(default)]
    pub authors: Vec<String>,
    /// ISO `YYYY-MM-DD`.
    pub epubdate: String,
    pub sort_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmc_id: Option<String>,
    pub annotations: AnnotationSet,
    #[serde(default)]
    pub annotated_full_text: bool,
}

impl ArticleRecord {
    /// Record with every field set to the sentinel, used when an article has no data.
    pub fn placeholder(pmid: &str) -> Self {
        Self {
            pmid: pmid.trim().to_string(),
            title: NULL_SENTINEL.to_string(),
            abstract_text: NULL_SENTINEL.to_string(),
            journal: NULL_SENTINEL.to_string(),
            authors: Vec::new(),
            epubdate: NULL_SENTINEL.to_string(),
            sort_date: NULL_SENTINEL.to_string(),
            pmc_id: None,
            annotations: AnnotationSet::new(),
            annotated_full_text: false,
        }
    }

    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.title, self.abstract_text)
    }

    /// Case-insensitive substring relevance; an empty term list accepts everything.
    pub fn is_relevant(&self, terms: &[String]) -> bool {
        let terms: Vec<&str> = terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return true;
        }
        let haystack = self.searchable_text().to_lowercase();
        terms
            .iter()
            .any(|term| haystack.contains(&term.to_lowercase()))
    }

    /// Matching keywords in caller order, comma-joined, or the sentinel.
    pub fn keyword_label(&self, keywords: &[String]) -> String {
        let haystack = self.searchable_text().to_lowercase();
        let mut hits: Vec<&str> = Vec::new();
        for keyword in keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            if haystack.contains(&keyword.to_lowercase()) && !hits.contains(&keyword) {
                hits.push(keyword);
            }
        }
        if hits.is_empty() {
            NULL_SENTINEL.to_string()
        } else {
            hits.join(",")
        }
    }

    pub fn authors_field(&self) -> String {
        if self.authors.is_empty() {
            NULL_SENTINEL.to_string()
        } else {
            self.authors.join("; ")
        }
    }

    pub fn age_in_days(&self, on: Date) -> Option<i64> {
        let published = crate::utils::date::parse_iso(&self.epubdate)?;
        Some((on - published).whole_days())
    }
}
