use crate::entities::EntityClass;
use crate::entities::article::{Annotation, AnnotationSet, ArticleRecord, NULL_SENTINEL};
use crate::sources::eutils::SummaryRecord;
use crate::sources::pubtator::{Mention, PubtatorEntry};
use crate::utils::date;

/// Group mentions into the requested classes.
///
/// Title/abstract exports keep every distinct `(identifier, text)` pair; full text is
/// noisier, so there only the first mention of each identifier is kept.
pub fn annotations_from_mentions(
    mentions: &[Mention],
    classes: &[EntityClass],
    distinct_identifiers: bool,
) -> AnnotationSet {
    let mut set = AnnotationSet::new();
    for mention in mentions {
        let Some(class) = mention.entity_class() else {
            continue;
        };
        if !classes.contains(&class) {
            continue;
        }
        if mention.text.trim().is_empty() && mention.identifier.trim().is_empty() {
            continue;
        }
        let annotation = Annotation::new(&mention.concept, &mention.identifier, &mention.text);
        if distinct_identifiers {
            set.insert_distinct_identifier(class, annotation);
        } else {
            set.insert(class, annotation);
        }
    }
    set
}

fn clean_text(value: &str) -> String {
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if value.is_empty() {
        NULL_SENTINEL.to_string()
    } else {
        value
    }
}

/// Merge the bibliographic summary with the annotation export of the same article.
pub fn from_summary(
    pmid: &str,
    summary: &SummaryRecord,
    entry: Option<&PubtatorEntry>,
    classes: &[EntityClass],
) -> ArticleRecord {
    let (title, abstract_text, annotations) = match entry {
        Some(entry) => (
            clean_text(&entry.title),
            clean_text(&entry.abstract_text),
            annotations_from_mentions(&entry.mentions, classes, false),
        ),
        None => (
            clean_text(&summary.title),
            NULL_SENTINEL.to_string(),
            AnnotationSet::new(),
        ),
    };

    let sort_date = date::sortdate_to_iso(&summary.sortpubdate)
        .unwrap_or_else(|| date::SENTINEL_ISO.to_string());
    let epubdate = date::resolve_publication_date(
        pmid,
        &summary.epubdate,
        &summary.pubdate,
        &summary.sortpubdate,
    );

    ArticleRecord {
        pmid: pmid.trim().to_string(),
        title,
        abstract_text,
        journal: clean_text(&summary.fulljournalname),
        authors: summary.author_names(),
        epubdate,
        sort_date,
        pmc_id: summary.pmc_id(),
        annotations,
        annotated_full_text: false,
    }
}

/// Replace batch-level annotations with full-text ones when the full text yielded any.
pub fn apply_full_text(record: &mut ArticleRecord, mentions: &[Mention], classes: &[EntityClass]) -> bool {
    let full = annotations_from_mentions(mentions, classes, true);
    if full.is_empty() {
        return false;
    }
    record.annotations = full;
    record.annotated_full_text = true;
    true
}
