//! Markdown output. Cells are formatted and escaped in Rust; templates only lay them out.

use std::path::Path;

use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use crate::entities::EntityClass;
use crate::entities::article::ArticleRecord;
use crate::error::CitegraphError;
use crate::graph::enrichment::{EnrichmentTable, SCORE_PRECISION};
use crate::pipeline::CrawlSummary;
use crate::pipeline::citations::EdgeRow;
use crate::pipeline::resolve::ResolveOutcome;

const TITLE_WIDTH: usize = 80;
const ID_PREVIEW: usize = 20;

const TABLE_TEMPLATE: &str = r#"{% if table.rows %}
| {{ table.headers | join(" | ") }} |
{{ table.separator }}
{% for row in table.rows %}
| {{ row | join(" | ") }} |
{% endfor %}
{% else %}
{{ table.empty }}
{% endif %}
"#;

const ENRICHMENT_TEMPLATE: &str = r#"# Enrichment: {{ goal }}

{% include "table.md" %}
{% if table.rows %}

{{ table.rows | length }} entities ranked by {{ table.headers[0] }}.
{% endif %}
"#;

const CRAWL_TEMPLATE: &str = r#"# Crawl summary

| Step | Count |
|------|-------|
| Identifiers resolved | {{ s.resolved }}{% if not s.resolve_complete %} (truncated){% endif %} |
| Already integrated | {{ s.skipped }} |
| Refreshed from ledger | {{ s.refreshed }} |
| Integrated | {{ s.integrated }} |
| Exported without loading | {{ s.exported }} |
| Edge rows | {{ s.rows }} |
| Dropped batches | {{ s.dropped_batches }} ({{ s.dropped_ids }} identifiers) |
{% if s.post_process %}
| Duplicate edges removed | {{ s.post_process.duplicate_edges }} |
| Articles aged | {{ s.post_process.aged_articles }} |
| Article rank | {% if s.post_process.ranked %}written{% else %}skipped{% endif %} |
{% endif %}
{% if s.curation %}
| Curation steps applied | {{ s.curation.applied }} |
| Curation steps skipped | {{ s.curation.skipped }} |
{% endif %}

Edge file: `{{ edge_file }}`
{% if not s.post_process %}

No graph store configured; edges were written but not loaded.
{% endif %}
"#;

const RESOLVE_TEMPLATE: &str = r#"# Identifiers: {{ term }}

Collected {{ collected }} of {{ total }} matching identifiers{% if not complete %} (page ceiling reached, list truncated){% endif %}.
{% if path %}
Written to `{{ path }}`.
{% endif %}
{% if preview %}

{% for id in preview %}
- {{ id }}
{% endfor %}
{% if more %}
- ... {{ more }} more
{% endif %}
{% endif %}
"#;

const ARTICLES_TEMPLATE: &str = r#"# Article metadata

{% include "table.md" %}
{% if dropped %}

Dropped (batch failed or misaligned): {{ dropped | join(", ") }}
{% endif %}
"#;

const EDGES_TEMPLATE: &str = r#"# Citations of {{ focal }}

{% include "table.md" %}
{% if path %}

Edge file: `{{ path }}`
{% endif %}
"#;

#[derive(Debug, Serialize)]
struct Table {
    headers: Vec<String>,
    separator: String,
    rows: Vec<Vec<String>>,
    empty: &'static str,
}

impl Table {
    fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>, empty: &'static str) -> Self {
        let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
        let separator = format!("|{}", "---|".repeat(headers.len()));
        Self {
            headers,
            separator,
            rows: Vec::new(),
            empty,
        }
    }
}

fn environment() -> Result<Environment<'static>, CitegraphError> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("table.md", TABLE_TEMPLATE)?;
    env.add_template("enrichment.md", ENRICHMENT_TEMPLATE)?;
    env.add_template("crawl.md", CRAWL_TEMPLATE)?;
    env.add_template("resolve.md", RESOLVE_TEMPLATE)?;
    env.add_template("articles.md", ARTICLES_TEMPLATE)?;
    env.add_template("edges.md", EDGES_TEMPLATE)?;
    Ok(env)
}

fn render(name: &str, ctx: minijinja::Value) -> Result<String, CitegraphError> {
    let env = environment()?;
    Ok(env.get_template(name)?.render(ctx)?)
}

fn escape_cell(value: &str) -> String {
    value
        .replace('|', "\\|")
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string()
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// One table cell. Integers print as-is, other numbers with score precision.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => format!("{f:.prec$}", prec = SCORE_PRECISION as usize),
            _ => n.to_string(),
        },
        Value::String(s) if s.trim().is_empty() => "-".to_string(),
        Value::String(s) => escape_cell(s),
        Value::Array(items) => items.iter().map(format_cell).collect::<Vec<_>>().join(", "),
        Value::Object(_) => escape_cell(&value.to_string()),
    }
}

pub fn enrichment_markdown(result: &EnrichmentTable) -> Result<String, CitegraphError> {
    let mut table = Table::new(result.columns.iter().cloned(), "No entity passed the mention threshold.");
    table.rows = result
        .rows
        .iter()
        .map(|row| row.iter().map(format_cell).collect())
        .collect();
    render("enrichment.md", context! { goal => &result.goal, table => table })
}

pub fn crawl_markdown(summary: &CrawlSummary) -> Result<String, CitegraphError> {
    render(
        "crawl.md",
        context! { s => summary, edge_file => summary.edge_file.display().to_string() },
    )
}

pub fn resolve_markdown(term: &str, outcome: &ResolveOutcome, path: Option<&Path>) -> Result<String, CitegraphError> {
    let preview: Vec<&String> = outcome.ids.iter().take(ID_PREVIEW).collect();
    render(
        "resolve.md",
        context! {
            term => term,
            collected => outcome.ids.len(),
            total => outcome.total,
            complete => outcome.complete,
            path => path.map(|p| p.display().to_string()),
            preview => preview,
            more => outcome.ids.len().saturating_sub(ID_PREVIEW),
        },
    )
}

pub fn articles_markdown(
    records: &[ArticleRecord],
    classes: &[EntityClass],
    dropped: &[String],
) -> Result<String, CitegraphError> {
    let mut headers = vec!["PMID", "Title", "Published", "Journal", "PMC"];
    headers.extend(classes.iter().map(|class| class.as_str()));
    let mut table = Table::new(headers, "No article metadata returned.");
    for record in records {
        let mut row = vec![
            escape_cell(&record.pmid),
            escape_cell(&truncate(&record.title, TITLE_WIDTH)),
            escape_cell(&record.epubdate),
            escape_cell(&record.journal),
            record.pmc_id.as_deref().map(escape_cell).unwrap_or_else(|| "-".into()),
        ];
        row.extend(
            classes
                .iter()
                .map(|class| record.annotations.get(*class).len().to_string()),
        );
        table.rows.push(row);
    }
    render("articles.md", context! { table => table, dropped => dropped })
}

pub fn edges_markdown(focal: &str, rows: &[EdgeRow], path: Option<&Path>) -> Result<String, CitegraphError> {
    let mut table = Table::new(
        ["Article", "Reference", "Reference title", "Published", "Keywords"],
        "No citation edges.",
    );
    for row in rows {
        table.rows.push(vec![
            escape_cell(&row.article.pmid),
            escape_cell(&row.reference.pmid),
            escape_cell(&truncate(&row.reference.title, TITLE_WIDTH)),
            escape_cell(&row.reference.epubdate),
            escape_cell(&row.reference.keywords),
        ]);
    }
    render(
        "edges.md",
        context! { focal => focal, table => table, path => path.map(|p| p.display().to_string()) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::load::PostProcessSummary;
    use crate::pipeline::citations::EdgeEndpoint;
    use serde_json::json;

    #[test]
    fn cells_escape_pipes_and_format_scores() {
        assert_eq!(format_cell(&json!("a|b\nc")), "a\\|b c");
        assert_eq!(format_cell(&json!(5)), "5");
        assert_eq!(format_cell(&json!(2.5)), "2.5000");
        assert_eq!(format_cell(&Value::Null), "-");
        assert_eq!(format_cell(&json!(["x", 1])), "x, 1");
    }

    #[test]
    fn enrichment_table_renders_rows() {
        let table = EnrichmentTable {
            goal: "gene".into(),
            columns: vec!["score".into(), "symbol".into()],
            rows: vec![vec![json!(5.0), json!("SOD1")]],
        };
        let out = enrichment_markdown(&table).unwrap();
        assert!(out.starts_with("# Enrichment: gene\n"));
        assert!(out.contains("| score | symbol |\n|---|---|\n| 5.0000 | SOD1 |\n"));
        assert!(out.contains("1 entities ranked by score."));
    }

    #[test]
    fn empty_enrichment_says_so() {
        let table = EnrichmentTable {
            goal: "disease".into(),
            columns: vec!["score".into()],
            rows: Vec::new(),
        };
        let out = enrichment_markdown(&table).unwrap();
        assert!(out.contains("No entity passed the mention threshold."));
        assert!(!out.contains("|---|"));
    }

    #[test]
    fn crawl_summary_mentions_missing_store() {
        let summary = CrawlSummary {
            resolved: 12,
            resolve_complete: false,
            integrated: 10,
            rows: 40,
            edge_file: "/tmp/citations.csv".into(),
            ..CrawlSummary::default()
        };
        let out = crawl_markdown(&summary).unwrap();
        assert!(out.contains("| Identifiers resolved | 12 (truncated) |"));
        assert!(out.contains("Edge file: `/tmp/citations.csv`"));
        assert!(out.contains("No graph store configured"));

        let loaded = CrawlSummary {
            post_process: Some(PostProcessSummary {
                duplicate_edges: 2,
                aged_articles: 3,
                ranked: true,
            }),
            ..summary
        };
        let out = crawl_markdown(&loaded).unwrap();
        assert!(out.contains("| Article rank | written |"));
        assert!(out.contains("| Duplicate edges removed | 2 |"));
        assert!(!out.contains("No graph store configured"));
    }

    #[test]
    fn resolve_preview_is_capped() {
        let outcome = ResolveOutcome {
            ids: (1..=25).map(|n| n.to_string()).collect(),
            total: 30,
            complete: false,
        };
        let out = resolve_markdown("als", &outcome, Some(Path::new("/tmp/pmids.csv"))).unwrap();
        assert!(out.contains("Collected 25 of 30 matching identifiers (page ceiling reached"));
        assert!(out.contains("Written to `/tmp/pmids.csv`."));
        assert!(out.contains("- 20\n"));
        assert!(!out.contains("- 21\n"));
        assert!(out.contains("- ... 5 more"));
    }

    #[test]
    fn articles_table_counts_annotations_per_class() {
        let mut record = ArticleRecord::placeholder("123");
        record.title = "A | B".into();
        let out = articles_markdown(&[record], &[EntityClass::Gene], &["9".into()]).unwrap();
        assert!(out.contains("| PMID | Title | Published | Journal | PMC | gene |"));
        assert!(out.contains("| 123 | A \\| B | Null | Null | - | 0 |"));
        assert!(out.contains("Dropped (batch failed or misaligned): 9"));
    }

    #[test]
    fn edges_table_lists_references() {
        let mut reference = EdgeEndpoint::null(&[]);
        reference.pmid = "2".into();
        reference.title = "Ref".into();
        let mut article = EdgeEndpoint::null(&[]);
        article.pmid = "1".into();
        let rows = vec![EdgeRow { article, reference }];
        let out = edges_markdown("1", &rows, None).unwrap();
        assert!(out.starts_with("# Citations of 1\n"));
        assert!(out.contains("| 1 | 2 | Ref | Null | Null |"));
        assert!(!out.contains("Edge file"));
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "x".repeat(100);
        assert_eq!(truncate(&long, 10).chars().count(), 10);
        assert_eq!(truncate("short", 10), "short");
    }
}
