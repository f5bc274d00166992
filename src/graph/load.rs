//! Queries that turn an edge file into Article, Keyword and entity nodes, plus the
//! post-processing passes run after a crawl.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::entities::EntityClass;
use crate::entities::article::NULL_SENTINEL;
use crate::error::CitegraphError;
use crate::graph::{GraphStore, Query, QueryBuilder, value_as_u64};

pub const ARTICLE_LABEL: &str = "Article";
pub const KEYWORD_LABEL: &str = "Keyword";
pub const MAIN_ARTICLE_TAG: &str = "main";
const RANK_GRAPH: &str = "articleGraph";
const RANK_PROPERTY: &str = "article_rank";

pub fn index_queries(classes: &[EntityClass]) -> Vec<Query> {
    let mut labels = vec![ARTICLE_LABEL, KEYWORD_LABEL];
    labels.extend(classes.iter().map(|class| class.as_str()));
    labels
        .into_iter()
        .map(|label| Query::new(format!("CREATE INDEX IF NOT EXISTS FOR (n:{label}) ON (n.name)")))
        .collect()
}

fn article_merge(b: &mut QueryBuilder, var: &str, side: &str, date: &str) {
    b.line(&format!("MERGE ({var}:{ARTICLE_LABEL} {{ name: line.{side} }})"));
    b.line(&format!(
        "SET {var}.a_name = line.{side}, {var}.label = line.{side}, \
{var}.b_title = line.{side}_title, {var}.pmc_id = line.{side}_pmc_id, \
{var}.epubdate = line.{side}_epubdate, {var}.authors = line.{side}_authors, \
{var}.journal = line.{side}_journal, {var}.z_abstract = line.{side}_abstract, \
{var}.date_integration = {date}"
    ));
}

fn keyword_merge(b: &mut QueryBuilder, var: &str, side: &str) {
    b.line(&format!(
        "FOREACH (kw_{side} IN split(line.{side}_keywords, ',') | \
MERGE (k_{side}:{KEYWORD_LABEL} {{ name: kw_{side} }}) MERGE ({var})-[:contains]->(k_{side}))"
    ));
}

fn entity_merge(b: &mut QueryBuilder, var: &str, side: &str, class: EntityClass) {
    let label = class.as_str();
    let item = format!("{side}_{label}");
    b.line(&format!(
        "FOREACH (ann_{item} IN split(line.{side}_{label}, ',') | \
MERGE (e_{item}:{label} {{ name: split(ann_{item}, ';')[0] }}) \
ON CREATE SET e_{item}.label = split(ann_{item}, ';')[1] \
MERGE ({var})-[:has_named_entity]->(e_{item}))"
    ));
}

/// Bulk load of one pipe-delimited edge file reachable by the graph store at `file_url`.
pub fn bulk_load_query(file_url: &str, classes: &[EntityClass], integration_date: &str) -> Query {
    let mut b = QueryBuilder::new();
    let url = b.bind_named("file_url", file_url);
    let date = b.bind_named("date_integration", integration_date);
    b.line(&format!("LOAD CSV WITH HEADERS FROM {url} AS line FIELDTERMINATOR '|'"));
    article_merge(&mut b, "p1", "article", &date);
    article_merge(&mut b, "p2", "reference", &date);
    keyword_merge(&mut b, "p1", "article");
    keyword_merge(&mut b, "p2", "reference");
    for class in classes {
        entity_merge(&mut b, "p1", "article", *class);
        entity_merge(&mut b, "p2", "reference", *class);
    }
    b.push("MERGE (p1)-[:citing]->(p2)");
    b.build()
}

pub fn tag_main_query(pmids: &[String]) -> Query {
    let mut b = QueryBuilder::new();
    let ids = b.bind_named("pmids", pmids.to_vec());
    let tag = b.bind_named("tag", MAIN_ARTICLE_TAG);
    b.push(&format!(
        "UNWIND {ids} AS pmid MATCH (a:{ARTICLE_LABEL} {{ name: pmid }}) SET a.query = {tag} \
RETURN count(a) AS count_n"
    ));
    b.build()
}

pub fn cleanup_null_query() -> Query {
    let mut b = QueryBuilder::new();
    let null = b.bind_named("null", NULL_SENTINEL);
    b.push(&format!("MATCH (n) WHERE n.name = {null} DETACH DELETE n"));
    b.build()
}

pub fn clear_graph_query() -> Query {
    Query::new("MATCH (n) DETACH DELETE n")
}

/// Keep one relationship per (start, type, end) triple.
pub fn duplicate_edges_query() -> Query {
    Query::new(
        "MATCH (s)-[r]->(e) WITH s, e, type(r) AS kind, tail(collect(r)) AS extra \
FOREACH (x IN extra | DELETE x) RETURN sum(size(extra)) AS count_n",
    )
}

/// Age of every article with a concrete publication date, relative to its integration date.
pub fn age_query() -> Query {
    Query::new(format!(
        "MATCH (n:{ARTICLE_LABEL}) \
WHERE n.epubdate <> '{NULL_SENTINEL}' AND size(n.epubdate) = 10 AND size(n.date_integration) = 10 \
SET n.age_in_days = duration.inDays(date(n.epubdate), date(n.date_integration)).days, \
n.age_in_months = duration.inMonths(date(n.epubdate), date(n.date_integration)).months \
RETURN count(n) AS count_n"
    ))
}

fn citation_count_query() -> Query {
    Query::new(format!(
        "MATCH (:{ARTICLE_LABEL})-[r:citing]->(:{ARTICLE_LABEL}) RETURN count(r) AS count_n"
    ))
}

pub fn article_rank_queries() -> Result<[Query; 3], CitegraphError> {
    Ok([
        Query::procedure(
            "gds.graph.project",
            vec![json!(RANK_GRAPH), json!(ARTICLE_LABEL), json!("citing")],
            Some("graphName"),
        )?,
        Query::procedure(
            "gds.articleRank.write",
            vec![json!(RANK_GRAPH), json!({ "writeProperty": RANK_PROPERTY })],
            Some("nodePropertiesWritten"),
        )?,
        Query::procedure("gds.graph.drop", vec![json!(RANK_GRAPH)], Some("graphName"))?,
    ])
}

fn first_count(records: &[crate::graph::Record]) -> u64 {
    records
        .first()
        .and_then(|record| record.get("count_n"))
        .and_then(value_as_u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostProcessSummary {
    pub duplicate_edges: u64,
    pub aged_articles: u64,
    pub ranked: bool,
}

/// Runs the load and maintenance queries against one store.
pub struct GraphLoader<'a> {
    store: &'a dyn GraphStore,
    classes: Vec<EntityClass>,
}

impl<'a> GraphLoader<'a> {
    pub fn new(store: &'a dyn GraphStore, classes: &[EntityClass]) -> Self {
        Self {
            store,
            classes: classes.to_vec(),
        }
    }

    pub async fn setup_indexes(&self) -> Result<(), CitegraphError> {
        self.store.run_all(&index_queries(&self.classes)).await
    }

    pub async fn clear_graph(&self) -> Result<(), CitegraphError> {
        info!("clearing graph store");
        self.store.run(&clear_graph_query()).await?;
        Ok(())
    }

    pub async fn load_edges(&self, file_url: &str, integration_date: &str) -> Result<(), CitegraphError> {
        debug!(file_url, "bulk loading edge file");
        self.store
            .run(&bulk_load_query(file_url, &self.classes, integration_date))
            .await?;
        Ok(())
    }

    pub async fn tag_main(&self, pmids: &[String]) -> Result<u64, CitegraphError> {
        if pmids.is_empty() {
            return Ok(0);
        }
        let records = self.store.run(&tag_main_query(pmids)).await?;
        Ok(first_count(&records))
    }

    /// Project the citation graph, write article rank, and drop the projection.
    /// Skipped when no citation edge exists yet.
    pub async fn compute_article_rank(&self) -> Result<bool, CitegraphError> {
        let citations = first_count(&self.store.run(&citation_count_query()).await?);
        if citations == 0 {
            info!("no citation edges, article rank skipped");
            return Ok(false);
        }
        let [project, write, drop] = article_rank_queries()?;
        self.store.run(&project).await?;
        let written = self.store.run(&write).await;
        // The projection is dropped even when the write fails.
        self.store.run(&drop).await?;
        written?;
        Ok(true)
    }

    pub async fn post_process(&self) -> Result<PostProcessSummary, CitegraphError> {
        self.store.run(&cleanup_null_query()).await?;
        let duplicate_edges = first_count(&self.store.run(&duplicate_edges_query()).await?);
        let aged_articles = first_count(&self.store.run(&age_query()).await?);
        let ranked = self.compute_article_rank().await?;
        info!(duplicate_edges, aged_articles, ranked, "graph post-processing finished");
        Ok(PostProcessSummary {
            duplicate_edges,
            aged_articles,
            ranked,
        })
    }
}

/// URL the graph store reads an edge file from: the configured one, else a `file://` URL.
pub fn import_url(configured: Option<&str>, local: &std::path::Path) -> String {
    match configured.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => url.to_string(),
        None => format!("file://{}", local.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::RecordingStore;

    fn count_row(n: u64) -> Vec<crate::graph::Record> {
        let mut record = crate::graph::Record::new();
        record.insert("count_n".into(), json!(n));
        vec![record]
    }

    #[test]
    fn bulk_load_covers_each_class_on_both_sides() {
        let q = bulk_load_query(
            "file:///data/citations.csv",
            &[EntityClass::Gene, EntityClass::CellLine],
            "2024-05-01",
        );
        assert!(q.text.starts_with("LOAD CSV WITH HEADERS FROM $file_url AS line FIELDTERMINATOR '|'"));
        assert!(q.text.contains("split(line.article_gene, ',')"));
        assert!(q.text.contains("split(line.reference_cellline, ',')"));
        assert!(q.text.contains("MERGE (e_reference_gene:gene"));
        assert!(q.text.contains("p2.date_integration = $date_integration"));
        assert!(q.text.ends_with("MERGE (p1)-[:citing]->(p2)"));
        assert!(!q.text.contains("disease"));
        assert_eq!(q.params["date_integration"], json!("2024-05-01"));
    }

    #[test]
    fn indexes_include_article_keyword_and_classes() {
        let queries = index_queries(&[EntityClass::Disease]);
        assert_eq!(queries.len(), 3);
        assert!(queries[2].text.contains("(n:disease)"));
    }

    #[tokio::test]
    async fn article_rank_is_skipped_without_citations() {
        let store = RecordingStore::default();
        store.responses.lock().unwrap().push(count_row(0));
        let loader = GraphLoader::new(&store, &EntityClass::ALL);
        assert!(!loader.compute_article_rank().await.unwrap());
        assert_eq!(store.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn post_process_runs_cleanup_dedupe_age_and_rank_in_order() {
        let store = RecordingStore::default();
        {
            let mut responses = store.responses.lock().unwrap();
            responses.push(Vec::new());
            responses.push(count_row(3));
            responses.push(count_row(42));
            responses.push(count_row(7));
        }
        let loader = GraphLoader::new(&store, &EntityClass::ALL);
        let summary = loader.post_process().await.unwrap();
        assert_eq!(
            summary,
            PostProcessSummary {
                duplicate_edges: 3,
                aged_articles: 42,
                ranked: true
            }
        );

        let queries = store.queries.lock().unwrap();
        assert!(queries[0].text.contains("DETACH DELETE"));
        assert_eq!(queries[1], duplicate_edges_query());
        assert!(queries[2].text.contains("age_in_days"));
        assert!(queries[4].text.starts_with("CALL gds.graph.project"));
        assert!(queries[5].text.starts_with("CALL gds.articleRank.write"));
        assert!(queries[6].text.starts_with("CALL gds.graph.drop"));
    }

    #[test]
    fn duplicate_cleanup_keeps_one_edge_per_type_and_pair() {
        let q = duplicate_edges_query();
        assert!(q.text.starts_with("MATCH (s)-[r]->(e) WITH s, e, type(r) AS kind, tail(collect(r)) AS extra"));
        assert!(q.text.contains("FOREACH (x IN extra | DELETE x)"));
        assert!(q.params.is_empty());
    }

    #[tokio::test]
    async fn clear_graph_detaches_every_node() {
        let store = RecordingStore::default();
        GraphLoader::new(&store, &[EntityClass::Gene])
            .clear_graph()
            .await
            .unwrap();
        let queries = store.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].text, "MATCH (n) DETACH DELETE n");
    }

    #[test]
    fn import_url_prefers_configured_value() {
        let local = std::path::Path::new("/tmp/edges.csv");
        assert_eq!(import_url(Some("file:///data/x.csv"), local), "file:///data/x.csv");
        assert_eq!(import_url(Some("  "), local), "file:///tmp/edges.csv");
        assert_eq!(import_url(None, local), "file:///tmp/edges.csv");
    }
}
