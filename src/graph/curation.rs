//! Curation steps read from a JSON file and applied to the graph after post-processing:
//! merging duplicate entity nodes, renaming properties, and operator-supplied queries.
//!
//! The file is an object keyed by step name; steps run in key order.
//!
//! ```json
//! {
//!   "01_tp53": {
//!     "name": "tp53", "description": "fold the alias into the symbol",
//!     "from_keys": ["name"], "from_values": ["p53"],
//!     "to_keys": ["name"], "to_values": ["7157"],
//!     "method": "merge"
//!   },
//!   "02_cleanup": { "name": "cleanup", "description": "", "query": "MATCH (n:Keyword) ..." }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::CitegraphError;
use crate::graph::{GraphStore, Query, QueryBuilder, checked_identifier, value_as_u64};

const MERGE_PROCEDURE: &str = "apoc.refactor.mergeNodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurationMethod {
    Merge,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CurationStep {
    Refactor {
        name: String,
        #[serde(default)]
        description: String,
        from_keys: Vec<String>,
        from_values: Vec<String>,
        to_keys: Vec<String>,
        to_values: Vec<String>,
        method: CurationMethod,
    },
    Query {
        name: String,
        #[serde(default)]
        description: String,
        query: String,
    },
}

impl CurationStep {
    pub fn name(&self) -> &str {
        match self {
            Self::Refactor { name, .. } | Self::Query { name, .. } => name,
        }
    }

    pub fn to_query(&self) -> Result<Query, CitegraphError> {
        match self {
            Self::Refactor {
                from_keys,
                from_values,
                to_keys,
                to_values,
                method,
                ..
            } => {
                let from = pairs(from_keys, from_values)?;
                let to = pairs(to_keys, to_values)?;
                Ok(match method {
                    CurationMethod::Merge => merge_query(&from, &to),
                    CurationMethod::Rename => rename_query(&from, &to),
                })
            }
            Self::Query { query, .. } => {
                let query = query.trim();
                if query.is_empty() {
                    return Err(CitegraphError::InvalidArgument(
                        "curation query is empty".into(),
                    ));
                }
                Ok(Query::new(query))
            }
        }
    }
}

fn pairs<'a>(keys: &'a [String], values: &'a [String]) -> Result<Vec<(&'a str, &'a str)>, CitegraphError> {
    if keys.is_empty() || keys.len() != values.len() {
        return Err(CitegraphError::InvalidArgument(format!(
            "{} keys for {} values",
            keys.len(),
            values.len()
        )));
    }
    keys.iter()
        .zip(values)
        .map(|(key, value)| Ok((checked_identifier(key)?, value.as_str())))
        .collect()
}

fn match_clause(b: &mut QueryBuilder, var: &str, pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            let p = b.bind(*value);
            format!("{var}.{key} = {p}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Merge the nodes matching `from` and `to` into one carrying the `to` node's properties
/// and both nodes' relationships. Nothing runs when either side is missing.
pub fn merge_query(from: &[(&str, &str)], to: &[(&str, &str)]) -> Query {
    let mut b = QueryBuilder::new();
    let source = match_clause(&mut b, "n", from);
    let target = match_clause(&mut b, "m", to);
    b.push(&format!(
        "MATCH (n), (m) WHERE {source} AND {target} AND n <> m WITH n, m LIMIT 1 \
CALL {MERGE_PROCEDURE}([n, m], {{properties: 'overwrite', mergeRels: true}}) YIELD node \
RETURN count(node) AS count_n"
    ));
    b.build()
}

pub fn rename_query(from: &[(&str, &str)], to: &[(&str, &str)]) -> Query {
    let mut b = QueryBuilder::new();
    let filter = match_clause(&mut b, "n", from);
    let sets = to
        .iter()
        .map(|(key, value)| {
            let p = b.bind(*value);
            format!("n.{key} = {p}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    b.push(&format!(
        "MATCH (n) WHERE {filter} SET {sets} RETURN count(n) AS count_n"
    ));
    b.build()
}

/// Parse a curation document; entries that fit neither step shape are skipped with a
/// warning.
pub fn parse_steps(text: &str) -> Result<(Vec<CurationStep>, usize), CitegraphError> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(text)
        .map_err(|err| CitegraphError::Config(format!("Invalid curation file: {err}")))?;
    let mut steps = Vec::with_capacity(raw.len());
    let mut skipped = 0;
    for (key, value) in raw {
        match serde_json::from_value::<CurationStep>(value) {
            Ok(step) => steps.push(step),
            Err(err) => {
                warn!(entry = %key, "unrecognised curation entry: {err}");
                skipped += 1;
            }
        }
    }
    Ok((steps, skipped))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurationSummary {
    pub applied: usize,
    pub skipped: usize,
    pub touched: u64,
}

/// Apply every step in order. A step that cannot be expressed as a query is skipped;
/// a store failure stops the run.
pub async fn apply(store: &dyn GraphStore, steps: &[CurationStep]) -> Result<CurationSummary, CitegraphError> {
    let mut summary = CurationSummary::default();
    for step in steps {
        let query = match step.to_query() {
            Ok(query) => query,
            Err(err) => {
                warn!(step = step.name(), "curation step skipped: {err}");
                summary.skipped += 1;
                continue;
            }
        };
        let records = store.run(&query).await?;
        summary.touched += records
            .first()
            .and_then(|record| record.get("count_n"))
            .and_then(value_as_u64)
            .unwrap_or(0);
        summary.applied += 1;
    }
    info!(
        applied = summary.applied,
        skipped = summary.skipped,
        touched = summary.touched,
        "curation finished"
    );
    Ok(summary)
}

pub async fn apply_file(store: &dyn GraphStore, path: &Path) -> Result<CurationSummary, CitegraphError> {
    let text = tokio::fs::read_to_string(path).await?;
    let (steps, unparsed) = parse_steps(&text)?;
    let mut summary = apply(store, &steps).await?;
    summary.skipped += unparsed;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::RecordingStore;
    use serde_json::json;

    const DOCUMENT: &str = r#"{
        "b_rename": {
            "name": "rename", "description": "",
            "from_keys": ["name", "label"], "from_values": ["p53", "gene"],
            "to_keys": ["name"], "to_values": ["7157"],
            "method": "rename"
        },
        "a_merge": {
            "name": "merge", "description": "",
            "from_keys": ["name"], "from_values": ["O'Brien syndrome"],
            "to_keys": ["name"], "to_values": ["MESH:D000001"],
            "method": "merge"
        },
        "c_query": { "name": "raw", "description": "", "query": "MATCH (k:Keyword) WHERE k.name = '' DETACH DELETE k" },
        "d_unknown": { "name": "odd", "method": "split" }
    }"#;

    #[test]
    fn steps_are_parsed_in_key_order_and_bad_entries_counted() {
        let (steps, skipped) = parse_steps(DOCUMENT).unwrap();
        assert_eq!(skipped, 1);
        let names: Vec<&str> = steps.iter().map(CurationStep::name).collect();
        assert_eq!(names, vec!["merge", "rename", "raw"]);
    }

    #[test]
    fn merge_binds_values_and_validates_keys() {
        let q = merge_query(&[("name", "O'Brien syndrome")], &[("name", "MESH:D000001")]);
        assert_eq!(
            q.text,
            "MATCH (n), (m) WHERE n.name = $p0 AND m.name = $p1 AND n <> m WITH n, m LIMIT 1 \
CALL apoc.refactor.mergeNodes([n, m], {properties: 'overwrite', mergeRels: true}) YIELD node \
RETURN count(node) AS count_n"
        );
        assert_eq!(q.params["p0"], json!("O'Brien syndrome"));

        let step = CurationStep::Refactor {
            name: "bad".into(),
            description: String::new(),
            from_keys: vec!["name) DETACH DELETE n //".into()],
            from_values: vec!["x".into()],
            to_keys: vec!["name".into()],
            to_values: vec!["y".into()],
            method: CurationMethod::Merge,
        };
        assert!(step.to_query().is_err());
    }

    #[test]
    fn rename_sets_every_target_pair() {
        let q = rename_query(&[("name", "p53"), ("label", "gene")], &[("name", "7157"), ("label", "TP53")]);
        assert_eq!(
            q.text,
            "MATCH (n) WHERE n.name = $p0 AND n.label = $p1 SET n.name = $p2, n.label = $p3 \
RETURN count(n) AS count_n"
        );
        assert_eq!(q.params["p3"], json!("TP53"));
    }

    #[test]
    fn mismatched_or_empty_keys_are_rejected() {
        let keys = vec!["name".to_string()];
        assert!(pairs(&keys, &[]).is_err());
        assert!(pairs(&[], &[]).is_err());
    }

    #[tokio::test]
    async fn apply_runs_each_valid_step() {
        let store = RecordingStore::default();
        store.responses.lock().unwrap().push(vec![{
            let mut record = crate::graph::Record::new();
            record.insert("count_n".into(), json!(1));
            record
        }]);
        let (mut steps, _) = parse_steps(DOCUMENT).unwrap();
        steps.push(CurationStep::Query {
            name: "blank".into(),
            description: String::new(),
            query: "  ".into(),
        });
        let summary = apply(&store, &steps).await.unwrap();
        assert_eq!(
            summary,
            CurationSummary {
                applied: 3,
                skipped: 1,
                touched: 1
            }
        );
        let queries = store.queries.lock().unwrap();
        assert_eq!(queries.len(), 3);
        assert!(queries[0].text.contains(MERGE_PROCEDURE));
        assert!(queries[2].text.starts_with("MATCH (k:Keyword)"));
    }

    #[tokio::test]
    async fn apply_file_counts_unparsed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curate.json");
        std::fs::write(&path, DOCUMENT).unwrap();
        let store = RecordingStore::default();
        let summary = apply_file(&store, &path).await.unwrap();
        assert_eq!((summary.applied, summary.skipped), (3, 1));
    }
}
