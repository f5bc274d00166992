//! Entity enrichment: how much more often an entity is mentioned inside a filtered
//! subset of articles than across the whole corpus.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::CitegraphError;
use crate::graph::{GraphStore, Query, QueryBuilder, checked_identifier};

pub const DEFAULT_MIN_MENTIONS: u64 = 10;
pub const SCORE_PRECISION: i32 = 4;

/// Attributes compared as numbers rather than lower-cased strings.
pub const NUMERIC_ATTRIBUTES: &[&str] = &["age_in_days", "age_in_months", "article_rank"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GoalClass {
    Article,
    Gene,
    Chemical,
    Disease,
    Species,
    Mutation,
    CellLine,
    Drug,
    GoBp,
    GoCc,
    GoMf,
    PathwayKegg,
    PathwayReactome,
    PathwayWikipathways,
    PathwayNetpath,
    PathwayBiocarta,
    PathwayPid,
}

/// Graph label, returned columns as `(property, alias)`, and the node type an indirectly
/// linked class is reached through.
#[derive(Debug, Clone, Copy)]
pub struct GoalSpec {
    pub class: GoalClass,
    pub name: &'static str,
    pub label: &'static str,
    pub columns: &'static [(&'static str, &'static str)],
    pub jump: Option<&'static str>,
}

const NAME_LABEL: &[(&str, &str)] = &[("name", "name"), ("label", "label")];
const PATHWAY_COLUMNS: &[(&str, &str)] = &[("name", "name"), ("label", "label"), ("id", "id")];
const GO_COLUMNS: &[(&str, &str)] = &[
    ("name", "name"),
    ("term", "term"),
    ("evidence", "evidence"),
    ("qualifier", "qualifier"),
    ("gocategory", "gocategory"),
];

pub const GOALS: &[GoalSpec] = &[
    GoalSpec {
        class: GoalClass::Article,
        name: "article",
        label: "Article",
        columns: &[
            ("name", "pubmed_id"),
            ("pmc_id", "pmc_id"),
            ("label", "label"),
            ("b_title", "title"),
            ("age_in_days", "age_in_days"),
            ("epubdate", "epubdate"),
            ("journal", "journal"),
            ("authors", "authors"),
            ("date_integration", "date_integration"),
            ("name", "db_name"),
        ],
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Gene,
        name: "gene",
        label: "gene",
        columns: &[
            ("entrezgene", "entrez_gene"),
            ("label", "label"),
            ("symbol", "symbol"),
            ("ensembl_ids", "ensembl_ids"),
            ("name", "db_name"),
            ("alias", "alias"),
        ],
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Chemical,
        name: "chemical",
        label: "chemical",
        columns: &[("name", "mesh_chemical"), ("label", "label"), ("name", "db_name")],
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Disease,
        name: "disease",
        label: "disease",
        columns: &[("name", "mesh_disease"), ("label", "label"), ("name", "db_name")],
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Species,
        name: "species",
        label: "species",
        columns: NAME_LABEL,
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Mutation,
        name: "mutation",
        label: "mutation",
        columns: NAME_LABEL,
        jump: None,
    },
    GoalSpec {
        class: GoalClass::CellLine,
        name: "cellline",
        label: "cellline",
        columns: NAME_LABEL,
        jump: None,
    },
    GoalSpec {
        class: GoalClass::Drug,
        name: "drug",
        label: "drug",
        columns: &[("name", "name"), ("label", "label"), ("approved", "approved")],
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::GoBp,
        name: "GO_BP",
        label: "GO_BP",
        columns: GO_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::GoCc,
        name: "GO_CC",
        label: "GO_CC",
        columns: GO_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::GoMf,
        name: "GO_MF",
        label: "GO_MF",
        columns: GO_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayKegg,
        name: "pathway_kegg",
        label: "pathway_kegg",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayReactome,
        name: "pathway_reactome",
        label: "pathway_reactome",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayWikipathways,
        name: "pathway_wikipathways",
        label: "pathway_wikipathways",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayNetpath,
        name: "pathway_netpath",
        label: "pathway_netpath",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayBiocarta,
        name: "pathway_biocarta",
        label: "pathway_biocarta",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
    GoalSpec {
        class: GoalClass::PathwayPid,
        name: "pathway_pid",
        label: "pathway_pid",
        columns: PATHWAY_COLUMNS,
        jump: Some("gene"),
    },
];

impl GoalClass {
    pub fn spec(self) -> &'static GoalSpec {
        GOALS
            .iter()
            .find(|spec| spec.class == self)
            .unwrap_or(&GOALS[0])
    }

    pub fn label(self) -> &'static str {
        self.spec().label
    }
}

impl FromStr for GoalClass {
    type Err = CitegraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        GOALS
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(wanted))
            .map(|spec| spec.class)
            .ok_or_else(|| {
                CitegraphError::InvalidArgument(format!(
                    "Unknown entity class '{wanted}'. Run `citegraph list goal` for the supported classes."
                ))
            })
    }
}

impl fmt::Display for GoalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    StartsWith,
    EndsWith,
    Contains,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_cypher(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::StartsWith => "STARTS WITH",
            Self::EndsWith => "ENDS WITH",
            Self::Contains => "CONTAINS",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    pub fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    fn is_textual(self) -> bool {
        matches!(self, Self::StartsWith | Self::EndsWith | Self::Contains)
    }
}

impl FromStr for Operator {
    type Err = CitegraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Self::Eq,
            "<>" | "!=" => Self::Ne,
            "<" => Self::Lt,
            ">" => Self::Gt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "starts with" => Self::StartsWith,
            "ends with" => Self::EndsWith,
            "contains" => Self::Contains,
            "is null" => Self::IsNull,
            "is not null" => Self::IsNotNull,
            _ => {
                return Err(CitegraphError::InvalidArgument(format!(
                    "Unsupported operator '{}'",
                    s.trim()
                )));
            }
        })
    }
}

/// One validated `attribute operator value` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    pub operator: Operator,
    pub value: Option<String>,
}

impl Condition {
    pub fn parse(attribute: &str, operator: &str, value: Option<&str>) -> Result<Self, CitegraphError> {
        let attribute = checked_identifier(attribute)?.to_string();
        let operator: Operator = operator.parse()?;
        let value = if operator.takes_value() {
            let value = value.map(str::trim).unwrap_or_default();
            if value.is_empty() {
                return Err(CitegraphError::InvalidArgument(format!(
                    "Operator '{}' on '{attribute}' needs a value",
                    operator.as_cypher()
                )));
            }
            if is_numeric_attribute(&attribute) {
                if operator.is_textual() {
                    return Err(CitegraphError::InvalidArgument(format!(
                        "'{attribute}' is numeric; '{}' is not applicable",
                        operator.as_cypher()
                    )));
                }
                if value.parse::<f64>().is_err() {
                    return Err(CitegraphError::InvalidArgument(format!(
                        "'{attribute}' expects a number, got '{value}'"
                    )));
                }
            }
            Some(value.to_string())
        } else {
            None
        };
        Ok(Self {
            attribute,
            operator,
            value,
        })
    }

    fn render(&self, var: &str, b: &mut QueryBuilder) -> String {
        let Some(value) = &self.value else {
            return format!("{var}.{} {}", self.attribute, self.operator.as_cypher());
        };
        if is_numeric_attribute(&self.attribute) {
            let number: f64 = value.parse().unwrap_or_default();
            let p = b.bind(number);
            format!("{var}.{} {} {p}", self.attribute, self.operator.as_cypher())
        } else {
            let p = b.bind(value.to_lowercase());
            format!(
                "toLower(toString({var}.{})) {} {p}",
                self.attribute,
                self.operator.as_cypher()
            )
        }
    }
}

fn is_numeric_attribute(attribute: &str) -> bool {
    NUMERIC_ATTRIBUTES.contains(&attribute)
}

/// A condition on an entity node linked from the subset's articles.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFilter {
    pub class: GoalClass,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

pub fn parse_sort(expr: &str, columns: &[String]) -> Result<Vec<SortKey>, CitegraphError> {
    let mut keys = Vec::new();
    for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut words = part.split_whitespace();
        let column = words.next().unwrap_or_default();
        let descending = match words.next().map(|w| w.to_ascii_uppercase()) {
            None => false,
            Some(dir) if dir == "ASC" => false,
            Some(dir) if dir == "DESC" => true,
            Some(other) => {
                return Err(CitegraphError::InvalidArgument(format!(
                    "Invalid sort direction '{other}'"
                )));
            }
        };
        if words.next().is_some() {
            return Err(CitegraphError::InvalidArgument(format!(
                "Invalid sort expression '{part}'"
            )));
        }
        if !columns.iter().any(|c| c == column) {
            return Err(CitegraphError::InvalidArgument(format!(
                "Cannot sort by '{column}'. Available columns: {}",
                columns.join(", ")
            )));
        }
        keys.push(SortKey {
            column: column.to_string(),
            descending,
        });
    }
    if keys.is_empty() {
        keys.push(SortKey {
            column: "score".into(),
            descending: true,
        });
    }
    Ok(keys)
}

/// Parallel lists describing a conjunction of entity conditions.
#[derive(Debug, Clone, Default)]
pub struct FilterLists {
    pub labels: Vec<String>,
    pub attributes: Vec<String>,
    pub operators: Vec<String>,
    pub values: Vec<String>,
}

/// Raw, caller-supplied enrichment parameters.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentParams {
    pub goal: Option<String>,
    pub goal_attribute: Option<String>,
    pub goal_operator: Option<String>,
    pub goal_value: Option<String>,
    pub subset_1: FilterLists,
    pub subset_2: Option<FilterLists>,
    pub article_attributes: Vec<String>,
    pub article_operators: Vec<String>,
    pub article_values: Vec<String>,
    pub min_mentions: Option<u64>,
    pub sort: Option<String>,
    pub normalize_by_age: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRequest {
    pub goal: GoalClass,
    pub goal_filter: Option<Condition>,
    pub subset_1: Vec<EntityFilter>,
    pub subset_2: Option<Vec<EntityFilter>>,
    pub article_filter: Vec<Condition>,
    pub min_mentions: u64,
    pub sort: Vec<SortKey>,
    pub normalize_by_age: bool,
}

fn check_lengths(what: &str, lengths: &[usize]) -> Result<(), CitegraphError> {
    if lengths.windows(2).any(|w| w[0] != w[1]) {
        return Err(CitegraphError::InvalidArgument(format!(
            "{what}: labels, attributes, operators and values must have the same length (got {lengths:?})"
        )));
    }
    Ok(())
}

fn value_at(values: &[String], idx: usize) -> Option<&str> {
    values.get(idx).map(String::as_str)
}

fn entity_filters(what: &str, lists: &FilterLists) -> Result<Vec<EntityFilter>, CitegraphError> {
    check_lengths(
        what,
        &[
            lists.labels.len(),
            lists.attributes.len(),
            lists.operators.len(),
            lists.values.len(),
        ],
    )?;
    lists
        .labels
        .iter()
        .enumerate()
        .map(|(idx, label)| {
            Ok(EntityFilter {
                class: label.parse()?,
                condition: Condition::parse(
                    &lists.attributes[idx],
                    &lists.operators[idx],
                    value_at(&lists.values, idx),
                )?,
            })
        })
        .collect()
}

impl EnrichmentParams {
    pub fn validate(&self) -> Result<EnrichmentRequest, CitegraphError> {
        let goal: GoalClass = match self.goal.as_deref().map(str::trim) {
            Some(goal) if !goal.is_empty() => goal.parse()?,
            _ => {
                return Err(CitegraphError::InvalidArgument(
                    "No goal entity class provided".into(),
                ));
            }
        };

        let goal_filter = match (&self.goal_attribute, &self.goal_operator) {
            (Some(attr), Some(op)) if !attr.trim().is_empty() && !op.trim().is_empty() => {
                Some(Condition::parse(attr, op, self.goal_value.as_deref())?)
            }
            (Some(attr), None) if !attr.trim().is_empty() => {
                return Err(CitegraphError::InvalidArgument(
                    "Goal attribute given without an operator".into(),
                ));
            }
            _ => None,
        };

        let subset_1 = entity_filters("subset 1", &self.subset_1)?;
        let subset_2 = self
            .subset_2
            .as_ref()
            .map(|lists| entity_filters("subset 2", lists))
            .transpose()?;

        check_lengths(
            "article filter",
            &[
                self.article_attributes.len(),
                self.article_operators.len(),
                self.article_values.len(),
            ],
        )?;
        let article_filter = self
            .article_attributes
            .iter()
            .enumerate()
            .map(|(idx, attr)| {
                Condition::parse(
                    attr,
                    &self.article_operators[idx],
                    value_at(&self.article_values, idx),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let columns = result_columns(goal, subset_2.is_some());
        let sort = parse_sort(self.sort.as_deref().unwrap_or_default(), &columns)?;

        Ok(EnrichmentRequest {
            goal,
            goal_filter,
            subset_1,
            subset_2,
            article_filter,
            min_mentions: self.min_mentions.unwrap_or(DEFAULT_MIN_MENTIONS),
            sort,
            normalize_by_age: self.normalize_by_age && goal == GoalClass::Article,
        })
    }
}

/// Column order of every enrichment table for `goal`.
pub fn result_columns(goal: GoalClass, two_subsets: bool) -> Vec<String> {
    let mut columns = vec!["score".to_string()];
    columns.extend(goal.spec().columns.iter().map(|(_, alias)| alias.to_string()));
    columns.extend(
        [
            "absolute_mentions",
            "expected_mentions",
            "absolute_subset_mentions_1",
            "relative_subset_mentions_1",
            "score_1",
        ]
        .map(String::from),
    );
    if two_subsets {
        columns.extend(
            [
                "absolute_subset_mentions_2",
                "relative_subset_mentions_2",
                "score_2",
            ]
            .map(String::from),
        );
    }
    columns.push("db_id".into());
    columns
}

fn subset_clause(
    b: &mut QueryBuilder,
    n: u8,
    filters: &[EntityFilter],
    article_filter: &[Condition],
) {
    let var = format!("subset_articles_{n}");
    let article_conditions: Vec<String> = article_filter
        .iter()
        .map(|cond| cond.render(&var, b))
        .collect();
    if filters.is_empty() {
        b.push(&format!("MATCH ({var}:Article)"));
        if !article_conditions.is_empty() {
            b.push(&format!(" WHERE {}", article_conditions.join(" AND ")));
        }
        b.push("\n");
        return;
    }
    for (idx, filter) in filters.iter().enumerate() {
        let node = format!("s_{n}_{idx}");
        let mut conditions = vec![filter.condition.render(&node, b)];
        conditions.extend(article_conditions.iter().cloned());
        b.line(&format!(
            "MATCH ({node}:{})<--({var}:Article) WHERE {}",
            filter.class.label(),
            conditions.join(" AND ")
        ));
    }
}

/// The graph query that counts mentions and computes every score over the stored corpus.
///
/// `expected = absolute / count_articles`, `score_k = (subset_k mentions / subset_k size) /
/// expected`, divided by the article age in years when normalizing, rounded to
/// [`SCORE_PRECISION`] places. With two subsets the reported score is `score_2 / score_1`.
pub fn build_query(request: &EnrichmentRequest) -> Query {
    let mut b = QueryBuilder::new();
    let spec = request.goal.spec();
    let jump = spec
        .jump
        .map(|label| format!("-->(:{label})"))
        .unwrap_or_default();
    let two = request.subset_2.is_some();
    let carry_2 = if two { "count_subset_articles_2, subset_list_2, " } else { "" };
    let norm = if request.normalize_by_age {
        " / (toFloat(entity.age_in_days) / 365)"
    } else {
        ""
    };

    let all_conditions: Vec<String> = request
        .article_filter
        .iter()
        .map(|cond| cond.render("b", &mut b))
        .collect();
    b.push("MATCH (b:Article)");
    if !all_conditions.is_empty() {
        b.push(&format!(" WHERE {}", all_conditions.join(" AND ")));
    }
    b.line("");
    b.line("WITH count(b) AS count_articles");

    subset_clause(&mut b, 1, &request.subset_1, &request.article_filter);
    b.line(
        "WITH count_articles, count(DISTINCT subset_articles_1) AS count_subset_articles_1, \
collect(DISTINCT subset_articles_1) AS subset_list_1",
    );
    if let Some(subset_2) = &request.subset_2 {
        subset_clause(&mut b, 2, subset_2, &request.article_filter);
        b.line(
            "WITH count_articles, count_subset_articles_1, subset_list_1, \
count(DISTINCT subset_articles_2) AS count_subset_articles_2, \
collect(DISTINCT subset_articles_2) AS subset_list_2",
        );
    }

    let mut goal_conditions = Vec::new();
    if let Some(cond) = &request.goal_filter {
        goal_conditions.push(cond.render("entity", &mut b));
    }
    for cond in &request.article_filter {
        goal_conditions.push(cond.render("a", &mut b));
    }
    if request.normalize_by_age {
        goal_conditions.push("entity.age_in_days > 0".to_string());
    }
    b.push(&format!("MATCH (entity:{}){jump}<--(a:Article)", spec.label));
    if !goal_conditions.is_empty() {
        b.push(&format!(" WHERE {}", goal_conditions.join(" AND ")));
    }
    b.line("");
    let min = b.bind_named("min_mentions", request.min_mentions);
    b.line(&format!(
        "WITH count_articles, count_subset_articles_1, subset_list_1, {carry_2}entity, \
count(DISTINCT a) AS absolute_mentions, toFloat(count(DISTINCT a)) / count_articles AS expected_mentions"
    ));
    b.line(&format!("WHERE absolute_mentions > {min}"));

    b.line(&format!(
        "MATCH (entity){jump}<--(mentions_subset_1:Article) WHERE mentions_subset_1 IN subset_list_1"
    ));
    b.line(&format!(
        "WITH entity, absolute_mentions, expected_mentions, {carry_2}\
count(DISTINCT mentions_subset_1) AS absolute_subset_mentions_1, \
toFloat(count(DISTINCT mentions_subset_1)) / count_subset_articles_1 AS relative_subset_mentions_1"
    ));
    b.line(&format!(
        "WITH entity, absolute_mentions, expected_mentions, {carry_2}absolute_subset_mentions_1, \
relative_subset_mentions_1, round(relative_subset_mentions_1 / expected_mentions{norm}, {SCORE_PRECISION}) AS score_1"
    ));

    let score_expr = if two {
        b.line("WHERE score_1 > 0");
        b.line(&format!(
            "MATCH (entity){jump}<--(mentions_subset_2:Article) WHERE mentions_subset_2 IN subset_list_2"
        ));
        b.line(
            "WITH entity, absolute_mentions, expected_mentions, absolute_subset_mentions_1, \
relative_subset_mentions_1, score_1, count_subset_articles_2, \
count(DISTINCT mentions_subset_2) AS absolute_subset_mentions_2",
        );
        b.line(&format!(
            "WITH entity, absolute_mentions, expected_mentions, absolute_subset_mentions_1, \
relative_subset_mentions_1, score_1, absolute_subset_mentions_2, \
toFloat(absolute_subset_mentions_2) / count_subset_articles_2 AS relative_subset_mentions_2, \
round((toFloat(absolute_subset_mentions_2) / count_subset_articles_2) / expected_mentions{norm}, {SCORE_PRECISION}) AS score_2"
        ));
        format!("round(score_2 / score_1, {SCORE_PRECISION})")
    } else {
        "score_1".to_string()
    };

    let mut returns = vec![format!("{score_expr} AS score")];
    returns.extend(
        spec.columns
            .iter()
            .map(|(prop, alias)| format!("entity.{prop} AS {alias}")),
    );
    returns.extend(
        [
            "absolute_mentions",
            "expected_mentions",
            "absolute_subset_mentions_1",
            "relative_subset_mentions_1",
            "score_1",
        ]
        .map(String::from),
    );
    if two {
        returns.extend(
            [
                "absolute_subset_mentions_2",
                "relative_subset_mentions_2",
                "score_2",
            ]
            .map(String::from),
        );
    }
    returns.push("id(entity) AS db_id".into());
    b.line(&format!("RETURN {}", returns.join(", ")));

    let order: Vec<String> = request
        .sort
        .iter()
        .map(|key| {
            format!(
                "{}{}",
                key.column,
                if key.descending { " DESC" } else { " ASC" }
            )
        })
        .collect();
    b.push(&format!("ORDER BY {}", order.join(", ")));
    b.build()
}

/// Ranked enrichment rows in [`result_columns`] order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentTable {
    pub goal: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl EnrichmentTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub async fn run_enrichment(
    store: &dyn GraphStore,
    request: &EnrichmentRequest,
) -> Result<EnrichmentTable, CitegraphError> {
    let query = build_query(request);
    debug!(goal = %request.goal, params = query.params.len(), "running enrichment query");
    let records = store.run(&query).await?;
    let columns = result_columns(request.goal, request.subset_2.is_some());
    let rows = records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|column| record.remove(column).unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    Ok(EnrichmentTable {
        goal: request.goal.to_string(),
        columns,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::RecordingStore;
    use serde_json::json;

    fn lists(labels: &[&str], attrs: &[&str], ops: &[&str], values: &[&str]) -> FilterLists {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        FilterLists {
            labels: owned(labels),
            attributes: owned(attrs),
            operators: owned(ops),
            values: owned(values),
        }
    }

    fn disease_params() -> EnrichmentParams {
        EnrichmentParams {
            goal: Some("gene".into()),
            subset_1: lists(&["disease"], &["label"], &["contains"], &["ALS"]),
            ..EnrichmentParams::default()
        }
    }

    fn query_lines(request: &EnrichmentRequest) -> Vec<String> {
        build_query(request).text.lines().map(str::to_string).collect()
    }

    #[test]
    fn single_subset_query_computes_expected_and_score() {
        let lines = query_lines(&disease_params().validate().unwrap());
        let aggregate = lines
            .iter()
            .position(|l| l.contains("count(DISTINCT a) AS absolute_mentions"))
            .unwrap();
        assert_eq!(
            lines[aggregate],
            "WITH count_articles, count_subset_articles_1, subset_list_1, entity, \
count(DISTINCT a) AS absolute_mentions, toFloat(count(DISTINCT a)) / count_articles AS expected_mentions"
        );
        assert_eq!(lines[aggregate + 1], "WHERE absolute_mentions > $min_mentions");
        assert_eq!(
            lines[aggregate + 3],
            "WITH entity, absolute_mentions, expected_mentions, \
count(DISTINCT mentions_subset_1) AS absolute_subset_mentions_1, \
toFloat(count(DISTINCT mentions_subset_1)) / count_subset_articles_1 AS relative_subset_mentions_1"
        );
        assert_eq!(
            lines[aggregate + 4],
            "WITH entity, absolute_mentions, expected_mentions, absolute_subset_mentions_1, \
relative_subset_mentions_1, round(relative_subset_mentions_1 / expected_mentions, 4) AS score_1"
        );
        assert!(lines[aggregate + 5].starts_with("RETURN score_1 AS score, "));
        assert!(!lines.iter().any(|l| l.contains("age_in_days")));
    }

    #[test]
    fn mention_floor_filters_before_subset_matching() {
        let params = EnrichmentParams {
            min_mentions: Some(25),
            ..disease_params()
        };
        let query = build_query(&params.validate().unwrap());
        assert_eq!(query.params["min_mentions"], json!(25));
        let floor = query.text.find("WHERE absolute_mentions > $min_mentions").unwrap();
        let subset = query.text.find("(mentions_subset_1:Article)").unwrap();
        assert!(floor < subset);
        assert_eq!(query.text.matches("$min_mentions").count(), 1);
    }

    #[test]
    fn two_subsets_report_the_ratio_of_scores() {
        let params = EnrichmentParams {
            subset_2: Some(lists(&["species"], &["name"], &["="], &["9606"])),
            ..disease_params()
        };
        let lines = query_lines(&params.validate().unwrap());
        let guard = lines.iter().position(|l| l == "WHERE score_1 > 0").unwrap();
        assert!(lines[guard - 1].ends_with("round(relative_subset_mentions_1 / expected_mentions, 4) AS score_1"));
        assert!(lines[guard + 3].ends_with(
            "toFloat(absolute_subset_mentions_2) / count_subset_articles_2 AS relative_subset_mentions_2, \
round((toFloat(absolute_subset_mentions_2) / count_subset_articles_2) / expected_mentions, 4) AS score_2"
        ));
        assert!(lines[guard + 4].starts_with("RETURN round(score_2 / score_1, 4) AS score, "));
    }

    #[test]
    fn missing_goal_is_a_client_error() {
        let params = EnrichmentParams {
            goal: None,
            ..disease_params()
        };
        let err = params.validate().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn mismatched_filter_lists_are_rejected() {
        let params = EnrichmentParams {
            subset_1: lists(&["disease", "species"], &["label"], &["contains"], &["ALS"]),
            ..disease_params()
        };
        assert!(matches!(
            params.validate(),
            Err(CitegraphError::InvalidArgument(msg)) if msg.contains("same length")
        ));

        let params = EnrichmentParams {
            article_attributes: vec!["journal".into()],
            ..disease_params()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn operators_and_attributes_are_closed() {
        assert_eq!("  STARTS   with ".parse::<Operator>().unwrap(), Operator::StartsWith);
        assert!("; DROP".parse::<Operator>().is_err());
        assert!(Condition::parse("label) DETACH DELETE (x", "=", Some("a")).is_err());
        assert!(Condition::parse("age_in_days", ">", Some("ten")).is_err());
        assert!(Condition::parse("label", "is null", None).unwrap().value.is_none());
        assert!(Condition::parse("label", "=", None).is_err());
    }

    #[test]
    fn unknown_sort_column_is_rejected() {
        let params = EnrichmentParams {
            sort: Some("score DESC, symbol".into()),
            ..disease_params()
        };
        let request = params.validate().unwrap();
        assert_eq!(request.sort.len(), 2);
        assert!(!request.sort[1].descending);

        let params = EnrichmentParams {
            sort: Some("title".into()),
            ..disease_params()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn query_binds_filter_values_and_uses_jump_nodes() {
        let params = EnrichmentParams {
            goal: Some("pathway_kegg".into()),
            subset_1: lists(&["disease"], &["label"], &["="], &["ALS' OR 1=1"]),
            subset_2: Some(FilterLists::default()),
            article_attributes: vec!["age_in_days".into()],
            article_operators: vec!["<".into()],
            article_values: vec!["3650".into()],
            ..EnrichmentParams::default()
        };
        let request = params.validate().unwrap();
        let query = build_query(&request);
        assert!(!query.text.contains("ALS"));
        assert!(query.params.values().any(|v| v == &json!("als' or 1=1")));
        assert!(query.params.values().any(|v| v == &json!(3650.0)));
        assert!(query.text.contains("MATCH (entity:pathway_kegg)-->(:gene)<--(a:Article)"));
        assert!(query.text.contains("MATCH (subset_articles_2:Article) WHERE subset_articles_2.age_in_days <"));
        assert!(query.text.contains("round(score_2 / score_1, 4) AS score"));
        assert!(query.text.ends_with("ORDER BY score DESC"));
        assert_eq!(query.params["min_mentions"], json!(10));
    }

    #[test]
    fn age_normalization_applies_only_to_articles() {
        let params = EnrichmentParams {
            normalize_by_age: true,
            ..disease_params()
        };
        assert!(!params.validate().unwrap().normalize_by_age);
        let params = EnrichmentParams {
            goal: Some("Article".into()),
            normalize_by_age: true,
            ..disease_params()
        };
        let request = params.validate().unwrap();
        assert!(request.normalize_by_age);
        let query = build_query(&request);
        assert!(query.text.contains(
            "round(relative_subset_mentions_1 / expected_mentions / (toFloat(entity.age_in_days) / 365), 4) AS score_1"
        ));
    }

    #[test]
    fn age_normalized_query_skips_articles_without_positive_age() {
        let params = EnrichmentParams {
            goal: Some("Article".into()),
            normalize_by_age: true,
            ..disease_params()
        };
        let lines = query_lines(&params.validate().unwrap());
        let goal = lines
            .iter()
            .find(|l| l.starts_with("MATCH (entity:Article)<--(a:Article)"))
            .unwrap();
        assert!(goal.ends_with("WHERE entity.age_in_days > 0"), "{goal}");

        let plain = EnrichmentParams {
            goal: Some("Article".into()),
            ..disease_params()
        };
        let lines = query_lines(&plain.validate().unwrap());
        assert!(!lines.iter().any(|l| l.contains("age_in_days > 0")));
    }

    #[tokio::test]
    async fn records_are_projected_onto_result_columns() {
        let store = RecordingStore::default();
        let mut record = crate::graph::Record::new();
        record.insert("score".into(), json!(5.0));
        record.insert("symbol".into(), json!("TP53"));
        store.responses.lock().unwrap().push(vec![record]);

        let request = disease_params().validate().unwrap();
        let table = run_enrichment(&store, &request).await.unwrap();
        assert_eq!(table.columns, result_columns(GoalClass::Gene, false));
        assert_eq!(table.rows[0][0], json!(5.0));
        let symbol = table.columns.iter().position(|c| c == "symbol").unwrap();
        assert_eq!(table.rows[0][symbol], json!("TP53"));
        assert_eq!(table.rows[0][1], Value::Null);
    }

    #[test]
    fn every_goal_class_round_trips_through_its_name() {
        for spec in GOALS {
            assert_eq!(spec.name.parse::<GoalClass>().unwrap(), spec.class);
            assert_eq!(spec.class.spec().label, spec.label);
        }
    }
}
