use crate::error::CitegraphError;
use crate::graph::enrichment::{GOALS, GoalClass, NUMERIC_ATTRIBUTES};

const OPERATORS: &[(&str, &str)] = &[
    ("=", "equal (also `==`)"),
    ("<>", "not equal (also `!=`)"),
    ("<, >, <=, >=", "ordering; the only comparisons allowed on numeric attributes"),
    ("starts with", "prefix match"),
    ("ends with", "suffix match"),
    ("contains", "substring match"),
    ("is null", "attribute missing; takes no value"),
    ("is not null", "attribute present; takes no value"),
];

pub fn render(topic: Option<&str>) -> Result<String, CitegraphError> {
    match topic.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(list_all()),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "goal" | "goals" | "classes" => Ok(list_goals()),
            "operator" | "operators" => Ok(list_operators()),
            "config" => Ok(list_config()),
            other => match other.parse::<GoalClass>() {
                Ok(goal) => Ok(list_goal(goal)),
                Err(_) => Err(CitegraphError::InvalidArgument(format!(
                    "Unknown topic: {other}\n\nValid topics:\n- goal\n- operators\n- config\n- any goal class (see `citegraph list goal`)"
                ))),
            },
        },
    }
}

fn list_all() -> String {
    r#"# citegraph

## Commands

- `resolve [QUERY]` - collect PubMed identifiers for the configured or given query
- `metadata <PMIDS>` - summaries and entity annotations for comma-separated PMIDs
- `assemble <PMID>` - citation edge rows for one article
- `crawl` - resolve, fetch, assemble and load the whole query into the graph
- `enrich --goal <class> --labels ... --attributes ... --operators ... --values ...` - rank entities over-represented in a subset
- `health` - check upstream services, the graph store and the data directory
- `list [goal|operators|config|<class>]` - this reference

## Global flags

- `--config <FILE>` - TOML configuration (default `citegraph.toml`)
- `--json` - JSON output instead of Markdown
- `--verbose` - debug logging on stderr
"#
    .to_string()
}

fn list_goals() -> String {
    let mut out = String::from("# Goal classes\n\n| Class | Label | Reached through | Columns |\n|---|---|---|---|\n");
    for spec in GOALS {
        let columns = spec
            .columns
            .iter()
            .map(|(_, alias)| *alias)
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "| {} | {} | {} | {columns} |\n",
            spec.name,
            spec.label,
            spec.jump.unwrap_or("-")
        ));
    }
    out.push_str("\nClasses with a \"reached through\" node are counted via that node's mentions.\n");
    out
}

fn list_goal(goal: GoalClass) -> String {
    let spec = goal.spec();
    let mut out = format!("# {}\n\nGraph label: `{}`\n", spec.name, spec.label);
    if let Some(jump) = spec.jump {
        out.push_str(&format!("Reached through: `{jump}` nodes\n"));
    }
    out.push_str("\n## Columns\n\n");
    for (property, alias) in spec.columns {
        if property == alias {
            out.push_str(&format!("- `{alias}`\n"));
        } else {
            out.push_str(&format!("- `{alias}` (property `{property}`)\n"));
        }
    }
    if goal == GoalClass::Article {
        out.push_str(&format!(
            "\nNumeric attributes: {}\nUse `--normalize-by-age` to divide article scores by age in days.\n",
            NUMERIC_ATTRIBUTES.join(", ")
        ));
    }
    out
}

fn list_operators() -> String {
    let mut out = String::from("# Filter operators\n\n");
    for (op, meaning) in OPERATORS {
        out.push_str(&format!("- `{op}` - {meaning}\n"));
    }
    out.push_str("\nText comparisons ignore case. Values are always passed as query parameters.\n");
    out
}

fn list_config() -> String {
    r#"# Configuration

Sections of `citegraph.toml`:

- `[general]` - `project_name`
- `[search]` - `query`, `retmax`, `page_ceiling`, `min_date`, `max_date` (YYYY/MM/DD)
- `[filter]` - `filter_terms`, `additional_keywords`, `bioconcepts`
- `[run]` - batching, retries, pacing, `test_mode`, `refresh_old_articles`, `data_dir`
- `[services]` - `eutils_base`, `pubtator_base`, `tool`, `email`
- `[graph]` - `url`, `database`, `user`, `password`, `import_file_url`

## Environment

- `CITEGRAPH_GRAPH_URL`, `CITEGRAPH_GRAPH_PASSWORD` - override the `[graph]` values
- `CITEGRAPH_EUTILS_BASE`, `CITEGRAPH_PUBTATOR_BASE` - override service base URLs
- `RUST_LOG` - log filter (default `citegraph=info`)
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::render;

    #[test]
    fn root_lists_every_command() {
        let out = render(None).unwrap();
        for cmd in ["resolve", "metadata", "assemble", "crawl", "enrich", "health"] {
            assert!(out.contains(&format!("- `{cmd}")), "missing {cmd}");
        }
    }

    #[test]
    fn goal_table_shows_jump_nodes() {
        let out = render(Some("goal")).unwrap();
        assert!(out.contains("| article | Article | - |"));
        assert!(out.lines().any(|l| l.starts_with("| drug |") && l.contains("| gene |")));
    }

    #[test]
    fn single_goal_page_lists_aliases() {
        let out = render(Some("Article")).unwrap();
        assert!(out.contains("- `pubmed_id` (property `name`)"));
        assert!(out.contains("age_in_days, age_in_months, article_rank"));
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = render(Some("protein-structure")).unwrap_err();
        assert!(err.to_string().contains("Valid topics"));
    }
}
