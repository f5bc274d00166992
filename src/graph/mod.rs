//! Graph store access: parametrized queries, the store trait, and the query sets built on it.

pub mod curation;
pub mod enrichment;
pub mod load;
pub mod neo4j;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::CitegraphError;

/// One result row keyed by column name.
pub type Record = Map<String, Value>;

/// Query text plus the values bound to its `$name` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub params: Map<String, Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Map::new(),
        }
    }

    /// `CALL name($a0, $a1, ...)` for an externally provided procedure.
    pub fn procedure(name: &str, args: Vec<Value>, yields: Option<&str>) -> Result<Self, CitegraphError> {
        if !procedure_name_re().is_match(name) {
            return Err(CitegraphError::InvalidArgument(format!(
                "Invalid procedure name '{name}'"
            )));
        }
        let mut builder = QueryBuilder::new();
        let placeholders: Vec<String> = args.into_iter().map(|arg| builder.bind(arg)).collect();
        builder.push(&format!("CALL {name}({})", placeholders.join(", ")));
        if let Some(yields) = yields {
            builder.push(&format!(" YIELD {}", checked_identifier_list(yields)?));
        }
        Ok(builder.build())
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

fn procedure_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("valid regex")
    })
}

/// Property names and labels cannot be bound as parameters, so they must be plain identifiers.
pub fn checked_identifier(name: &str) -> Result<&str, CitegraphError> {
    let name = name.trim();
    if identifier_re().is_match(name) {
        Ok(name)
    } else {
        Err(CitegraphError::InvalidArgument(format!(
            "'{name}' is not a valid attribute name"
        )))
    }
}

fn checked_identifier_list(list: &str) -> Result<String, CitegraphError> {
    let names = list
        .split(',')
        .map(checked_identifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.join(", "))
}

/// Accumulates query text and binds caller values as parameters.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    text: String,
    params: Map<String, Value>,
    next: usize,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.text.push_str(fragment);
        self
    }

    pub fn line(&mut self, fragment: &str) -> &mut Self {
        self.text.push_str(fragment);
        self.text.push('\n');
        self
    }

    /// Bind a value under a fresh name and return its placeholder.
    pub fn bind(&mut self, value: impl Into<Value>) -> String {
        let name = format!("p{}", self.next);
        self.next += 1;
        self.params.insert(name.clone(), value.into());
        format!("${name}")
    }

    /// Bind under a caller-chosen name; rebinding replaces the value.
    pub fn bind_named(&mut self, name: &str, value: impl Into<Value>) -> String {
        self.params.insert(name.to_string(), value.into());
        format!("${name}")
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn build(self) -> Query {
        Query {
            text: self.text,
            params: self.params,
        }
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn run(&self, query: &Query) -> Result<Vec<Record>, CitegraphError>;

    async fn run_all(&self, queries: &[Query]) -> Result<(), CitegraphError> {
        for query in queries {
            self.run(query).await?;
        }
        Ok(())
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_binds_values_instead_of_inlining_them() {
        let mut b = QueryBuilder::new();
        let p = b.bind("x' OR 1=1 //");
        b.push(&format!("MATCH (n) WHERE n.name = {p} RETURN n"));
        let q = b.build();
        assert_eq!(q.text, "MATCH (n) WHERE n.name = $p0 RETURN n");
        assert_eq!(q.params["p0"], json!("x' OR 1=1 //"));
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(checked_identifier("age_in_days").is_ok());
        assert!(checked_identifier("name").is_ok());
        assert!(checked_identifier("name) DETACH DELETE n //").is_err());
        assert!(checked_identifier("1abc").is_err());
        assert!(checked_identifier("").is_err());
    }

    #[test]
    fn procedure_calls_bind_arguments() {
        let q = Query::procedure("gds.graph.drop", vec![json!("articles"), json!(false)], None).unwrap();
        assert_eq!(q.text, "CALL gds.graph.drop($p0, $p1)");
        assert_eq!(q.params["p1"], json!(false));
        let q = Query::procedure("db.ping", Vec::new(), Some("success")).unwrap();
        assert_eq!(q.text, "CALL db.ping() YIELD success");
        assert!(Query::procedure("gds.x; MATCH (n) DELETE n", Vec::new(), None).is_err());
    }

    #[test]
    fn numeric_values_accept_strings() {
        assert_eq!(value_as_f64(&json!("2.5")), Some(2.5));
        assert_eq!(value_as_u64(&json!(7)), Some(7));
        assert_eq!(value_as_u64(&json!(null)), None);
    }
}
