pub mod article;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CitegraphError;

/// Named-entity classes extracted from article text by the annotation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    Gene,
    Disease,
    Chemical,
    Species,
    Mutation,
    #[serde(rename = "cellline")]
    CellLine,
}

impl EntityClass {
    pub const ALL: [EntityClass; 6] = [
        EntityClass::Gene,
        EntityClass::Disease,
        EntityClass::Chemical,
        EntityClass::Species,
        EntityClass::Mutation,
        EntityClass::CellLine,
    ];

    /// Config and graph-label spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gene => "gene",
            Self::Disease => "disease",
            Self::Chemical => "chemical",
            Self::Species => "species",
            Self::Mutation => "mutation",
            Self::CellLine => "cellline",
        }
    }

    /// Map a concept type as written in annotation exports.
    pub fn from_concept(concept: &str) -> Option<Self> {
        match concept.trim().to_ascii_lowercase().as_str() {
            "gene" => Some(Self::Gene),
            "disease" => Some(Self::Disease),
            "chemical" => Some(Self::Chemical),
            "species" => Some(Self::Species),
            "mutation" | "variant" | "dnamutation" | "proteinmutation" | "snp" => {
                Some(Self::Mutation)
            }
            "cellline" => Some(Self::CellLine),
            _ => None,
        }
    }

    /// Parse a comma-separated class list, keeping the caller's order and dropping repeats.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, CitegraphError> {
        let mut out: Vec<Self> = Vec::new();
        for token in value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
            let class = token.parse::<Self>()?;
            if !out.contains(&class) {
                out.push(class);
            }
        }
        Ok(out)
    }
}

impl FromStr for EntityClass {
    type Err = CitegraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "");
        match normalized.as_str() {
            "gene" | "genes" => Ok(Self::Gene),
            "disease" | "diseases" => Ok(Self::Disease),
            "chemical" | "chemicals" => Ok(Self::Chemical),
            "species" => Ok(Self::Species),
            "mutation" | "mutations" => Ok(Self::Mutation),
            "cellline" | "celllines" => Ok(Self::CellLine),
            _ => Err(CitegraphError::InvalidArgument(format!(
                "Unknown entity class '{}'. Expected one of: gene, disease, chemical, species, mutation, cellline",
                s.trim()
            ))),
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
