//! Citation-and-entity knowledge graph builder for PubMed literature.
//!
//! The crawl pipeline resolves identifiers for a query, fetches summaries and entity
//! annotations, assembles citation edges and bulk-loads them into a graph store. The
//! enrichment queries then rank entities over-represented in chosen article subsets.

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod render;
pub mod sources;
pub mod transform;
pub mod utils;
