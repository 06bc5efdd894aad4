// Pipeline processing: candidate assembly, ranking, and enrichment

pub mod candidate;
pub mod enrich;
pub mod ranker;

pub use candidate::{assemble, AssemblyStats, CandidateRecord};
pub use enrich::{EnrichReport, Enricher, EnrichmentPatch, EnrichmentSettings};
