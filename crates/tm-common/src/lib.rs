pub mod api;
pub mod credentials;
pub mod embedding;
pub mod logging;
pub mod matching;
pub mod profile;

pub use embedding::{Embedding, EmbeddingError, TextEmbedder, create_embedder};
pub use matching::{
    Candidate, MatchError, MatchingPipeline, PipelineConfig, RankedResult, ScoredCandidate,
};
pub use profile::{ProfileDescription, ProfileError, ProfileText};
