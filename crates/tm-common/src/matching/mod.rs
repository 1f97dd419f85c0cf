pub mod config;
pub mod pipeline;
pub mod ranking;
pub mod similarity;

pub use config::{MAX_TOP_K, PipelineConfig, PipelineConfigError, RetryPolicy};
pub use pipeline::{Candidate, MatchError, MatchingPipeline};
pub use ranking::{
    DEFAULT_TOP_K, ExcludedCandidate, RankedResult, RankingError, ScoredCandidate,
    rank_candidates,
};
pub use similarity::{SimilarityError, cosine_similarity};
