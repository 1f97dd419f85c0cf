use std::cmp::Ordering;

use serde::Serialize;
use tracing::warn;

use super::similarity::{SimilarityError, cosine_similarity, is_zero_magnitude};
use crate::embedding::Embedding;

pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate<C> {
    #[serde(flatten)]
    pub candidate: C,
    pub score: f32,
}

/// 類似度が定義できず除外された候補
#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedCandidate<C> {
    /// 入力順のインデックス
    pub index: usize,
    pub candidate: C,
    pub reason: SimilarityError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult<C> {
    /// スコア降順、top_k 件まで
    pub ranked: Vec<ScoredCandidate<C>>,
    /// ゼロベクトル等で除外した候補（部分的な失敗）
    pub excluded: Vec<ExcludedCandidate<C>>,
    /// スコアが付いた候補数（切り詰め前）
    pub scored_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RankingError {
    #[error("candidate {index}: embedding dimension mismatch (expected {expected}, got {actual})")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("reference embedding has zero magnitude; similarity is undefined for every candidate")]
    ZeroReference,
}

/// 1 本のリファレンスに対して候補をスコアリングし、上位 top_k 件を返す
///
/// - 次元不一致は 1 件でもあればランキング全体を失敗させる
/// - ゼロベクトルの候補は除外して `excluded` に積む（0.0 扱いにはしない）
/// - 同点は入力順を保持する（安定ソート）
pub fn rank_candidates<C>(
    reference: &Embedding,
    candidates: Vec<(C, Embedding)>,
    top_k: usize,
) -> Result<RankedResult<C>, RankingError> {
    if is_zero_magnitude(&reference.vector) {
        return Err(RankingError::ZeroReference);
    }

    // 次元は先に全件検査する（途中まで計算してから失敗しない）
    for (index, (_, embedding)) in candidates.iter().enumerate() {
        if embedding.dimension() != reference.dimension() {
            return Err(RankingError::DimensionMismatch {
                index,
                expected: reference.dimension(),
                actual: embedding.dimension(),
            });
        }
    }

    let mut scored = Vec::with_capacity(candidates.len());
    let mut excluded = Vec::new();

    for (index, (candidate, embedding)) in candidates.into_iter().enumerate() {
        match cosine_similarity(&reference.vector, &embedding.vector) {
            Ok(score) => scored.push(ScoredCandidate { candidate, score }),
            Err(reason) => {
                warn!(index, error = %reason, "candidate excluded from ranking");
                excluded.push(ExcludedCandidate {
                    index,
                    candidate,
                    reason,
                });
            }
        }
    }

    // sort_by は安定ソート → 同点は入力順
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let scored_count = scored.len();
    scored.truncate(top_k);

    Ok(RankedResult {
        ranked: scored,
        excluded,
        scored_count,
    })
}
