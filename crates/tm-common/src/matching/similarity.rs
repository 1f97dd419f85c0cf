use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimilarityError {
    /// DimensionMismatchError
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// UndefinedSimilarityError: どちらかのベクトルの大きさが 0
    #[error("cosine similarity is undefined for a zero-magnitude vector")]
    ZeroMagnitude,
}

/// コサイン類似度（-1.0〜1.0）
///
/// 次元不一致・ゼロベクトルは 0.0 ではなくエラーとして返す。
/// 内部は f64 で積算し、丸め誤差で範囲外に出た値は [-1, 1] にクランプする。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(SimilarityError::ZeroMagnitude);
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(score.clamp(-1.0, 1.0) as f32)
}

/// ベクトルの大きさが 0 か（ランキング前のリファレンス検査用）
pub fn is_zero_magnitude(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}
