use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use siphasher::sip::SipHasher13;

use super::{Embedding, EmbeddingError, TextEmbedder};
use crate::profile::ProfileText;

/// 固定 seed（決定論的 hash のため）
/// ⚠️ この値を変更すると全 embedding が変わる
const HASH_SEED_K0: u64 = 0x0123_4567_89ab_cdef;
const HASH_SEED_K1: u64 = 0xfedc_ba98_7654_3210;

pub const DEFAULT_DIMENSION: usize = 256;

/// Feature Hashing を用いた決定論的 Embedder
///
/// - 外部呼び出しなし（ローカル開発・テスト用）
/// - 高速（O(n) where n = token count）
/// - SipHash13 + 固定 seed で Rust バージョン間の安定性を保証
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn hash_token(&self, token: &str) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_SEED_K0, HASH_SEED_K1);
        token.hash(&mut hasher);
        hasher.finish()
    }

    /// トークン列を埋め込みベクトルに変換
    pub fn embed_tokens<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in tokens {
            let idx = (self.hash_token(token) % self.dimension as u64) as usize;
            // Sign hashing: 偶数ハッシュ → +1, 奇数ハッシュ → -1
            let sign = if self.hash_token(&format!("{token}_sign")) % 2 == 0 {
                1.0
            } else {
                -1.0
            };
            vector[idx] += sign;
        }

        // L2正規化
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

/// 英数字以外で区切り、小文字化したトークン列
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

#[async_trait]
impl TextEmbedder for HashEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn model(&self) -> &str {
        // トークン設計やハッシュ関数が変わったらバージョンを上げる
        "feature-hash-v1"
    }

    async fn embed(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError> {
        let tokens = tokenize(text.as_str());
        let vector = self.embed_tokens(tokens.iter().map(String::as_str));
        Ok(Embedding::new(vector))
    }
}
