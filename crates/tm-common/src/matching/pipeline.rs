use std::sync::Arc;
use std::time::Instant;

use futures_util::{StreamExt, TryStreamExt, stream};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::PipelineConfig;
use super::ranking::{RankedResult, RankingError, rank_candidates};
use crate::embedding::{Embedding, EmbeddingError, TextEmbedder};
use crate::profile::{ProfileDescription, ProfileError, ProfileText};

/// ランキング対象になれるレコード
pub trait Candidate {
    fn profile(&self) -> &ProfileDescription;
}

impl Candidate for ProfileDescription {
    fn profile(&self) -> &ProfileDescription {
        self
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid reference profile: {0}")]
    InvalidReference(ProfileError),
    #[error("invalid candidate profile at index {index}: {source}")]
    InvalidCandidate { index: usize, source: ProfileError },
    #[error("too many candidates: {count} (max {max})")]
    TooManyCandidates { count: usize, max: usize },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Ranking(#[from] RankingError),
}

impl MatchError {
    /// 候補インデックスを呼び出し側の番号に付け替える（フィルタ前の位置など）
    pub fn map_candidate_index(self, f: impl Fn(usize) -> usize) -> Self {
        match self {
            MatchError::InvalidCandidate { index, source } => MatchError::InvalidCandidate {
                index: f(index),
                source,
            },
            MatchError::Ranking(RankingError::DimensionMismatch {
                index,
                expected,
                actual,
            }) => MatchError::Ranking(RankingError::DimensionMismatch {
                index: f(index),
                expected,
                actual,
            }),
            other => other,
        }
    }
}

/// 埋め込み → 類似度 → 上位 K 件 のパイプライン
///
/// 埋め込み呼び出しは `max_concurrency` 件まで並行に投げる。結果は入力順に
/// 揃えてからスコアで並べるため、応答の到着順はランキングに影響しない。
/// 1 件でも失敗すれば全体を失敗させ、残りの呼び出しは future ごと破棄される。
pub struct MatchingPipeline {
    embedder: Arc<dyn TextEmbedder>,
    config: PipelineConfig,
}

impl MatchingPipeline {
    pub fn new(embedder: Arc<dyn TextEmbedder>, config: PipelineConfig) -> Self {
        let mut config = config;
        config.max_concurrency = config.max_concurrency.max(1);
        Self { embedder, config }
    }

    pub fn embedder(&self) -> &dyn TextEmbedder {
        self.embedder.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// プロフィール記述から ProfileText を組み立ててランキングする
    pub async fn match_candidates<C>(
        &self,
        reference: &ProfileDescription,
        candidates: Vec<C>,
        top_k: usize,
    ) -> Result<RankedResult<C>, MatchError>
    where
        C: Candidate + Send,
    {
        let reference_text = reference
            .to_profile_text()
            .map_err(MatchError::InvalidReference)?;

        let mut prepared = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            let text = candidate
                .profile()
                .to_profile_text()
                .map_err(|source| MatchError::InvalidCandidate { index, source })?;
            prepared.push((candidate, text));
        }

        self.rank(&reference_text, prepared, top_k).await
    }

    pub async fn rank<C>(
        &self,
        reference: &ProfileText,
        candidates: Vec<(C, ProfileText)>,
        top_k: usize,
    ) -> Result<RankedResult<C>, MatchError>
    where
        C: Send,
    {
        if candidates.len() > self.config.max_candidates {
            return Err(MatchError::TooManyCandidates {
                count: candidates.len(),
                max: self.config.max_candidates,
            });
        }

        let started = Instant::now();
        let candidate_count = candidates.len();
        let (records, texts): (Vec<C>, Vec<ProfileText>) = candidates.into_iter().unzip();

        // リファレンスも同じストリームに流して、同時実行数の上限を共有する
        let inputs: Vec<&ProfileText> = std::iter::once(reference).chain(texts.iter()).collect();
        // future を先に作っておく（クロージャを stream に持たせると Send 境界を満たせない）
        let calls: Vec<_> = inputs
            .into_iter()
            .map(|text| self.embed_with_retry(text))
            .collect();
        let mut embeddings: Vec<Embedding> = stream::iter(calls)
            .buffered(self.config.max_concurrency)
            .try_collect()
            .await?;

        let reference_embedding = embeddings.remove(0);
        debug!(
            embedder = self.embedder.name(),
            dimension = reference_embedding.dimension(),
            candidates = candidate_count,
            "embeddings ready"
        );

        let result = rank_candidates(
            &reference_embedding,
            records.into_iter().zip(embeddings).collect(),
            top_k,
        )?;

        info!(
            embedder = self.embedder.name(),
            model = self.embedder.model(),
            candidates = candidate_count,
            scored = result.scored_count,
            excluded = result.excluded.len(),
            returned = result.ranked.len(),
            top_k,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ranking completed"
        );

        Ok(result)
    }

    /// 1 テキスト分の埋め込み。呼び出しごとにタイムアウトを掛け、一時的な失敗は再試行する。
    async fn embed_with_retry(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError> {
        let retry = self.config.retry;
        let mut attempt = 0u32;

        loop {
            let result =
                match tokio::time::timeout(self.config.call_timeout, self.embedder.embed(text))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EmbeddingError::Timeout(self.config.call_timeout)),
                };

            match result {
                Ok(embedding) => return Ok(embedding),
                Err(err) if err.is_transient() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    warn!(
                        embedder = self.embedder.name(),
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient embedding failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        embedder = self.embedder.name(),
                        attempts = attempt + 1,
                        error = %err,
                        "embedding failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::matching::config::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// テキストごとに固定ベクトルと遅延を返すテスト用 Embedder
    #[derive(Default)]
    struct ScriptedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        delays: HashMap<String, Duration>,
        failures_before_success: Mutex<HashMap<String, usize>>,
        failure: Option<fn() -> EmbeddingError>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedEmbedder {
        fn with(mut self, text: &ProfileText, vector: Vec<f32>) -> Self {
            self.vectors.insert(text.as_str().to_string(), vector);
            self
        }

        fn delayed(mut self, text: &ProfileText, delay: Duration) -> Self {
            self.delays.insert(text.as_str().to_string(), delay);
            self
        }

        fn failing(
            mut self,
            text: &ProfileText,
            times: usize,
            error: fn() -> EmbeddingError,
        ) -> Self {
            self.failures_before_success
                .get_mut()
                .unwrap()
                .insert(text.as_str().to_string(), times);
            self.failure = Some(error);
            self
        }
    }

    #[async_trait]
    impl TextEmbedder for ScriptedEmbedder {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-v1"
        }

        async fn embed(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = self
                .delays
                .get(text.as_str())
                .copied()
                .unwrap_or(Duration::from_millis(5));
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            {
                let mut failures = self.failures_before_success.lock().unwrap();
                if let Some(remaining) = failures.get_mut(text.as_str()) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err((self.failure.unwrap())());
                    }
                }
            }

            self.vectors
                .get(text.as_str())
                .cloned()
                .map(Embedding::new)
                .ok_or_else(|| EmbeddingError::Malformed("unscripted text".into()))
        }
    }

    fn text(description: &str) -> ProfileText {
        ProfileText::compose(description, "", &[]).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
            },
            ..PipelineConfig::default()
        }
    }

    fn unavailable() -> EmbeddingError {
        EmbeddingError::Status {
            status: 503,
            body: "loading".into(),
        }
    }

    fn bad_request() -> EmbeddingError {
        EmbeddingError::Status {
            status: 400,
            body: "bad input".into(),
        }
    }

    #[tokio::test]
    async fn ranking_ignores_response_arrival_order() {
        let student = text("student");
        let (a, b, c) = (text("a"), text("b"), text("c"));
        // 高スコアの候補ほど遅く返ってくる
        let embedder = ScriptedEmbedder::default()
            .with(&student, vec![1.0, 0.0])
            .with(&a, vec![0.9, 0.1])
            .with(&b, vec![0.5, 0.5])
            .with(&c, vec![0.1, 0.9])
            .delayed(&a, Duration::from_millis(60))
            .delayed(&b, Duration::from_millis(30))
            .delayed(&c, Duration::from_millis(1));
        let pipeline = MatchingPipeline::new(Arc::new(embedder), config());

        let result = pipeline
            .rank(&student, vec![("c", c), ("b", b), ("a", a)], 3)
            .await
            .unwrap();

        let names: Vec<_> = result.ranked.iter().map(|r| r.candidate).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn in_flight_calls_respect_concurrency_limit() {
        let student = text("student");
        let mut embedder = ScriptedEmbedder::default().with(&student, vec![1.0, 0.0]);
        let mut candidates = Vec::new();
        for i in 0..12 {
            let t = text(&format!("tutor {i}"));
            embedder = embedder
                .with(&t, vec![1.0, i as f32])
                .delayed(&t, Duration::from_millis(10));
            candidates.push((i, t));
        }
        let embedder = Arc::new(embedder);
        let pipeline = MatchingPipeline::new(
            embedder.clone(),
            PipelineConfig {
                max_concurrency: 3,
                ..config()
            },
        );

        let result = pipeline.rank(&student, candidates, 3).await.unwrap();

        assert_eq!(result.ranked.len(), 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 13);
        assert!(embedder.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let student = text("student");
        let tutor = text("tutor");
        let embedder = Arc::new(
            ScriptedEmbedder::default()
                .with(&student, vec![1.0, 0.0])
                .with(&tutor, vec![1.0, 1.0])
                .failing(&tutor, 2, unavailable),
        );
        let pipeline = MatchingPipeline::new(embedder.clone(), config());

        let result = pipeline.rank(&student, vec![("t", tutor)], 3).await.unwrap();

        assert_eq!(result.ranked.len(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let student = text("student");
        let tutor = text("tutor");
        let embedder = Arc::new(
            ScriptedEmbedder::default()
                .with(&student, vec![1.0, 0.0])
                .with(&tutor, vec![1.0, 1.0])
                .failing(&tutor, 5, unavailable),
        );
        let pipeline = MatchingPipeline::new(embedder.clone(), config());

        let err = pipeline
            .rank(&student, vec![("t", tutor)], 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MatchError::Embedding(EmbeddingError::Status { status: 503, .. })
        ));
        // student 1 回 + tutor (1 + 2 retries)
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let student = text("student");
        let tutor = text("tutor");
        let embedder = Arc::new(
            ScriptedEmbedder::default()
                .with(&student, vec![1.0, 0.0])
                .with(&tutor, vec![1.0, 1.0])
                .failing(&tutor, 1, bad_request),
        );
        let pipeline = MatchingPipeline::new(embedder.clone(), config());

        let err = pipeline
            .rank(&student, vec![("t", tutor)], 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MatchError::Embedding(EmbeddingError::Status { status: 400, .. })
        ));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let student = text("student");
        let tutor = text("tutor");
        let embedder = ScriptedEmbedder::default()
            .with(&student, vec![1.0, 0.0])
            .with(&tutor, vec![1.0, 1.0])
            .delayed(&tutor, Duration::from_secs(5));
        let pipeline = MatchingPipeline::new(
            Arc::new(embedder),
            PipelineConfig {
                call_timeout: Duration::from_millis(20),
                retry: RetryPolicy::none(),
                ..PipelineConfig::default()
            },
        );

        let err = pipeline
            .rank(&student, vec![("t", tutor)], 3)
            .await
            .unwrap_err();

        assert!(matches!(err, MatchError::Embedding(EmbeddingError::Timeout(_))));
    }

    #[tokio::test]
    async fn zero_vector_candidate_is_reported_as_excluded() {
        let student = text("student");
        let (good, zero) = (text("good"), text("zero"));
        let embedder = ScriptedEmbedder::default()
            .with(&student, vec![1.0, 0.0])
            .with(&good, vec![1.0, 0.2])
            .with(&zero, vec![0.0, 0.0]);
        let pipeline = MatchingPipeline::new(Arc::new(embedder), config());

        let result = pipeline
            .rank(&student, vec![("zero", zero), ("good", good)], 3)
            .await
            .unwrap();

        assert_eq!(result.ranked.len(), 1);
        assert_eq!(result.ranked[0].candidate, "good");
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].candidate, "zero");
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_the_request() {
        let student = text("student");
        let tutor = text("tutor");
        let embedder = ScriptedEmbedder::default()
            .with(&student, vec![1.0, 0.0])
            .with(&tutor, vec![1.0, 0.0, 0.0]);
        let pipeline = MatchingPipeline::new(Arc::new(embedder), config());

        let err = pipeline
            .rank(&student, vec![("t", tutor)], 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MatchError::Ranking(RankingError::DimensionMismatch { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_requests_before_embedding() {
        let embedder = Arc::new(ScriptedEmbedder::default());
        let pipeline = MatchingPipeline::new(
            embedder.clone(),
            PipelineConfig {
                max_candidates: 1,
                ..config()
            },
        );

        let err = pipeline
            .rank(&text("s"), vec![(1, text("a")), (2, text("b"))], 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MatchError::TooManyCandidates { count: 2, max: 1 }
        ));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_candidate_profile_is_rejected() {
        let pipeline = MatchingPipeline::new(Arc::new(HashEmbedder::new(64)), config());
        let reference = ProfileDescription::new("calculus", "", Vec::<String>::new());
        let candidates = vec![
            ProfileDescription::new("algebra", "", Vec::<String>::new()),
            ProfileDescription::default(),
        ];

        let err = pipeline
            .match_candidates(&reference, candidates, 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MatchError::InvalidCandidate {
                index: 1,
                source: ProfileError::Empty
            }
        ));
    }

    #[tokio::test]
    async fn embeddings_of_identical_text_share_dimension() {
        let embedder = HashEmbedder::new(384);
        let input = text("calculus help");

        let first = embedder.embed(&input).await.unwrap();
        let second = embedder.embed(&input).await.unwrap();

        assert_eq!(first.dimension(), second.dimension());
    }

    #[tokio::test]
    async fn calculus_candidates_outrank_chemistry() {
        let pipeline = MatchingPipeline::new(Arc::new(HashEmbedder::new(1024)), config());
        let student =
            ProfileDescription::new("calculus help", "patient tutor", ["calculus", "algebra"]);
        let candidates = vec![
            ProfileDescription::new("calculus tutoring", "patient tutor", ["calculus"]),
            ProfileDescription::new(
                "organic chemistry",
                "lab instructor",
                ["chemistry", "biology"],
            ),
            ProfileDescription::new(
                "calculus and physics",
                "physics tutor",
                ["calculus", "physics"],
            ),
        ];

        let result = pipeline
            .match_candidates(&student, candidates, 3)
            .await
            .unwrap();

        assert_eq!(result.ranked.len(), 3);
        assert_eq!(result.ranked[2].candidate.description, "organic chemistry");
    }

    #[tokio::test]
    async fn matching_future_can_be_spawned() {
        let pipeline = Arc::new(MatchingPipeline::new(
            Arc::new(HashEmbedder::new(64)),
            config(),
        ));
        let student = ProfileDescription::new("calculus help", "", ["calculus"]);
        let tutors = vec![
            ProfileDescription::new("calculus tutoring", "", ["calculus"]),
            ProfileDescription::new("essay writing", "", ["english"]),
        ];

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.match_candidates(&student, tutors, 1).await })
        };
        let result = task.await.unwrap().unwrap();

        assert_eq!(result.ranked.len(), 1);
        assert_eq!(result.ranked[0].candidate.description, "calculus tutoring");
    }

    #[test]
    fn candidate_indices_can_be_remapped() {
        let positions = [3, 7];

        let invalid = MatchError::InvalidCandidate {
            index: 1,
            source: ProfileError::Empty,
        }
        .map_candidate_index(|index| positions[index]);
        let mismatch = MatchError::Ranking(RankingError::DimensionMismatch {
            index: 0,
            expected: 2,
            actual: 3,
        })
        .map_candidate_index(|index| positions[index]);

        assert!(matches!(invalid, MatchError::InvalidCandidate { index: 7, .. }));
        assert!(matches!(
            mismatch,
            MatchError::Ranking(RankingError::DimensionMismatch { index: 3, .. })
        ));
    }
}
