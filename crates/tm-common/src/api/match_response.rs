use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::match_request::RequestTutor;
use crate::matching::{RankedResult, ScoredCandidate};

/// `{...元のチューターレコード, "score": 0.87}`
pub type MatchedTutor = ScoredCandidate<RequestTutor>;

/// 類似度が定義できず結果から外したチューター
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedTutor {
    /// リクエストの tutors 配列での位置
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub reason: String,
}

/// POST /api/match-tutors のレスポンス
#[derive(Debug, Clone, Serialize)]
pub struct MatchTutorsResponse {
    /// スコア降順の上位 K 件（空配列 = マッチなし）
    #[serde(rename = "topTutors")]
    pub top_tutors: Vec<MatchedTutor>,
    pub excluded: Vec<ExcludedTutor>,
    pub embedder: String,
    pub model: String,
    pub matched_at: DateTime<Utc>,
}

impl MatchTutorsResponse {
    pub fn from_ranked(
        result: RankedResult<RequestTutor>,
        embedder: &str,
        model: &str,
        matched_at: DateTime<Utc>,
    ) -> Self {
        let excluded = result
            .excluded
            .into_iter()
            .map(|excluded| ExcludedTutor {
                index: excluded.candidate.position,
                id: excluded.candidate.record.id().cloned(),
                reason: excluded.reason.to_string(),
            })
            .collect();

        Self {
            top_tutors: result.ranked,
            excluded,
            embedder: embedder.to_string(),
            model: model.to_string(),
            matched_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::match_request::TutorRecord;
    use crate::matching::{ExcludedCandidate, SimilarityError};
    use crate::profile::ProfileDescription;
    use serde_json::json;

    fn tutor(position: usize, id: &str, description: &str) -> RequestTutor {
        RequestTutor {
            position,
            record: TutorRecord::new(ProfileDescription::new(
                description,
                "",
                Vec::<String>::new(),
            ))
            .with_field("id", json!(id)),
        }
    }

    #[test]
    fn serializes_top_tutors_with_original_fields_and_score() {
        let result = RankedResult {
            ranked: vec![ScoredCandidate {
                candidate: tutor(2, "ada", "calculus"),
                score: 0.5,
            }],
            excluded: vec![ExcludedCandidate {
                index: 0,
                candidate: tutor(4, "bob", "chemistry"),
                reason: SimilarityError::ZeroMagnitude,
            }],
            scored_count: 1,
        };
        let matched_at = DateTime::parse_from_rfc3339("2026-10-19T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let response =
            MatchTutorsResponse::from_ranked(result, "hash", "feature-hash-v1", matched_at);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(
            json["topTutors"],
            json!([{
                "id": "ada",
                "description": "calculus",
                "profile": "",
                "skills": [],
                "score": 0.5
            }])
        );
        assert_eq!(json["excluded"][0]["index"], 4);
        assert_eq!(json["excluded"][0]["id"], "bob");
        assert_eq!(json["embedder"], "hash");
        assert_eq!(json["matched_at"], "2026-10-19T00:00:00Z");
    }
}
