use axum::{Json, extract::State, extract::rejection::JsonRejection};
use chrono::Utc;
use tracing::info;

use tm_common::api::{MatchTutorsRequest, MatchTutorsResponse};

use crate::SharedState;
use crate::auth::AuthUser;
use crate::error::ApiError;

/// POST /api/match-tutors
///
/// 学生プロフィールに対してチューターをスコアリングし、上位 K 件を返す。
/// 上位が空でも成功（マッチなし）として 200 を返す。
pub async fn match_tutors(
    State(state): State<SharedState>,
    auth: AuthUser,
    payload: Result<Json<MatchTutorsRequest>, JsonRejection>,
) -> Result<Json<MatchTutorsResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let top_k = state.pipeline.config().resolve_top_k(request.limit);
    let requested = request.tutors.len();
    let (student, tutors) = request.into_candidates();

    info!(
        subject = %auth.subject,
        tutors = requested,
        after_filter = tutors.len(),
        top_k,
        "match request"
    );

    // エラーのインデックスはリクエストの tutors 配列の位置で返す
    let positions: Vec<usize> = tutors.iter().map(|tutor| tutor.position).collect();
    let result = state
        .pipeline
        .match_candidates(&student, tutors, top_k)
        .await
        .map_err(|err| {
            err.map_candidate_index(|index| positions.get(index).copied().unwrap_or(index))
        })?;

    let embedder = state.pipeline.embedder();
    Ok(Json(MatchTutorsResponse::from_ranked(
        result,
        embedder.name(),
        embedder.model(),
        Utc::now(),
    )))
}
