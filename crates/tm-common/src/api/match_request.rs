use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::matching::Candidate;
use crate::profile::ProfileDescription;

/// 応答時に付け直すため、入力側では捨てるフィールド
const RESERVED_FIELDS: [&str; 1] = ["score"];

/// チューターのレコード
///
/// description / profile / skills 以外のフィールド（id, name, subjects など）は
/// そのまま保持し、応答でエコーバックする。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorRecord {
    #[serde(flatten)]
    pub profile: ProfileDescription,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TutorRecord {
    pub fn new(profile: ProfileDescription) -> Self {
        Self {
            profile,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// 識別子（id があれば id、無ければ email）
    pub fn id(&self) -> Option<&Value> {
        self.extra.get("id").or_else(|| self.extra.get("email"))
    }

    /// `subjects: [{ "code": "MATH 101", ... }]` に指定コードが含まれるか
    pub fn teaches_subject(&self, code: &str) -> bool {
        let wanted = code.trim();
        self.extra
            .get("subjects")
            .and_then(Value::as_array)
            .map(|subjects| {
                subjects.iter().any(|subject| {
                    subject
                        .get("code")
                        .and_then(Value::as_str)
                        .is_some_and(|c| c.trim().eq_ignore_ascii_case(wanted))
                })
            })
            .unwrap_or(false)
    }
}

/// ランキングに渡す候補（リクエスト内の元の位置を保持）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestTutor {
    #[serde(skip)]
    pub position: usize,
    #[serde(flatten)]
    pub record: TutorRecord,
}

impl Candidate for RequestTutor {
    fn profile(&self) -> &ProfileDescription {
        &self.record.profile
    }
}

/// POST /api/match-tutors のリクエスト
#[derive(Debug, Clone, Deserialize)]
pub struct MatchTutorsRequest {
    pub student: ProfileDescription,
    #[serde(default)]
    pub tutors: Vec<TutorRecord>,
    /// 返す件数（未指定ならサーバ既定値）
    #[serde(default)]
    pub limit: Option<usize>,
    /// 指定時はこの科目コードを持つチューターだけを対象にする
    #[serde(default)]
    pub subject_code: Option<String>,
}

impl MatchTutorsRequest {
    /// 科目フィルタを適用し、予約フィールドを落とした候補列を返す
    pub fn into_candidates(self) -> (ProfileDescription, Vec<RequestTutor>) {
        let subject_code = self
            .subject_code
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty());

        let candidates = self
            .tutors
            .into_iter()
            .enumerate()
            .filter(|(_, tutor)| {
                subject_code
                    .as_deref()
                    .is_none_or(|code| tutor.teaches_subject(code))
            })
            .map(|(position, mut record)| {
                for field in RESERVED_FIELDS {
                    record.extra.remove(field);
                }
                RequestTutor { position, record }
            })
            .collect();

        (self.student, candidates)
    }
}
