use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 埋め込み対象となるプロフィール記述（学生・チューター共通）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDescription {
    /// 何を教えたい / 学びたいかの説明
    pub description: String,
    /// 自由記述の自己紹介
    #[serde(default)]
    pub profile: String,
    /// スキルタグ（入力順を保持）
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile description is empty")]
    Empty,
}

impl ProfileDescription {
    pub fn new(
        description: impl Into<String>,
        profile: impl Into<String>,
        skills: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            description: description.into(),
            profile: profile.into(),
            skills: skills.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.description.trim().is_empty()
            && self.profile.trim().is_empty()
            && self.skills.iter().all(|skill| skill.trim().is_empty())
    }

    /// 埋め込み用テキストを組み立てる
    pub fn to_profile_text(&self) -> Result<ProfileText, ProfileError> {
        ProfileText::compose(&self.description, &self.profile, &self.skills)
    }
}

/// Embedder に渡す合成済みテキスト
///
/// 形式: `Description: {description}. Profile: {profile}. Skills: {a, b, c}`
///
/// リクエストごとに生成され、永続化はしない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileText(String);

impl ProfileText {
    pub fn compose(
        description: &str,
        profile: &str,
        skills: &[String],
    ) -> Result<Self, ProfileError> {
        let skills: Vec<&str> = skills
            .iter()
            .map(|skill| skill.trim())
            .filter(|skill| !skill.is_empty())
            .collect();

        if description.trim().is_empty() && profile.trim().is_empty() && skills.is_empty() {
            return Err(ProfileError::Empty);
        }

        Ok(Self(format!(
            "Description: {}. Profile: {}. Skills: {}",
            description.trim(),
            profile.trim(),
            skills.join(", ")
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for ProfileText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
