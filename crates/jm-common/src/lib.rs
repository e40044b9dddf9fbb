pub mod db;
pub mod embedding;
pub mod extraction;
pub mod logging;
pub mod matching;
pub mod ranking;
pub mod run_id;
pub mod skill_normalizer;
pub mod store;
pub mod tasks;
pub mod vector_index;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skill_normalizer::normalize_skills;

// Data models shared by scoring, storage and the task handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub email: String,
    pub resume_text: String,
    /// Lower-cased and deduplicated before it is stored.
    pub skills: Vec<String>,
    pub experience_years: i32,
    pub education: Option<String>,
    /// Empty until embedded.
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        resume_text: impl Into<String>,
        skills: &[String],
        experience_years: i32,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            resume_text: resume_text.into(),
            skills: normalize_skills(skills),
            experience_years: experience_years.max(0),
            education: None,
            embedding: Vec::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub required_skills: Vec<String>,
    pub min_experience_years: i32,
    pub location: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl JobPosting {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
        description: impl Into<String>,
        required_skills: &[String],
        min_experience_years: i32,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            company: company.into(),
            description: description.into(),
            required_skills: normalize_skills(required_skills),
            min_experience_years,
            location: String::new(),
            embedding: Vec::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}
