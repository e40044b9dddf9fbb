use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Services, into_result};
use crate::embedding::candidate_embedding_text;
use crate::extraction::{extract_experience_years, extract_skills_from_text};
use crate::skill_normalizer::{normalize_skills, parse_skill_list};
use crate::store::CandidateStore;
use crate::tasks::runtime::{TaskContext, TaskError, TaskResult};
use crate::Candidate;

/// Arguments of a `resume_processing` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// Defaults to the task id, so a re-delivered task overwrites the
    /// candidate its earlier run stored.
    #[serde(default)]
    pub candidate_id: Option<String>,
    pub resume_text: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Comma separated, merged with the skills found in the text.
    #[serde(default)]
    pub skills: String,
    /// `0` means "extract from the text".
    #[serde(default)]
    pub experience_years: i32,
    #[serde(default)]
    pub education: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub candidate_id: String,
    pub extracted_skills: Vec<String>,
    pub experience_years: i32,
    pub parsing_method: String,
    pub embedding_generated: bool,
    pub index_updated: bool,
}

/// Skills and years from the text, with caller-provided values taking
/// precedence for experience and merged in for skills.
pub fn basic_parse(request: &ResumeRequest) -> (Vec<String>, i32) {
    let mut skills = parse_skill_list(&request.skills);
    skills.extend(extract_skills_from_text(&request.resume_text));
    let experience = if request.experience_years > 0 {
        request.experience_years
    } else {
        extract_experience_years(&request.resume_text)
    };
    (normalize_skills(skills), experience)
}

pub async fn process_resume(
    services: &Services,
    ctx: &TaskContext,
    request: ResumeRequest,
    owner: &str,
) -> TaskResult {
    ctx.progress(10, "Reading resume").await?;
    if request.resume_text.trim().is_empty() {
        return Err(TaskError::permanent("No resume text provided"));
    }

    ctx.progress(30, "Processing text resume").await?;
    let candidate_id = request
        .candidate_id
        .clone()
        .unwrap_or_else(|| ctx.task_id().to_string());

    ctx.progress(50, "Extracting skills and experience").await?;
    let (skills, experience_years) = basic_parse(&request);
    let mut candidate = Candidate::new(
        candidate_id,
        request.name.as_str(),
        request.email.as_str(),
        request.resume_text.as_str(),
        &skills,
        experience_years,
        owner,
    );
    candidate.education = request.education.clone().filter(|e| !e.trim().is_empty());

    ctx.progress(70, "Generating embeddings").await?;
    candidate.embedding = services.embed(&candidate_embedding_text(&candidate)).await;
    let embedding_generated = !candidate.embedding.is_empty();
    if !embedding_generated {
        warn!(task_id = ctx.task_id(), candidate_id = %candidate.id, "no embedding for resume");
    }

    ctx.progress(85, "Creating candidate record").await?;
    ctx.progress(90, "Saving to database").await?;
    services.store.insert_candidate(&candidate).await?;

    ctx.progress(95, "Updating vector index").await?;
    let index_updated = embedding_generated
        && services
            .index_candidate(&candidate.id, &candidate.name, candidate.embedding.clone())
            .await;

    info!(
        task_id = ctx.task_id(),
        candidate_id = %candidate.id,
        skills = candidate.skills.len(),
        experience_years = candidate.experience_years,
        index_updated,
        "resume processed"
    );

    let outcome = ResumeOutcome {
        candidate_id: candidate.id,
        extracted_skills: candidate.skills,
        experience_years: candidate.experience_years,
        parsing_method: "basic".into(),
        embedding_generated,
        index_updated,
    };
    into_result(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provided_skills_merge_with_extracted_ones() {
        let request = ResumeRequest {
            resume_text: "Backend engineer, 6 years of experience with Python and Docker".into(),
            skills: "Rust, k8s".into(),
            ..Default::default()
        };

        let (skills, years) = basic_parse(&request);

        assert!(skills.contains(&"rust".to_string()));
        assert!(skills.contains(&"kubernetes".to_string()));
        assert!(skills.contains(&"python".to_string()));
        assert!(skills.contains(&"docker".to_string()));
        assert_eq!(years, 6);
    }

    #[test]
    fn explicit_experience_wins() {
        let request = ResumeRequest {
            resume_text: "10 years of experience".into(),
            experience_years: 3,
            ..Default::default()
        };
        assert_eq!(basic_parse(&request).1, 3);
    }
}
