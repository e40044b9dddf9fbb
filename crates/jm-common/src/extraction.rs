//! Keyword based skill and experience extraction from free-text resumes.
//!
//! This is the fallback used when resume ingestion receives no structured
//! skills or experience from the caller.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::skill_normalizer::SKILL_ALIASES;

static SKILL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    SKILL_ALIASES
        .iter()
        .flat_map(|(canonical, aliases)| {
            aliases.iter().filter_map(move |alias| {
                let pattern = format!(r"(?:^|[^a-z0-9]){}(?:$|[^a-z0-9])", regex::escape(alias));
                Regex::new(&pattern).ok().map(|re| (*canonical, re))
            })
        })
        .collect()
});

static EXPERIENCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(\d+)\+?\s*years?\s*(?:of\s*)?experience",
        r"(\d+)\+?\s*years?\s*(?:in|with)\b",
        r"experience\s*:?\s*(\d+)\+?\s*years?",
        r"(\d+)\+?\s*years?\s*(?:professional|work)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Canonical skills mentioned anywhere in `text`, sorted.
pub fn extract_skills_from_text(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    SKILL_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(&lower))
        .map(|(canonical, _)| (*canonical).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Largest "N years of experience" style figure in `text`, or 0.
pub fn extract_experience_years(text: &str) -> i32 {
    let lower = text.to_lowercase();
    EXPERIENCE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(&lower))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<i32>().ok())
        .max()
        .unwrap_or(0)
}
