use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap};
use unicode_normalization::UnicodeNormalization;

/// Canonical skill name and the spellings that map onto it.
///
/// Keyword extraction in [`crate::extraction`] walks the same table, so every
/// alias here is also a phrase searched for in resume text.
pub(crate) const SKILL_ALIASES: &[(&str, &[&str])] = &[
    ("javascript", &["javascript", "js", "node.js", "nodejs", "node", "ecmascript"]),
    ("typescript", &["typescript", "ts"]),
    ("python", &["python", "py", "python3", "django", "flask", "fastapi"]),
    ("java", &["java", "spring", "spring boot", "hibernate"]),
    ("react", &["react", "reactjs", "react.js", "jsx"]),
    ("angular", &["angular", "angularjs", "angular.js"]),
    ("vue", &["vue", "vuejs", "vue.js"]),
    ("css", &["css", "css3", "scss", "sass"]),
    ("html", &["html", "html5"]),
    ("rust", &["rust", "rustlang"]),
    ("go", &["golang"]),
    ("mongodb", &["mongodb", "mongo"]),
    ("mysql", &["mysql"]),
    ("postgresql", &["postgresql", "postgres", "psql"]),
    ("sqlite", &["sqlite", "sqlite3"]),
    ("sql", &["sql"]),
    ("aws", &["aws", "amazon web services", "ec2", "s3", "lambda"]),
    ("docker", &["docker", "containerization"]),
    ("kubernetes", &["kubernetes", "k8s", "container orchestration"]),
    ("git", &["git", "version control", "github", "gitlab"]),
    (
        "machine learning",
        &["machine learning", "ml", "artificial intelligence"],
    ),
    ("tensorflow", &["tensorflow", "tf"]),
    ("pytorch", &["pytorch", "torch"]),
    ("scikit-learn", &["scikit-learn", "sklearn", "scikit learn"]),
];

static ALIAS_TO_CANONICAL: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (canonical, aliases) in SKILL_ALIASES {
        map.insert(*canonical, *canonical);
        for alias in *aliases {
            map.entry(*alias).or_insert(*canonical);
        }
    }
    map
});

fn nfkc_lower_trim(input: &str) -> String {
    input
        .nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical form of one skill: NFKC, lowercase, whitespace collapsed, then
/// alias lookup. Unknown skills keep their lowercased spelling.
pub fn normalize_skill(skill: &str) -> String {
    let normalized = nfkc_lower_trim(skill);
    match ALIAS_TO_CANONICAL.get(normalized.as_str()) {
        Some(canonical) => (*canonical).to_string(),
        None => normalized,
    }
}

/// Normalized, deduplicated and sorted skill list. This is the only shape
/// skills are persisted in.
pub fn normalize_skills<I, S>(skills: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    skills
        .into_iter()
        .map(|s| normalize_skill(s.as_ref()))
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Split a comma separated skill string as submitted alongside a resume.
pub fn parse_skill_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
