//! Filter builder: the sole producer of search predicates. Callers pass `path`/
//! `file_pattern` strings; this module is the only place user input is allowed to
//! influence a predicate, and it never hands the caller a string to concatenate —
//! only a typed [`Predicate`] value.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SemanticSearchError};

/// Whitelist applied to every raw pattern fragment before it is allowed anywhere
/// near a predicate. Anything outside this set raises `invalid-filter`.
static PATTERN_WHITELIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-%]+$").expect("static regex"));

/// Validated separately: a translated glob/path fragment is further restricted to
/// this shape once separators and dots have been folded to underscores.
static LANGUAGE_WHITELIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+$").expect("static regex"));

const MAX_PATTERN_LEN: usize = 500;

/// Closed, typed predicate value. Never rendered by caller string concatenation;
/// [`Predicate::to_display`] exists only for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `id LIKE '{pattern}%'` — candidate id must begin with the given prefix.
    IdPrefixLike(String),
    /// `id LIKE '%{pattern}'` — candidate id must end with the given suffix shape.
    IdSuffixLike(String),
    /// `language = '{value}'` — exact, case-sensitive language tag match.
    LanguageEq(String),
    /// Conjunction of sub-predicates; matches only if every member matches.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate against a candidate's id and language tag. This is the store's
    /// only way to consult a predicate — it never sees the raw input that built it.
    pub fn matches(&self, id: &str, language: &str) -> bool {
        match self {
            Predicate::IdPrefixLike(pattern) => sql_like_match(id, &format!("{pattern}%")),
            Predicate::IdSuffixLike(pattern) => sql_like_match(id, &format!("%{pattern}")),
            Predicate::LanguageEq(value) => language == value,
            Predicate::And(members) => members.iter().all(|p| p.matches(id, language)),
        }
    }

    /// Render for logging/debugging only — never parsed back into a predicate.
    pub fn to_display(&self) -> String {
        match self {
            Predicate::IdPrefixLike(p) => format!("id LIKE '{p}%'"),
            Predicate::IdSuffixLike(p) => format!("id LIKE '%{p}'"),
            Predicate::LanguageEq(v) => format!("language = '{v}'"),
            Predicate::And(members) => members
                .iter()
                .map(Predicate::to_display)
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

/// Options accepted by [`build_filter`]. Both are caller-controlled raw strings —
/// this is the boundary where they either get sanitized or rejected.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub path: Option<String>,
    pub file_pattern: Option<String>,
}

/// Closed extension → language table used to translate a `*.ext` file pattern into
/// a language equality predicate instead of a path-shaped one.
const EXTENSION_LANGUAGE_TABLE: &[(&str, &str)] = &[
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "typescript"),
    ("jsx", "typescript"),
    ("py", "python"),
    ("rs", "rust"),
    ("go", "go"),
    ("dart", "dart"),
    ("java", "java"),
    ("cs", "csharp"),
    ("php", "php"),
    ("proto", "protobuf"),
];

/// Build a predicate from filter options, or `None` if neither option was given.
pub fn build_filter(options: &FilterOptions) -> Result<Option<Predicate>> {
    let mut clauses = Vec::new();

    if let Some(path) = &options.path {
        clauses.push(path_predicate(path)?);
    }

    if let Some(pattern) = &options.file_pattern {
        clauses.push(file_pattern_predicate(pattern)?);
    }

    match clauses.len() {
        0 => Ok(None),
        1 => Ok(Some(clauses.into_iter().next().expect("len == 1"))),
        _ => Ok(Some(Predicate::And(clauses))),
    }
}

fn path_predicate(path: &str) -> Result<Predicate> {
    let sanitized = sanitize_fragment(path)?;
    Ok(Predicate::IdPrefixLike(sanitized))
}

fn file_pattern_predicate(pattern: &str) -> Result<Predicate> {
    if let Some(ext) = extension_glob_suffix(pattern) {
        if let Some((_, language)) = EXTENSION_LANGUAGE_TABLE
            .iter()
            .find(|(known_ext, _)| known_ext.eq_ignore_ascii_case(ext))
        {
            validate_language(language)?;
            return Ok(Predicate::LanguageEq((*language).to_string()));
        }
    }

    let translated = translate_glob(pattern);
    let sanitized = sanitize_fragment(&translated)?;
    Ok(Predicate::IdSuffixLike(sanitized))
}

/// Recognize the `*.ext` shape exactly (a single leading `*.` followed by a bare
/// extension, no further wildcards) and return the extension if it matches.
fn extension_glob_suffix(pattern: &str) -> Option<&str> {
    let rest = pattern.strip_prefix("*.")?;
    if rest.is_empty() || rest.contains(['*', '?', '/', '\\']) {
        return None;
    }
    Some(rest)
}

/// Translate glob syntax into SQL LIKE syntax: `**` and `*` become `%`, `?`
/// becomes `_`, and path separators/dots fold to `_` the same way chunk ids do.
fn translate_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push('%');
            }
            '?' => out.push('_'),
            '/' | '\\' | '.' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}

fn sanitize_fragment(raw: &str) -> Result<String> {
    let translated = translate_glob(raw);
    if translated.is_empty() || translated.len() > MAX_PATTERN_LEN {
        return Err(SemanticSearchError::InvalidFilter {
            reason: format!("pattern length must be 1..={MAX_PATTERN_LEN} characters"),
        });
    }
    if !PATTERN_WHITELIST.is_match(&translated) {
        return Err(SemanticSearchError::InvalidFilter {
            reason: format!("pattern '{raw}' contains characters outside the allowed set"),
        });
    }
    Ok(translated)
}

fn validate_language(language: &str) -> Result<()> {
    if !LANGUAGE_WHITELIST.is_match(language) {
        return Err(SemanticSearchError::InvalidFilter {
            reason: format!("language tag '{language}' is not a valid identifier"),
        });
    }
    Ok(())
}

/// Minimal SQL `LIKE` matcher: `%` matches any run of characters (including
/// none), `_` matches exactly one. Everything else is a literal. No backtracking
/// library involved — this never touches a regex engine, so caller input can
/// never trigger a regex compile error or ReDoS.
fn sql_like_match(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    like_match(&t, &p)
}

fn like_match(text: &[char], pattern: &[char]) -> bool {
    // Classic wildcard matching via a DP table; pattern/text are short (bounded by
    // MAX_PATTERN_LEN and chunk-id length) so quadratic cost is a non-issue.
    let (tn, pn) = (text.len(), pattern.len());
    let mut dp = vec![vec![false; pn + 1]; tn + 1];
    dp[0][0] = true;
    for (j, &pc) in pattern.iter().enumerate() {
        if pc == '%' {
            dp[0][j + 1] = dp[0][j];
        }
    }
    for i in 0..tn {
        for j in 0..pn {
            dp[i + 1][j + 1] = match pattern[j] {
                '%' => dp[i][j + 1] || dp[i + 1][j],
                '_' => dp[i][j],
                c => dp[i][j] && c == text[i],
            };
        }
    }
    dp[tn][pn]
}

/// Standalone validator exposed for callers that want to pre-check a raw pattern
/// (e.g. the CLI) before it ever reaches `build_filter`.
pub fn validate_filter_pattern(pattern: &str) -> Result<()> {
    sanitize_fragment(pattern).map(|_| ())
}
