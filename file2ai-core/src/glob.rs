//! Glob matching for include/exclude file filters.
//!
//! Patterns go through two pure stages: [`expand_braces`] turns `{a,b}`
//! alternations into plain alternatives, then [`compile_glob`] splits every
//! alternative on `/` and compiles each segment into a literal, the globstar
//! `**`, or an anchored regular expression. [`FilterSpec`] layers the
//! user-facing list syntax, the include/exclude mode and the size ceiling on
//! top.
//!
//! # Matching rules
//! - `*` matches any run of characters inside one segment, `?` exactly one.
//! - `[...]` is a character class, `[!...]` its negation.
//! - `**` consumes zero or more whole segments; the first successful split wins.
//! - Segments starting with `.` are only matched by wildcards when the pattern
//!   itself names a dot segment.
//! - An empty pattern matches only the empty path.

use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the alternatives a single pattern may expand to.
pub const MAX_ALTERNATIVES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
    #[error("unbalanced '{delimiter}' in pattern `{pattern}`")]
    Unbalanced { delimiter: char, pattern: String },
    #[error("pattern `{pattern}` ends with a dangling escape")]
    DanglingEscape { pattern: String },
    #[error("pattern `{pattern}` expands to more than {limit} alternatives")]
    TooManyAlternatives { pattern: String, limit: usize },
    #[error("invalid pattern `{pattern}`: {reason}")]
    Invalid { pattern: String, reason: String },
    #[error("unknown pattern mode `{0}`, expected `include` or `exclude`")]
    UnknownMode(String),
}

/// Expands `{a,b}` alternations, including nested groups.
///
/// Escaped braces and commas (`\{`, `\,`) are kept, escape included, so the
/// segment compiler later treats them as literals. Expansion order follows the
/// textual order of the alternatives.
pub fn expand_braces(pattern: &str) -> Result<Vec<String>, GlobError> {
    let mut pending = vec![pattern.to_string()];
    let mut expanded = Vec::new();

    while let Some(current) = pending.pop() {
        match find_brace_group(&current, pattern)? {
            None => expanded.push(current),
            Some((open, close)) => {
                let prefix = &current[..open];
                let suffix = &current[close + 1..];
                let alternatives = split_top_level(&current[open + 1..close], b',');
                for alternative in alternatives.iter().rev() {
                    pending.push(format!("{prefix}{alternative}{suffix}"));
                }
            }
        }
        if expanded.len() + pending.len() > MAX_ALTERNATIVES {
            return Err(GlobError::TooManyAlternatives {
                pattern: pattern.to_string(),
                limit: MAX_ALTERNATIVES,
            });
        }
    }

    Ok(expanded)
}

/// Locates the first outermost `{...}` group. Character classes are skipped.
fn find_brace_group(current: &str, pattern: &str) -> Result<Option<(usize, usize)>, GlobError> {
    let bytes = current.as_bytes();
    let mut depth = 0usize;
    let mut open = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' => {
                if let Some(end) = class_end(bytes, i) {
                    i = end + 1;
                    continue;
                }
            }
            b'{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth == 0 {
                    return Err(GlobError::Unbalanced {
                        delimiter: '}',
                        pattern: pattern.to_string(),
                    });
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = open {
                        return Ok(Some((start, i)));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    if depth > 0 {
        return Err(GlobError::Unbalanced {
            delimiter: '{',
            pattern: pattern.to_string(),
        });
    }
    Ok(None)
}

/// Index of the `]` closing the class opened at `start`, if any.
fn class_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if matches!(bytes.get(j), Some(b'!') | Some(b'^')) {
        j += 1;
    }
    if bytes.get(j) == Some(&b']') {
        j += 1;
    }
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b']' => return Some(j),
            _ => j += 1,
        }
    }
    None
}

/// Splits on `separator` outside braces, classes and escapes.
fn split_top_level(input: &str, separator: u8) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' => {
                if let Some(end) = class_end(bytes, i) {
                    i = end + 1;
                    continue;
                }
            }
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b if b == separator && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Globstar,
    Wildcard(Regex),
}

impl Segment {
    fn matches(&self, name: &str, dotfiles: bool) -> bool {
        match self {
            Segment::Literal(literal) => literal == name,
            Segment::Globstar => false,
            Segment::Wildcard(re) => (dotfiles || !name.starts_with('.')) && re.is_match(name),
        }
    }
}

#[derive(Debug, Clone)]
struct Alternative {
    segments: Vec<Segment>,
    dotfiles: bool,
}

/// A compiled set of glob patterns. A path matches when any alternative of
/// any pattern matches it.
#[derive(Debug, Clone)]
pub struct Matcher {
    alternatives: Vec<Alternative>,
}

impl Matcher {
    pub fn is_match(&self, path: &str) -> bool {
        let parts: Vec<&str> = path
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect();
        self.alternatives
            .iter()
            .any(|alt| match_segments(&alt.segments, &parts, alt.dotfiles))
    }
}

fn match_segments(segments: &[Segment], path: &[&str], dotfiles: bool) -> bool {
    match segments.split_first() {
        None => path.is_empty(),
        Some((Segment::Globstar, rest)) => {
            for consumed in 0..=path.len() {
                if consumed > 0 && !dotfiles && path[consumed - 1].starts_with('.') {
                    break;
                }
                if match_segments(rest, &path[consumed..], dotfiles) {
                    return true;
                }
            }
            false
        }
        Some((segment, rest)) => match path.split_first() {
            Some((head, tail)) => {
                segment.matches(head, dotfiles) && match_segments(rest, tail, dotfiles)
            }
            None => false,
        },
    }
}

/// Compiles one pattern (after brace expansion) into a [`Matcher`].
pub fn compile_glob(pattern: &str) -> Result<Matcher, GlobError> {
    compile(&[pattern])
}

/// Compiles a list of patterns into one [`Matcher`] that matches their union.
pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Matcher, GlobError> {
    let mut alternatives = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        for expanded in expand_braces(pattern)? {
            alternatives.push(compile_alternative(&expanded, pattern)?);
        }
    }
    Ok(Matcher { alternatives })
}

fn compile_alternative(alternative: &str, pattern: &str) -> Result<Alternative, GlobError> {
    let raw: Vec<&str> = alternative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let dotfiles = raw.iter().any(|segment| segment.starts_with('.'));

    let mut segments = Vec::with_capacity(raw.len());
    for segment in raw {
        let compiled = if segment == "**" {
            Segment::Globstar
        } else if has_wildcard(segment) {
            Segment::Wildcard(translate_segment(segment, pattern)?)
        } else {
            Segment::Literal(unescape(segment, pattern)?)
        };
        segments.push(compiled);
    }
    Ok(Alternative { segments, dotfiles })
}

fn has_wildcard(segment: &str) -> bool {
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

fn unescape(segment: &str, pattern: &str) -> Result<String, GlobError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => {
                    return Err(GlobError::DanglingEscape {
                        pattern: pattern.to_string(),
                    })
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn translate_segment(segment: &str, pattern: &str) -> Result<Regex, GlobError> {
    let chars: Vec<char> = segment.chars().collect();
    let mut re = String::from("^");
    let mut buf = [0u8; 4];
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let next = chars.get(i + 1).ok_or_else(|| GlobError::DanglingEscape {
                    pattern: pattern.to_string(),
                })?;
                re.push_str(&regex::escape(next.encode_utf8(&mut buf)));
                i += 2;
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                let (class, next) =
                    translate_class(&chars, i).ok_or_else(|| GlobError::Unbalanced {
                        delimiter: '[',
                        pattern: pattern.to_string(),
                    })?;
                re.push_str(&class);
                i = next;
                continue;
            }
            c => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
        i += 1;
    }
    re.push('$');

    Regex::new(&re).map_err(|e| GlobError::Invalid {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Translates the class starting at `start`; returns it and the index after `]`.
fn translate_class(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut out = String::from("[");
    let mut j = start + 1;
    if matches!(chars.get(j), Some('!') | Some('^')) {
        out.push('^');
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        out.push_str("\\]");
        j += 1;
    }
    while j < chars.len() {
        match chars[j] {
            ']' => {
                out.push(']');
                return Some((out, j + 1));
            }
            '\\' => {
                let next = *chars.get(j + 1)?;
                if next.is_ascii_punctuation() {
                    out.push('\\');
                }
                out.push(next);
                j += 2;
                continue;
            }
            c @ ('[' | '&' | '~') => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
        j += 1;
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternMode {
    Include,
    #[default]
    Exclude,
}

impl FromStr for PatternMode {
    type Err = GlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "include" => Ok(PatternMode::Include),
            "exclude" | "" => Ok(PatternMode::Exclude),
            other => Err(GlobError::UnknownMode(other.to_string())),
        }
    }
}

/// Filter settings for one job: mode, raw patterns and an optional size ceiling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub mode: PatternMode,
    pub patterns: Vec<String>,
    pub max_size_bytes: Option<u64>,
}

impl FilterSpec {
    pub fn new(mode: PatternMode, patterns: Vec<String>, max_size_bytes: Option<u64>) -> Self {
        Self {
            mode,
            patterns,
            max_size_bytes,
        }
    }

    /// Builds a spec from the `;`/`,` separated list users type in.
    pub fn parse(mode: PatternMode, pattern_input: &str, max_size_bytes: Option<u64>) -> Self {
        Self::new(mode, split_pattern_list(pattern_input), max_size_bytes)
    }

    pub fn compile(&self) -> Result<FileFilter, GlobError> {
        let normalized: Vec<String> = self
            .patterns
            .iter()
            .filter_map(|p| normalize_filter_pattern(p))
            .collect();
        let matcher = if normalized.is_empty() {
            None
        } else {
            Some(compile(&normalized)?)
        };
        Ok(FileFilter {
            mode: self.mode,
            matcher,
            max_size_bytes: self.max_size_bytes,
        })
    }
}

/// Splits user input on `;`, newlines and commas outside braces.
///
/// A `#` entry runs to the next `;` or newline so commas inside comments do
/// not produce patterns.
pub fn split_pattern_list(input: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = input.chars();

    let mut flush = |current: &mut String| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            patterns.push(trimmed.to_string());
        }
        current.clear();
    };

    while let Some(c) = chars.next() {
        let in_comment = current.trim_start().starts_with('#');
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ';' | '\n' | '\r' => {
                depth = 0;
                flush(&mut current);
            }
            ',' if depth == 0 && !in_comment => flush(&mut current),
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    flush(&mut current);
    patterns
}

/// Turns one user pattern into the form the matcher compiles.
///
/// Comments and blanks yield `None`. Trailing `/` is dropped; a leading `/`
/// anchors the pattern at the root, anything else matches at any depth.
pub fn normalize_filter_pattern(pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if let Some(anchored) = trimmed.strip_prefix('/') {
        let anchored = anchored.trim_start_matches('/');
        return (!anchored.is_empty()).then(|| anchored.to_string());
    }
    if trimmed == "**" || trimmed.starts_with("**/") {
        return Some(trimmed.to_string());
    }
    Some(format!("**/{trimmed}"))
}

/// A compiled [`FilterSpec`].
#[derive(Debug, Clone)]
pub struct FileFilter {
    mode: PatternMode,
    matcher: Option<Matcher>,
    max_size_bytes: Option<u64>,
}

impl FileFilter {
    /// A filter that lets every file through.
    pub fn allow_all() -> Self {
        Self {
            mode: PatternMode::Exclude,
            matcher: None,
            max_size_bytes: None,
        }
    }

    /// True when the path, or one of its parent directories, matches a pattern.
    pub fn matches(&self, path: &str) -> bool {
        let Some(matcher) = &self.matcher else {
            return false;
        };
        path.char_indices()
            .filter(|(_, c)| *c == '/')
            .map(|(i, _)| &path[..i])
            .chain(std::iter::once(path))
            .any(|prefix| matcher.is_match(prefix))
    }

    /// Inclusion decision for a file of `size_bytes` at `path`.
    pub fn allows(&self, path: &str, size_bytes: u64) -> bool {
        if let Some(max) = self.max_size_bytes {
            if size_bytes > max {
                return false;
            }
        }
        if self.matcher.is_none() {
            return true;
        }
        match self.mode {
            PatternMode::Include => self.matches(path),
            PatternMode::Exclude => !self.matches(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_nested_groups_in_textual_order() {
        let expanded = expand_braces("src/{a,b{1,2}}/*.rs").unwrap();
        assert_eq!(expanded, vec!["src/a/*.rs", "src/b1/*.rs", "src/b2/*.rs"]);
    }

    #[test]
    fn escaped_braces_and_commas_stay_literal() {
        let expanded = expand_braces(r"a\{b\,c\}").unwrap();
        assert_eq!(expanded, vec![r"a\{b\,c\}"]);
        let matcher = compile_glob(r"a\{b\,c\}").unwrap();
        assert!(matcher.is_match("a{b,c}"));
    }

    #[test]
    fn unbalanced_delimiters_fail_to_compile() {
        assert!(matches!(
            compile_glob("src/{a,b"),
            Err(GlobError::Unbalanced { delimiter: '{', .. })
        ));
        assert!(matches!(
            compile_glob("src/a}"),
            Err(GlobError::Unbalanced { delimiter: '}', .. })
        ));
        assert!(matches!(
            compile_glob("src/[ab"),
            Err(GlobError::Unbalanced { delimiter: '[', .. })
        ));
        assert!(matches!(
            compile_glob("trailing\\"),
            Err(GlobError::DanglingEscape { .. })
        ));
    }

    #[test]
    fn expansion_is_capped() {
        let pattern = "{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}{a,b}";
        assert!(matches!(
            expand_braces(pattern),
            Err(GlobError::TooManyAlternatives { .. })
        ));
    }

    #[test]
    fn negated_class_accepts_bang() {
        let matcher = compile_glob("file[!0-9].txt").unwrap();
        assert!(matcher.is_match("filea.txt"));
        assert!(!matcher.is_match("file1.txt"));
    }

    #[test]
    fn comment_entries_swallow_commas() {
        let patterns = split_pattern_list("# skip a, b\n*.md, docs/{a,b}/*; target/");
        assert_eq!(patterns, vec!["# skip a, b", "*.md", "docs/{a,b}/*", "target/"]);
    }

    #[test]
    fn normalization_anchors_and_strips() {
        assert_eq!(normalize_filter_pattern("build/").as_deref(), Some("**/build"));
        assert_eq!(normalize_filter_pattern("/build/").as_deref(), Some("build"));
        assert_eq!(normalize_filter_pattern("**/x").as_deref(), Some("**/x"));
        assert_eq!(normalize_filter_pattern("# note"), None);
        assert_eq!(normalize_filter_pattern("  "), None);
    }
}
