//! Path and host pattern compilation and matching.
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/users/:id(\d+)`    | `/users/42` (not `/users/me`) | `id → "42"`                  |
//! | `/v/(\d+)/:name`     | `/v/2/docs`                | `0 → "2"`, `name → "docs"`      |
//! | `/files/*`           | `/files/docs/readme.txt`   | `0 → "docs/readme.txt"`         |
//! | `/files/*rest`       | `/files/docs/readme.txt`   | `rest → "docs/readme.txt"`      |
//! | `/raw/:p([a-z/]+)`   | `/raw/a/b`                 | `p → "a/b"`                     |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so
//! `/users/` and `/users` are treated as equivalent. Matching never has side
//! effects and always gives the same answer for the same input.

use regex::Regex;
use thiserror::Error;

use crate::context::Parameters;

/// Errors produced while compiling a route pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid parameter name in `{pattern}`")]
    InvalidParameter { pattern: String },

    #[error("unbalanced parentheses in `{pattern}`")]
    Unbalanced { pattern: String },

    #[error("wildcard must be the last segment of `{pattern}`")]
    MisplacedWildcard { pattern: String },

    #[error("invalid constraint in `{pattern}`: {source}")]
    Constraint {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// A single path segment. Unnamed captures get their positional index as name.
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Param {
        name: String,
        named: bool,
        constraint: Option<Regex>,
    },
    Wildcard {
        name: String,
        named: bool,
    },
}

/// Compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Splits on `/` outside of parentheses so constraints may contain slashes.
fn split_segments(pattern: &str) -> Result<Vec<&str>, PatternError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in pattern.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| PatternError::Unbalanced {
                    pattern: pattern.to_owned(),
                })?;
            }
            '/' if depth == 0 => {
                parts.push(&pattern[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PatternError::Unbalanced {
            pattern: pattern.to_owned(),
        });
    }
    parts.push(&pattern[start..]);
    Ok(parts.into_iter().filter(|s| !s.is_empty()).collect())
}

fn compile_constraint(pattern: &str, inner: &str) -> Result<Regex, PatternError> {
    Regex::new(&format!("^(?:{inner})$")).map_err(|source| PatternError::Constraint {
        pattern: pattern.to_owned(),
        source,
    })
}

impl PathPattern {
    /// Parse a route pattern string.
    ///
    /// # Errors
    ///
    /// Fails on empty or non-alphanumeric parameter names, unbalanced
    /// parentheses, a wildcard that is not the final segment, or a constraint
    /// that is not a valid regex.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use waypost::router::pattern::PathPattern;
    ///
    /// let p = PathPattern::parse("/users/:id(\\d+)").unwrap();
    /// assert_eq!(p.matches("/users/42").unwrap().get("id"), Some("42"));
    /// assert!(p.matches("/users/me").is_none());
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = trim_trailing_slash(pattern);
        let raw_segments = split_segments(trimmed)?;
        let invalid = || PatternError::InvalidParameter {
            pattern: pattern.to_owned(),
        };

        let mut positional = 0usize;
        let mut next_index = || {
            let index = positional;
            positional += 1;
            index.to_string()
        };

        let mut segments = Vec::with_capacity(raw_segments.len());
        for (i, raw) in raw_segments.iter().enumerate() {
            let segment = if let Some(name) = raw.strip_prefix('*') {
                if i + 1 != raw_segments.len() {
                    return Err(PatternError::MisplacedWildcard {
                        pattern: pattern.to_owned(),
                    });
                }
                if name.is_empty() {
                    Segment::Wildcard {
                        name: next_index(),
                        named: false,
                    }
                } else if valid_name(name) {
                    Segment::Wildcard {
                        name: name.to_owned(),
                        named: true,
                    }
                } else {
                    return Err(invalid());
                }
            } else if let Some(rest) = raw.strip_prefix(':') {
                let (name, constraint) = match rest.find('(') {
                    Some(open) => (&rest[..open], Some(&rest[open..])),
                    None => (rest, None),
                };
                if !valid_name(name) {
                    return Err(invalid());
                }
                let constraint = match constraint {
                    Some(group) if group.ends_with(')') => {
                        Some(compile_constraint(pattern, &group[1..group.len() - 1])?)
                    }
                    Some(_) => return Err(invalid()),
                    None => None,
                };
                Segment::Param {
                    name: name.to_owned(),
                    named: true,
                    constraint,
                }
            } else if raw.starts_with('(') && raw.ends_with(')') && raw.len() >= 2 {
                Segment::Param {
                    name: next_index(),
                    named: false,
                    constraint: Some(compile_constraint(pattern, &raw[1..raw.len() - 1])?),
                }
            } else {
                Segment::Static((*raw).to_owned())
            };
            segments.push(segment);
        }

        Ok(Self {
            source: pattern.to_owned(),
            segments,
        })
    }

    /// The pattern as written at registration.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of capturing segments (parameters and wildcards).
    pub fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Static(_)))
            .count()
    }

    /// Number of captures with a declared name.
    pub fn named_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Segment::Param { named: true, .. } | Segment::Wildcard { named: true, .. }
                )
            })
            .count()
    }

    /// Number of parameters restricted by a regex constraint.
    pub fn constrained_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Segment::Param {
                        constraint: Some(_),
                        ..
                    }
                )
            })
            .count()
    }

    /// Number of wildcard segments (zero or one).
    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Wildcard { .. }))
            .count()
    }

    /// Match the whole of `path`, returning the captured parameters.
    pub fn matches(&self, path: &str) -> Option<Parameters> {
        self.match_segments(path, false)
    }

    /// Match `path` against this pattern as a segment-aligned prefix, so
    /// `/api` matches `/api/users` but not `/apiary`.
    pub fn matches_prefix(&self, path: &str) -> Option<Parameters> {
        self.match_segments(path, true)
    }

    fn match_segments(&self, path: &str, prefix: bool) -> Option<Parameters> {
        let path = trim_trailing_slash(path);
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut captures = Vec::with_capacity(self.segments.len());

        match_from(&self.segments, &parts, prefix, &mut captures)
            .then(|| captures.into_iter().collect())
    }
}

// Backtracking walk over the segments. A constrained parameter may span several
// path segments when its regex admits `/`; the longest span is tried first.
fn match_from<'a>(
    segments: &'a [Segment],
    parts: &[&str],
    prefix: bool,
    captures: &mut Vec<(&'a str, String)>,
) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return prefix || parts.is_empty();
    };

    match segment {
        Segment::Wildcard { name, .. } => {
            captures.push((name.as_str(), parts.join("/")));
            true
        }
        Segment::Static(expected) => match parts.split_first() {
            Some((part, tail)) if *part == expected.as_str() => {
                match_from(rest, tail, prefix, captures)
            }
            _ => false,
        },
        Segment::Param {
            name,
            constraint: None,
            ..
        } => match parts.split_first() {
            Some((part, tail)) => {
                captures.push((name.as_str(), (*part).to_owned()));
                if match_from(rest, tail, prefix, captures) {
                    return true;
                }
                captures.pop();
                false
            }
            None => false,
        },
        Segment::Param {
            name,
            constraint: Some(re),
            ..
        } => {
            for end in (1..=parts.len()).rev() {
                let value = parts[..end].join("/");
                if !re.is_match(&value) {
                    continue;
                }
                captures.push((name.as_str(), value));
                if match_from(rest, &parts[end..], prefix, captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
    }
}

#[derive(Debug, Clone)]
enum HostLabel {
    Static(String),
    Param(String),
    Any,
}

#[derive(Debug, Clone)]
enum HostMatcher {
    Labels(Vec<HostLabel>),
    Regex(Regex),
}

/// Compiled host pattern, matched case-insensitively.
///
/// # Examples
///
/// ```rust
/// use waypost::router::pattern::HostPattern;
///
/// let p = HostPattern::parse(":tenant.example.com").unwrap();
/// let params = p.matches("Acme.Example.com").unwrap();
/// assert_eq!(params.get("tenant"), Some("acme"));
/// assert!(p.matches("example.com").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    matcher: HostMatcher,
}

impl HostPattern {
    /// Parse a dot-separated host pattern with `:name` and `*` labels.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = pattern.trim().to_ascii_lowercase();
        let labels = source
            .split('.')
            .map(|label| match label {
                "*" => Ok(HostLabel::Any),
                _ => match label.strip_prefix(':') {
                    Some(name) if valid_name(name) => Ok(HostLabel::Param(name.to_owned())),
                    Some(_) => Err(PatternError::InvalidParameter {
                        pattern: pattern.to_owned(),
                    }),
                    None => Ok(HostLabel::Static(label.to_owned())),
                },
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source,
            matcher: HostMatcher::Labels(labels),
        })
    }

    /// Compile a regex host pattern. Named groups become host parameters.
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(&format!("(?i)^(?:{pattern})$")).map_err(|source| {
            PatternError::Constraint {
                pattern: pattern.to_owned(),
                source,
            }
        })?;
        Ok(Self {
            source: pattern.to_owned(),
            matcher: HostMatcher::Regex(regex),
        })
    }

    /// The pattern as written (lowercased for label patterns).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match `host`, returning captured host parameters.
    pub fn matches(&self, host: &str) -> Option<Parameters> {
        let host = host.to_ascii_lowercase();
        match &self.matcher {
            HostMatcher::Labels(labels) => {
                let parts: Vec<&str> = host.split('.').collect();
                if parts.len() != labels.len() {
                    return None;
                }
                let mut params = Parameters::new();
                for (label, part) in labels.iter().zip(parts) {
                    match label {
                        HostLabel::Static(expected) if expected != part => return None,
                        HostLabel::Static(_) | HostLabel::Any => {}
                        HostLabel::Param(name) => params.insert(name.clone(), part),
                    }
                }
                Some(params)
            }
            HostMatcher::Regex(regex) => {
                let captures = regex.captures(&host)?;
                Some(
                    regex
                        .capture_names()
                        .flatten()
                        .filter_map(|name| captures.name(name).map(|m| (name, m.as_str())))
                        .collect(),
                )
            }
        }
    }
}
