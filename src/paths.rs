//! Turning expanded pattern text into a well formed slug.
//!
//! A slug is a `/` separated path that always starts with `/`, never has empty segments and
//! never carries a query or fragment. Each segment is cleaned with the site's [SlugFormat].
use std::{borrow::Cow, collections::BTreeSet};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::config::SiteConfig;

/// Site-specific cleaning rules, cached on the resolution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugFormat {
    pub forbidden: BTreeSet<char>,
    pub replacement: char,
    pub lowercase: bool,
}

impl Default for SlugFormat {
    fn default() -> Self {
        SlugFormat::from(&SiteConfig::default())
    }
}

impl From<&SiteConfig> for SlugFormat {
    fn from(config: &SiteConfig) -> Self {
        SlugFormat {
            forbidden: config.forbidden_chars.chars().collect(),
            replacement: config.replacement_char,
            lowercase: config.lowercase,
        }
    }
}

impl SlugFormat {
    fn is_forbidden(&self, c: char) -> bool {
        c.is_whitespace() || c.is_control() || self.forbidden.contains(&c)
    }

    fn is_unreserved(&self, c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '-' | '_' | '~') || c == self.replacement
    }

    /// Clean one path segment. Returns an empty string when nothing usable is left.
    pub fn clean_segment(&self, segment: &str) -> String {
        let mut out = String::with_capacity(segment.len());
        let mut last_was_replacement = false;
        for c in segment.nfd().filter(|c| !is_combining_mark(*c)) {
            if self.is_forbidden(c) || c == self.replacement {
                if !last_was_replacement && !out.is_empty() {
                    out.push(self.replacement);
                }
                last_was_replacement = true;
                continue;
            }
            last_was_replacement = false;
            if self.is_unreserved(c) {
                if self.lowercase {
                    out.extend(c.to_lowercase());
                } else {
                    out.push(c);
                }
            } else {
                let mut buf = [0u8; 4];
                out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
            }
        }
        while out.ends_with(self.replacement) {
            out.pop();
        }
        out
    }
}

/// Drop anything after the first `?` or `#`.
pub fn strip_query(raw: &str) -> &str {
    match raw.find(['?', '#']) {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

/// Percent-decode, keeping the input when it does not decode to UTF-8.
pub fn percent_decode(raw: &str) -> Cow<'_, str> {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!("Keeping undecodable slug text '{}': {}", raw, e);
            Cow::Borrowed(raw)
        }
    }
}

/// Normalize expanded pattern text into a slug: strip query and fragment, percent-decode,
/// split on `/` (which collapses repeated separators), clean every segment and rejoin.
pub fn normalize_slug(raw: &str, format: &SlugFormat) -> String {
    let decoded = percent_decode(strip_query(raw.trim()));
    let segments: Vec<String> = decoded
        .split(['/', '\\'])
        .map(|segment| format.clean_segment(segment))
        .filter(|segment| !segment.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

/// Join a parent slug and a child segment without doubling separators.
pub fn join_slug(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{parent}/{child}")
}

/// Turn a document name into an alias path segment.
pub fn to_alias_segment(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(char::is_whitespace, "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect()
}

/// Append `-{suffix}` to the last segment of `slug`.
pub fn with_suffix(slug: &str, suffix: u32) -> String {
    let trimmed = slug.trim_end_matches('/');
    if trimmed.is_empty() {
        return format!("/{suffix}");
    }
    format!("{trimmed}-{suffix}")
}
