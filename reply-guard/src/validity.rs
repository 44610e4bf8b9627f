//! Reply validity check.
//!
//! A reply is accepted when at least one primary or alternate content tag
//! pair wraps something other than whitespace. Pairs are matched lazily so
//! `<content></content><content>x</content>` is two pairs, and unmatched
//! open or close tags never count.

use regex_lite::Regex;

use crate::config::ReplyTags;
use crate::error::ReplyGuardError;
use crate::error::Result;

#[derive(Debug, Clone)]
struct TagMatcher {
    name: String,
    pattern: Regex,
}

impl TagMatcher {
    fn compile(name: &str) -> Result<Self> {
        validate_tag_name(name)?;
        let escaped = regex_lite::escape(name);
        let regex = format!(r"(?s)<{escaped}>(.*?)</{escaped}>");
        let pattern = Regex::new(&regex).map_err(|source| ReplyGuardError::TagPattern {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            pattern,
        })
    }

    fn has_non_empty_pair(&self, text: &str) -> bool {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .any(|inner| !inner.as_str().trim().is_empty())
    }
}

fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReplyGuardError::InvalidTag {
            name: name.to_string(),
            reason: "tag name is empty",
        });
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':');
    if !name.chars().all(allowed) {
        return Err(ReplyGuardError::InvalidTag {
            name: name.to_string(),
            reason: "only ASCII letters, digits, '_', '-' and ':' are allowed",
        });
    }
    Ok(())
}

/// Decides whether a reply carries enough tagged content to be accepted.
#[derive(Debug, Clone)]
pub struct ValidityPredicate {
    primary: TagMatcher,
    alternate: TagMatcher,
}

impl ValidityPredicate {
    /// Compiles matchers for the configured primary and alternate tags.
    pub fn new(tags: &ReplyTags) -> Result<Self> {
        Ok(Self {
            primary: TagMatcher::compile(&tags.primary)?,
            alternate: TagMatcher::compile(&tags.alternate)?,
        })
    }

    /// Returns true if any primary or alternate pair has non-blank content.
    pub fn is_valid(&self, text: &str) -> bool {
        self.primary.has_non_empty_pair(text) || self.alternate.has_non_empty_pair(text)
    }

    /// Same as [`Self::is_valid`] for text that may be absent; absent is invalid.
    pub fn is_valid_opt(&self, text: Option<&str>) -> bool {
        text.is_some_and(|text| self.is_valid(text))
    }

    pub fn primary_tag(&self) -> &str {
        &self.primary.name
    }

    pub fn alternate_tag(&self) -> &str {
        &self.alternate.name
    }
}
