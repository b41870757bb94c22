//! Subject pattern matching for dot-separated topics
//!
//! Patterns are a restricted grammar, not regex: `*` matches exactly one
//! token, `>` matches one or more remaining tokens and must be the final
//! token. Each pattern compiles once into a token array and matches via a
//! linear scan.

use crate::error::{HubError, Result};

/// Maximum length of a publishable topic
pub const MAX_TOPIC_LEN: usize = 255;

/// One token of a compiled pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    /// `*` - exactly one token
    Star,
    /// `>` - one or more remaining tokens, final position only
    Tail,
}

/// A compiled subject pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

impl Pattern {
    /// Compile a pattern string, validating the grammar
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| HubError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if pattern.len() > MAX_TOPIC_LEN {
            return Err(invalid("pattern exceeds 255 characters"));
        }
        if pattern.starts_with('$') || pattern.starts_with('.') {
            return Err(invalid("pattern cannot start with '$' or '.'"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(invalid("empty token")),
                "*" => Token::Star,
                ">" => {
                    if i != parts.len() - 1 {
                        return Err(invalid("'>' must be the final token"));
                    }
                    Token::Tail
                }
                literal => {
                    if literal.contains(['*', '>']) {
                        return Err(invalid("wildcards cannot be embedded in a token"));
                    }
                    if literal.chars().any(char::is_whitespace) {
                        return Err(invalid("token contains whitespace"));
                    }
                    Token::Literal(literal.to_string())
                }
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// The original pattern text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains any wildcard token
    pub fn has_wildcard(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Star | Token::Tail))
    }

    /// Linear-scan match against a concrete topic
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        let mut i = 0;

        for token in &self.tokens {
            match token {
                Token::Literal(lit) => {
                    if i >= parts.len() || parts[i] != lit {
                        return false;
                    }
                    i += 1;
                }
                Token::Star => {
                    if i >= parts.len() {
                        return false;
                    }
                    i += 1;
                }
                // `>` requires at least one remaining token
                Token::Tail => return i < parts.len(),
            }
        }

        i == parts.len()
    }

    /// Specificity score: `10 * len(tokens) + sum(score(token))` where a
    /// literal scores +1, `*` scores -5, and `>` scores -100
    pub fn specificity(&self) -> i64 {
        let token_sum: i64 = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Literal(_) => 1,
                Token::Star => -5,
                Token::Tail => -100,
            })
            .sum();
        10 * self.tokens.len() as i64 + token_sum
    }

    /// Database-friendly prefix: the pattern text cut at the first wildcard
    ///
    /// `orders.us.*` expands to `orders.us.`; a wildcard-free pattern expands
    /// to itself.
    pub fn prefix(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => {
                    out.push_str(lit);
                    out.push('.');
                }
                Token::Star | Token::Tail => return out,
            }
        }
        // No wildcard: drop the trailing separator
        out.pop();
        out
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Find the highest-scoring matching pattern; ties resolve lexicographically
/// so lookup stays deterministic
pub fn best_match<'a>(patterns: &'a [Pattern], topic: &str) -> Option<&'a Pattern> {
    patterns
        .iter()
        .filter(|p| p.matches(topic))
        .max_by(|a, b| {
            a.specificity()
                .cmp(&b.specificity())
                // Reversed so the lexicographically smallest wins the tie
                .then_with(|| b.raw.cmp(&a.raw))
        })
}

/// Validate a publishable topic: dotted literals only, no wildcards
pub fn validate_topic(topic: &str) -> Result<()> {
    let invalid = |reason: &str| HubError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(invalid("topic exceeds 255 characters"));
    }
    if topic.starts_with('$') || topic.starts_with('.') {
        return Err(invalid("topic cannot start with '$' or '.'"));
    }

    for part in topic.split('.') {
        if part.is_empty() {
            return Err(invalid("empty token"));
        }
        if part == "*" || part == ">" || part.contains(['*', '>']) {
            return Err(invalid("wildcards are not allowed in topics"));
        }
        if part.chars().any(char::is_whitespace) {
            return Err(invalid("token contains whitespace"));
        }
    }

    Ok(())
}
