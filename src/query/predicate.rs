use std::collections::{BTreeMap, HashMap};
use std::sync::{OnceLock, RwLock};

use regex::Regex;

/// Compiled tag patterns, `None` for patterns that failed to compile
static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Option<Regex>>>> = OnceLock::new();

/// Comparison applied to a single tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilterOp {
    Eq,
    Neq,
    Regex,
    NotRegex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub op: TagFilterOp,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, op: TagFilterOp, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    /// A missing tag compares as the empty string
    fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        let actual = tags.get(&self.key).map(String::as_str).unwrap_or("");
        match self.op {
            TagFilterOp::Eq => actual == self.value,
            TagFilterOp::Neq => actual != self.value,
            // an invalid pattern matches nothing, negated or not
            TagFilterOp::Regex => compiled(&self.value).is_some_and(|re| re.is_match(actual)),
            TagFilterOp::NotRegex => compiled(&self.value).is_some_and(|re| !re.is_match(actual)),
        }
    }
}

/// Get or compile a pattern, caching failures as well
fn compiled(pattern: &str) -> Option<Regex> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    {
        let cached = match cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(re) = cached.get(pattern) {
            return re.clone();
        }
    }

    let re = Regex::new(pattern).ok();
    let mut cached = match cache.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    cached.entry(pattern.to_string()).or_insert_with(|| re.clone());
    re
}

/// Filter expression pushed down to the storage engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Tag(TagFilter),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn tag(key: impl Into<String>, op: TagFilterOp, value: impl Into<String>) -> Self {
        Self::Tag(TagFilter::new(key, op, value))
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the predicate against the tag set of one series
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            Predicate::Tag(filter) => filter.matches(tags),
            Predicate::And(left, right) => left.matches(tags) && right.matches(tags),
            Predicate::Or(left, right) => left.matches(tags) || right.matches(tags),
            Predicate::Not(expr) => !expr.matches(tags),
        }
    }

    /// Returns the tag keys referenced by the predicate, in first-seen order
    pub fn tag_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, keys: &mut Vec<&'a str>) {
        match self {
            Predicate::Tag(filter) => {
                if !keys.contains(&filter.key.as_str()) {
                    keys.push(&filter.key);
                }
            }
            Predicate::And(left, right) | Predicate::Or(left, right) => {
                left.collect_keys(keys);
                right.collect_keys(keys);
            }
            Predicate::Not(expr) => expr.collect_keys(keys),
        }
    }
}
