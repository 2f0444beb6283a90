//! Destination name filters.
//!
//! A filter is split on `/` into levels. `+` matches exactly one level, `#` matches the rest
//! of the name (including nothing) and must be the last level. Names whose first level starts
//! with `$` are only matched by filters that also start with `$`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter `{0}`, {1}")]
    Invalid(String, &'static str),
}

#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $schema, $SYS
    Blank,
    SingleWildcard, // +
    MultiWildcard,  // #
}

impl Level {
    #[inline]
    fn parse(s: &str) -> Level {
        match s {
            "" => Level::Blank,
            "+" => Level::SingleWildcard,
            "#" => Level::MultiWildcard,
            s if s.starts_with('$') => Level::Metadata(s.into()),
            s => Level::Normal(s.into()),
        }
    }

    #[inline]
    fn is_wildcard(&self) -> bool {
        matches!(self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    fn match_str(&self, level: &str) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => s == level,
            Level::Blank => level.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
pub struct Filter(Vec<Level>);

impl Filter {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    /// Whether the destination `name` is covered by this filter.
    pub fn matches(&self, name: &str) -> bool {
        let mut names = name.split('/').peekable();
        if self.0.first().map(Level::is_wildcard).unwrap_or(false)
            && names.peek().map(|l| l.starts_with('$')).unwrap_or(false)
        {
            return false;
        }

        for level in self.0.iter() {
            match level {
                Level::MultiWildcard => return true,
                _ => match names.next() {
                    Some(n) if level.match_str(n) => continue,
                    _ => return false,
                },
            }
        }
        names.next().is_none()
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s.split('/').map(Level::parse).collect::<Vec<_>>();
        for (pos, level) in levels.iter().enumerate() {
            match level {
                Level::MultiWildcard if pos != levels.len() - 1 => {
                    return Err(FilterError::Invalid(s.into(), "`#` must be the last level"))
                }
                Level::Normal(l) | Level::Metadata(l) if l.contains(['+', '#']) => {
                    return Err(FilterError::Invalid(s.into(), "wildcard mixed into a level"))
                }
                _ => {}
            }
        }
        Ok(Filter(levels))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in self.0.iter() {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            match level {
                Level::Normal(s) | Level::Metadata(s) => f.write_str(s)?,
                Level::Blank => {}
                Level::SingleWildcard => f.write_str("+")?,
                Level::MultiWildcard => f.write_str("#")?,
            }
        }
        Ok(())
    }
}
