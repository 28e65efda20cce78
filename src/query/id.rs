use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

const ID_LENGTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid id length: expected 16 characters, got {0}")]
    InvalidLength(usize),
    #[error("Invalid id encoding: {0}")]
    InvalidEncoding(String),
    #[error("Id must not be zero")]
    Zero,
}

/// Identifier of an organization or bucket in the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub fn new(raw: u64) -> Result<Self, IdError> {
        if raw == 0 {
            return Err(IdError::Zero);
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LENGTH {
            return Err(IdError::InvalidLength(s.len()));
        }
        let raw = u64::from_str_radix(s, 16).map_err(|e| IdError::InvalidEncoding(e.to_string()))?;
        Self::new(raw)
    }
}

/// Identifies the output stream of one source, so sinks can tell producers apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetId(Uuid);

impl DatasetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DatasetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
