//! Entity references: the closed set of entity types a frame can target.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::status::{text_enum, ParseEnumError};

text_enum! {
    /// Entity types the governance layer knows how to load.
    pub enum EntityType {
        Job => "job",
        Chunk => "chunk",
        WorkUnit => "work_unit",
    }
}

/// A typed `entity_type:entity_id` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn job(id: impl Into<String>) -> Self {
        Self::new(EntityType::Job, id)
    }

    pub fn chunk(id: impl Into<String>) -> Self {
        Self::new(EntityType::Chunk, id)
    }

    pub fn work_unit(id: impl Into<String>) -> Self {
        Self::new(EntityType::WorkUnit, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| ParseEnumError {
            kind: "EntityRef",
            value: s.to_string(),
        })?;
        if id.is_empty() {
            return Err(ParseEnumError {
                kind: "EntityRef",
                value: s.to_string(),
            });
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let r = EntityRef::work_unit("u-1");
        assert_eq!(r.to_string(), "work_unit:u-1");
        assert_eq!("work_unit:u-1".parse::<EntityRef>().unwrap(), r);
    }

    #[test]
    fn test_parse_rejects_malformed_refs() {
        assert!("job".parse::<EntityRef>().is_err());
        assert!("job:".parse::<EntityRef>().is_err());
        assert!("course:42".parse::<EntityRef>().is_err());
    }
}
