//! Grouping modes requested from the storage engine.

use std::fmt;

/// How a grouped read partitions series into tables.
///
/// Exactly one mode applies to a read; modes never combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupMode {
    /// No grouping requested; the engine picks its default (one table per series).
    #[default]
    Default,
    /// Merges all series into a single group.
    None,
    /// Produces a separate table for each series.
    All,
    /// Produces a table for each unique value of the group keys.
    By,
    /// Produces a table for each unique value of all keys except the group keys.
    Except,
}

impl GroupMode {
    /// Whether the group keys of a read are meaningful under this mode
    pub fn uses_keys(&self) -> bool {
        matches!(self, GroupMode::By | GroupMode::Except)
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupMode::Default => "default",
            GroupMode::None => "none",
            GroupMode::All => "all",
            GroupMode::By => "by",
            GroupMode::Except => "except",
        };
        f.write_str(name)
    }
}

/// Grouping mode as the query engine hands it over.
///
/// The engine encodes its modes as raw flag values, so a value this crate
/// does not know about can reach [`to_group_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineGroupMode(pub u8);

impl EngineGroupMode {
    pub const NONE: EngineGroupMode = EngineGroupMode(0);
    pub const BY: EngineGroupMode = EngineGroupMode(1 << 0);
    pub const EXCEPT: EngineGroupMode = EngineGroupMode(1 << 1);
}

/// Maps the engine's grouping mode onto the storage grouping mode.
///
/// # Panics
///
/// Panics on any engine mode other than `NONE`, `BY` or `EXCEPT`: an
/// unmapped value means the engine grew a mode this mapping was never
/// taught about.
pub fn to_group_mode(mode: EngineGroupMode) -> GroupMode {
    match mode {
        EngineGroupMode::NONE => GroupMode::Default,
        EngineGroupMode::BY => GroupMode::By,
        EngineGroupMode::EXCEPT => GroupMode::Except,
        EngineGroupMode(other) => panic!("unknown group mode: {}", other),
    }
}
