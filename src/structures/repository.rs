/// One versioned installation component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Repository {
  BaseGame,
  Expansion(u8),
  Boot,
}

/// Version reported for a repository that has never been installed or stamped.
pub const BASE_GAME_VERSION: &str = "2000.01.01.0000.0000";

/// `expansion_version` value marking a boot repository's patch index.
pub const EXPAC_VERSION_BOOT: i32 = -1;
