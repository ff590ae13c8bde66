//! Planning layout migrations for filesystem sources.
//!
//! Migrations only plan. A planner reports whether a source root is in a
//! deprecated shape and which moves and cleanups would bring it to the
//! current one; actually applying the plan is the invoker's job, which is
//! expected to run every move before any cleanup and may retry moves
//! independently.

use std::path::{Path, PathBuf};

use log::debug;

//------------ StoreMigration ------------------------------------------------

/// A planner for one deprecated source layout.
pub trait StoreMigration {
    /// Short name of what gets migrated.
    fn subject(&self) -> &str;

    /// Human-readable description of the layout change.
    fn description(&self) -> &str;

    /// Whether the source root is in the deprecated shape.
    ///
    /// Only inspects metadata; never reads file content or changes
    /// anything.
    fn is_applicable(&self, root: &Path) -> bool;

    /// The `(from, to)` pairs to move, in order.
    fn moves(&self, root: &Path) -> Vec<(PathBuf, PathBuf)>;

    /// Paths to delete once all moves have been applied, with a flag for
    /// recursive deletion.
    fn cleanups(&self, root: &Path) -> Vec<(PathBuf, bool)>;
}

//------------ FlatLayoutMigration -------------------------------------------

/// Migrates the original flat layout to content-kind directories.
///
/// Early versions kept entity values under `conf/` and binary resources
/// under `static/` at the source root. The current layout uses
/// `entities/` and `resources/`.
pub struct FlatLayoutMigration;

const LEGACY_DIRS: &[(&str, &str)] = &[("conf", "entities"), ("static", "resources")];

impl StoreMigration for FlatLayoutMigration {
    fn subject(&self) -> &str {
        "flat source layout"
    }

    fn description(&self) -> &str {
        "move 'conf/' and 'static/' trees to 'entities/' and 'resources/'"
    }

    fn is_applicable(&self, root: &Path) -> bool {
        let applicable = LEGACY_DIRS.iter().any(|(legacy, current)| {
            root.join(legacy).is_dir() && !root.join(current).exists()
        });
        if applicable {
            debug!("'{}' uses the {}", root.display(), self.subject());
        }
        applicable
    }

    fn moves(&self, root: &Path) -> Vec<(PathBuf, PathBuf)> {
        LEGACY_DIRS
            .iter()
            .filter(|(legacy, current)| {
                root.join(legacy).is_dir() && !root.join(current).exists()
            })
            .map(|(legacy, current)| (root.join(legacy), root.join(current)))
            .collect()
    }

    fn cleanups(&self, root: &Path) -> Vec<(PathBuf, bool)> {
        self.moves(root)
            .into_iter()
            .map(|(from, _)| (from, true))
            .collect()
    }
}

//------------ Tests ---------------------------------------------------------
