//! Configuration planes for Purser.
//!
//! Purser reads four INI files, each wrapped in its own [`ConfigStore`]
//! handle so that mutations cannot leak between planes:
//!
//! ## purser.ini - user state (mutable)
//!
//! Located at `/etc/purser/purser.ini`. Canonical location for the
//! registration record (certificate, private key, per-scope credentials),
//! release and flavour choices, and the cached architecture. This is the
//! only file the library writes.
//!
//! ## purser-defaults.ini - vendor defaults (read-only)
//!
//! Carries schema versions as top-level groups (`[1]`, `[2]`, ...) plus a
//! `configVersion` marker. Consumed only by the [`migration`] pass, which
//! upgrades the user state to the newest schema without clobbering values
//! the user has customised.
//!
//! ## repos.ini - repository URL templates (read-only)
//!
//! Groups named `release`, `rnd`, `all`, and one group per flavour
//! (`<flavour>-flavour`). Each entry maps a repository name to a URL
//! template with `%(variable)` tokens.
//!
//! ## board-mappings.ini - device identification table (read-only)
//!
//! Groups `file.exists`, `systeminfo.equals`, `cpuinfo.contains` and
//! `arch.equals` drive the ordered model probing, `variants` aliases
//! model names, and `[<model>] family=` assigns the device family.
//!
//! ## Addressing
//!
//! A plain `(group, key)` pair addresses `key` inside `[group]`; the empty
//! group addresses the file's section-less general area. A *path key* of
//! the form `group/key` is split at the first `/`, mirroring the
//! hierarchical store the configuration format descends from.

pub mod migration;
pub mod store;

pub use store::ConfigStore;

/// Default location of the mutable user state plane.
pub const USER_CONFIG_PATH: &str = "/etc/purser/purser.ini";

/// Default location of the vendor default template.
pub const DEFAULT_CONFIG_PATH: &str = "/usr/share/purser/purser-defaults.ini";

/// Default location of the repository URL templates.
pub const REPO_CONFIG_PATH: &str = "/usr/share/purser/repos.ini";

/// Default location of the board mapping table.
pub const BOARD_MAPPING_PATH: &str = "/usr/share/purser/board-mappings.ini";
