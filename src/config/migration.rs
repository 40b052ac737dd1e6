//! Schema migration of the user state plane against the vendor defaults.
//!
//! The vendor default template carries one group per schema version; the
//! migration walks every version above the user state's `configVersion`,
//! adds keys the user state lacks, and updates keys whose default changed
//! *only* when the user is still on the previous default. Customised
//! values are never clobbered.

use log::debug;

use super::store::ConfigStore;

/// Bring `user` up to the schema version of `defaults`.
///
/// Pure with respect to the filesystem: both stores are in-memory maps and
/// the caller decides when to [`ConfigStore::sync`]. Returns `true` if any
/// key changed. Running it a second time is a no-op.
pub fn run(user: &mut ConfigStore, defaults: &ConfigStore) -> bool {
    let user_version = user.get_i64("", "configVersion").unwrap_or(0);
    let default_version = defaults.get_i64("", "configVersion").unwrap_or(0);

    if user_version >= default_version {
        return false;
    }

    debug!(
        "configuration is outdated, updating from {} to {}",
        user_version, default_version
    );

    for version in user_version + 1..=default_version {
        let group = version.to_string();
        debug!("processing configuration version {}", version);

        for key in defaults.keys(&group) {
            let new_value = defaults.get(&group, &key).unwrap_or_default().to_string();

            if !user.contains_path(&key) {
                debug!("adding new key: {}", key);
                user.set_path(&key, new_value);
                continue;
            }

            // An older default is needed to prove the default changed at
            // all; without one the user value is left alone.
            let old_value = (1..version)
                .rev()
                .find_map(|j| defaults.get(&j.to_string(), &key));
            let Some(old_value) = old_value else {
                continue;
            };

            if old_value == new_value {
                continue;
            }

            let current = user.get_path(&key).unwrap_or_default().to_string();
            if current == old_value {
                debug!("updating {} from {} to {}", key, current, new_value);
                user.set_path(&key, new_value);
            }
        }
        user.set("", "configVersion", version.to_string());
    }
    true
}

/// Seed the cached architecture with the compile-time identifier when the
/// user state does not carry one yet.
pub fn seed_arch(user: &mut ConfigStore) {
    if !user.contains("", "arch") {
        user.set("", "arch", std::env::consts::ARCH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str) -> ConfigStore {
        ConfigStore::open(dir.path().join(name)).unwrap()
    }

    fn defaults_v2(dir: &TempDir) -> ConfigStore {
        let mut defaults = open(dir, "defaults.ini");
        defaults.set("", "configVersion", "2");
        defaults.set("1", "foo", "a");
        defaults.set("2", "foo", "b");
        defaults.set("2", "bar", "c");
        defaults
    }

    // ==================== Migration Scenario Tests ====================

    #[test]
    fn test_fresh_migration_copies_all_keys() {
        let dir = TempDir::new().unwrap();
        let defaults = defaults_v2(&dir);
        let mut user = open(&dir, "user.ini");

        assert!(run(&mut user, &defaults));

        assert_eq!(user.get("", "foo"), Some("b"));
        assert_eq!(user.get("", "bar"), Some("c"));
        assert_eq!(user.get_i64("", "configVersion"), Some(2));
    }

    #[test]
    fn test_customised_key_not_clobbered() {
        let dir = TempDir::new().unwrap();
        let defaults = defaults_v2(&dir);
        let mut user = open(&dir, "user.ini");
        user.set("", "foo", "custom");
        user.set("", "configVersion", "1");

        run(&mut user, &defaults);

        assert_eq!(user.get("", "foo"), Some("custom"));
        assert_eq!(user.get("", "bar"), Some("c"));
        assert_eq!(user.get_i64("", "configVersion"), Some(2));
    }

    #[test]
    fn test_default_update_applied_to_unchanged_user() {
        let dir = TempDir::new().unwrap();
        let defaults = defaults_v2(&dir);
        let mut user = open(&dir, "user.ini");
        user.set("", "foo", "a");
        user.set("", "configVersion", "1");

        run(&mut user, &defaults);

        assert_eq!(user.get("", "foo"), Some("b"));
        assert_eq!(user.get("", "bar"), Some("c"));
        assert_eq!(user.get_i64("", "configVersion"), Some(2));
    }

    #[test]
    fn test_no_prior_default_skips_update() {
        let dir = TempDir::new().unwrap();
        let mut defaults = open(&dir, "defaults.ini");
        defaults.set("", "configVersion", "2");
        // "bar" appears for the first time in version 2, but the user
        // already has a value for it from elsewhere.
        defaults.set("2", "bar", "new-default");
        let mut user = open(&dir, "user.ini");
        user.set("", "bar", "preexisting");
        user.set("", "configVersion", "1");

        run(&mut user, &defaults);

        assert_eq!(user.get("", "bar"), Some("preexisting"));
    }

    #[test]
    fn test_unchanged_default_skips_update() {
        let dir = TempDir::new().unwrap();
        let mut defaults = open(&dir, "defaults.ini");
        defaults.set("", "configVersion", "2");
        defaults.set("1", "foo", "same");
        defaults.set("2", "foo", "same");
        let mut user = open(&dir, "user.ini");
        user.set("", "foo", "mine");
        user.set("", "configVersion", "1");

        run(&mut user, &defaults);

        assert_eq!(user.get("", "foo"), Some("mine"));
    }

    #[test]
    fn test_path_keys_land_in_sections() {
        let dir = TempDir::new().unwrap();
        let mut defaults = open(&dir, "defaults.ini");
        defaults.set("", "configVersion", "1");
        defaults.set("1", "repository-urls/main", "https://r.example/main");
        let mut user = open(&dir, "user.ini");

        run(&mut user, &defaults);

        assert_eq!(
            user.get("repository-urls", "main"),
            Some("https://r.example/main")
        );
    }

    #[test]
    fn test_migration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let defaults = defaults_v2(&dir);
        let mut user = open(&dir, "user.ini");

        assert!(run(&mut user, &defaults));
        assert!(!run(&mut user, &defaults));
        assert_eq!(user.get("", "foo"), Some("b"));
        assert_eq!(user.get_i64("", "configVersion"), Some(2));
    }

    #[test]
    fn test_user_ahead_of_defaults_untouched() {
        let dir = TempDir::new().unwrap();
        let defaults = defaults_v2(&dir);
        let mut user = open(&dir, "user.ini");
        user.set("", "configVersion", "5");
        user.set("", "foo", "mine");

        assert!(!run(&mut user, &defaults));
        assert_eq!(user.get_i64("", "configVersion"), Some(5));
        assert_eq!(user.get("", "foo"), Some("mine"));
    }

    // ==================== Arch Seeding Tests ====================

    #[test]
    fn test_seed_arch_only_when_absent() {
        let dir = TempDir::new().unwrap();
        let mut user = open(&dir, "user.ini");

        seed_arch(&mut user);
        assert_eq!(user.get("", "arch"), Some(std::env::consts::ARCH));

        user.set("", "arch", "armv7hl");
        seed_arch(&mut user);
        assert_eq!(user.get("", "arch"), Some("armv7hl"));
    }
}
