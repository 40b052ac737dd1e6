//! Schema migration scenarios exercised through facade construction.

mod common;

use common::{BenchPlatform, Planes, Recorder};
use purser::{ConfigStore, Purser};

fn construct(planes: &Planes) {
    let purser = Purser::with_parts(
        planes.paths(),
        Box::new(BenchPlatform),
        Box::new(Recorder::default()),
    )
    .unwrap();
    drop(purser);
}

fn user_plane(planes: &Planes) -> ConfigStore {
    ConfigStore::open(planes.path("purser.ini")).unwrap()
}

const DEFAULTS_V2: &str = "configVersion=2\n[1]\nfoo=a\n[2]\nfoo=b\nbar=c\n";

#[test]
fn test_fresh_migration() {
    let planes = Planes::new();
    planes.write("purser-defaults.ini", DEFAULTS_V2);

    construct(&planes);

    let user = user_plane(&planes);
    assert_eq!(user.get("", "foo"), Some("b"));
    assert_eq!(user.get("", "bar"), Some("c"));
    assert_eq!(user.get_i64("", "configVersion"), Some(2));
}

#[test]
fn test_customised_value_survives_migration() {
    let planes = Planes::new();
    planes.write("purser-defaults.ini", DEFAULTS_V2);
    planes.write("purser.ini", "foo=custom\nconfigVersion=1\n");

    construct(&planes);

    let user = user_plane(&planes);
    assert_eq!(user.get("", "foo"), Some("custom"));
    assert_eq!(user.get("", "bar"), Some("c"));
    assert_eq!(user.get_i64("", "configVersion"), Some(2));
}

#[test]
fn test_old_default_is_upgraded() {
    let planes = Planes::new();
    planes.write("purser-defaults.ini", DEFAULTS_V2);
    planes.write("purser.ini", "foo=a\nconfigVersion=1\n");

    construct(&planes);

    let user = user_plane(&planes);
    assert_eq!(user.get("", "foo"), Some("b"));
    assert_eq!(user.get("", "bar"), Some("c"));
    assert_eq!(user.get_i64("", "configVersion"), Some(2));
}

#[test]
fn test_second_construction_changes_nothing() {
    let planes = Planes::new();
    planes.write("purser-defaults.ini", DEFAULTS_V2);

    construct(&planes);
    let first = std::fs::read_to_string(planes.path("purser.ini")).unwrap();

    construct(&planes);
    let second = std::fs::read_to_string(planes.path("purser.ini")).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_arch_is_seeded_once() {
    let planes = Planes::new();

    construct(&planes);
    let user = user_plane(&planes);
    assert_eq!(user.get("", "arch"), Some(std::env::consts::ARCH));

    planes.write("purser.ini", "arch=armv7hl\n");
    construct(&planes);
    let user = user_plane(&planes);
    assert_eq!(user.get("", "arch"), Some("armv7hl"));
}
