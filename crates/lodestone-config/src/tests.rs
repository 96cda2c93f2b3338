//! Unit tests for configuration loading.

use std::io::Write;

use lodestone_types::TenantMode;

use crate::{ConfigLoader, DatabaseConfiguration, Knobs, LodestoneConfig, RegionConfig};

#[test]
fn defaults_are_valid() {
    let knobs = Knobs::default();
    assert!(knobs.concurrent_audit_task_count_max > 0);
    assert!(knobs.shard_min_bytes < knobs.shard_max_bytes);

    let db = DatabaseConfiguration::default();
    assert_eq!(db.replication_factor, 3);
    assert_eq!(db.usable_regions, 1);
}

#[test]
fn primary_and_remote_dc_selection() {
    let db = DatabaseConfiguration {
        usable_regions: 2,
        regions: vec![
            RegionConfig {
                dc: "dc-east".into(),
                primary: true,
            },
            RegionConfig {
                dc: "dc-west".into(),
                primary: false,
            },
        ],
        ..DatabaseConfiguration::default()
    };
    assert_eq!(db.primary_dc(), Some("dc-east"));
    assert_eq!(db.remote_dcs(), vec!["dc-west"]);
}

#[test]
fn project_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lodestone.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
[knobs]
dd_move_keys_parallelism = 4

[database]
replication_factor = 5
tenant_mode = "Optional"
"#
    )
    .unwrap();

    let cfg = ConfigLoader::new()
        .with_project_dir(dir.path())
        .with_env_prefix("LODESTONE_TEST_UNSET")
        .load()
        .unwrap();

    assert_eq!(cfg.knobs.dd_move_keys_parallelism, 4);
    assert_eq!(cfg.database.replication_factor, 5);
    assert_eq!(cfg.database.tenant_mode, TenantMode::Optional);
    // Untouched knobs keep their defaults.
    assert_eq!(
        cfg.knobs.audit_retry_count_max,
        Knobs::default().audit_retry_count_max
    );
}

#[test]
fn invalid_configuration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lodestone.toml");
    std::fs::write(&path, "[database]\nreplication_factor = 0\n").unwrap();

    let result = ConfigLoader::new()
        .with_project_dir(dir.path())
        .with_env_prefix("LODESTONE_TEST_UNSET")
        .load();
    assert!(result.is_err());
}

#[test]
fn two_regions_require_a_remote() {
    let cfg = LodestoneConfig {
        database: DatabaseConfiguration {
            usable_regions: 2,
            regions: vec![RegionConfig {
                dc: "only".into(),
                primary: true,
            }],
            ..DatabaseConfiguration::default()
        },
        ..LodestoneConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lodestone.toml"),
        toml::to_string(&cfg).unwrap(),
    )
    .unwrap();

    let result = ConfigLoader::new()
        .with_project_dir(dir.path())
        .with_env_prefix("LODESTONE_TEST_UNSET")
        .load();
    assert!(result.is_err());
}
