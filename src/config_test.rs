use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NODE_ID".into(), "3".into()),
        ("SESSION_TIMEOUT_MS".into(), "9000".into()),
        ("LIVENESS_CHECK_INTERVAL_MS".into(), "250".into()),
        ("RETAINED_SNAPSHOTS".into(), "5".into()),
    ])?;
    let config = config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.node_id == 3, "unexpected value parsed for NODE_ID, got {}, expected {}", config.node_id, 3);
    assert!(
        config.session_timeout() == Duration::from_millis(9000),
        "unexpected value parsed for SESSION_TIMEOUT_MS, got {:?}, expected {:?}",
        config.session_timeout(),
        Duration::from_millis(9000)
    );
    assert!(
        config.liveness_check_interval() == Duration::from_millis(250),
        "unexpected value parsed for LIVENESS_CHECK_INTERVAL_MS, got {:?}, expected {:?}",
        config.liveness_check_interval(),
        Duration::from_millis(250)
    );
    assert!(
        config.retained_snapshots == 5,
        "unexpected value parsed for RETAINED_SNAPSHOTS, got {}, expected {}",
        config.retained_snapshots,
        5
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "error".into()), ("NODE_ID".into(), "0".into())])?;
    let config = config.validate()?;

    assert!(config.node_id == 0, "unexpected value parsed for NODE_ID, got {}, expected {}", config.node_id, 0);
    assert!(
        config.session_timeout_ms == 18_000,
        "unexpected default for SESSION_TIMEOUT_MS, got {}, expected {}",
        config.session_timeout_ms,
        18_000
    );
    assert!(
        config.liveness_check_interval_ms == 1_000,
        "unexpected default for LIVENESS_CHECK_INTERVAL_MS, got {}, expected {}",
        config.liveness_check_interval_ms,
        1_000
    );
    assert!(
        config.retained_snapshots == 3,
        "unexpected default for RETAINED_SNAPSHOTS, got {}, expected {}",
        config.retained_snapshots,
        3
    );

    Ok(())
}

#[test]
fn config_requires_node_id() -> Result<()> {
    let res = envy::from_iter::<_, Config>(vec![("RUST_LOG".into(), "error".into())]);
    assert!(res.is_err(), "expected config without NODE_ID to fail to deserialize");
    Ok(())
}

#[test]
fn config_rejects_invalid_values() -> Result<()> {
    for (key, value) in [("SESSION_TIMEOUT_MS", "0"), ("LIVENESS_CHECK_INTERVAL_MS", "0"), ("RETAINED_SNAPSHOTS", "0")] {
        let config: Config = envy::from_iter(vec![
            ("RUST_LOG".into(), "error".into()),
            ("NODE_ID".into(), "1".into()),
            (key.to_string(), value.to_string()),
        ])?;
        assert!(config.validate().is_err(), "expected {}={} to be rejected", key, value);
    }
    Ok(())
}
