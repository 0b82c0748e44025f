#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for peer-lobby.
//!
//! These tests parse `Cargo.toml` and verify the lint table, feature wiring and
//! MSRV conform to project policy. If any test fails, the manifest has drifted
//! from the agreed-upon standards.
//!
//! All checks are synchronous filesystem reads; no network access or async
//! runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads and parses `Cargo.toml`.
fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let contents = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    contents
        .parse::<toml::Table>()
        .unwrap_or_else(|e| panic!("Cargo.toml is not valid TOML: {e}"))
}

fn table<'a>(parent: &'a toml::Table, key: &str) -> &'a toml::Table {
    parent
        .get(key)
        .and_then(toml::Value::as_table)
        .unwrap_or_else(|| panic!("Cargo.toml is missing the [{key}] table"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: lint_policy
// ─────────────────────────────────────────────────────────────────────────────

mod lint_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn clippy_lints_deny_every_panic_path() {
        let manifest = manifest();
        let clippy = table(table(&manifest, "lints"), "clippy");

        for lint in REQUIRED_DENY_LINTS {
            let level = clippy.get(*lint).and_then(toml::Value::as_str);
            assert_eq!(
                level,
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"`. Library code \
                 propagates errors instead of panicking."
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    fn feature_members(manifest: &toml::Table, feature: &str) -> Vec<String> {
        table(manifest, "features")
            .get(feature)
            .and_then(toml::Value::as_array)
            .unwrap_or_else(|| panic!("feature `{feature}` is not declared"))
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn websocket_transport_is_default() {
        let manifest = manifest();
        let default = feature_members(&manifest, "default");
        assert!(default.contains(&"transport-websocket".to_string()));
    }

    #[test]
    fn websocket_feature_enables_its_optional_dependencies() {
        let manifest = manifest();
        let members = feature_members(&manifest, "transport-websocket");
        for required in ["dep:tokio-tungstenite", "dep:futures-util", "tokio/net"] {
            assert!(
                members.iter().any(|m| m == required),
                "transport-websocket must enable `{required}`"
            );
        }

        let deps = table(&manifest, "dependencies");
        for optional in ["tokio-tungstenite", "futures-util"] {
            let optional_flag = deps
                .get(optional)
                .and_then(toml::Value::as_table)
                .and_then(|t| t.get("optional"))
                .and_then(toml::Value::as_bool);
            assert_eq!(
                optional_flag,
                Some(true),
                "`{optional}` must stay optional behind transport-websocket"
            );
        }
    }

    #[test]
    fn core_runtime_does_not_pull_full_tokio() {
        let manifest = manifest();
        let tokio = table(&manifest, "dependencies")
            .get("tokio")
            .and_then(toml::Value::as_table)
            .expect("tokio dependency must use the table form");
        let features: Vec<&str> = tokio
            .get("features")
            .and_then(toml::Value::as_array)
            .expect("tokio features")
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert!(!features.contains(&"full"));
        for needed in ["sync", "macros", "rt", "time"] {
            assert!(features.contains(&needed), "tokio feature `{needed}` missing");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: msrv_policy
// ─────────────────────────────────────────────────────────────────────────────

mod msrv_policy {
    use super::*;

    #[test]
    fn rust_version_is_pinned() {
        let manifest = manifest();
        let package = table(&manifest, "package");
        let msrv = package
            .get("rust-version")
            .and_then(toml::Value::as_str)
            .expect("package.rust-version must be set");
        let mut parts = msrv.split('.').map(|p| p.parse::<u32>().unwrap());
        assert_eq!(parts.next(), Some(1));
        // let-else and `Option::is_none_or` are used throughout.
        assert!(parts.next().unwrap() >= 82, "MSRV {msrv} is too old");
        assert_eq!(
            package.get("edition").and_then(toml::Value::as_str),
            Some("2021")
        );
    }
}
