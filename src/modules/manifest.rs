use std::path::Path;

use crate::modules::{ModuleError, ModuleErrorKind, ModuleIdentity, ModuleInspector};

/// Reads a module's identity from the TOML manifest shipped next to it.
///
/// For `bin/orders.so` the manifest is `bin/orders.toml`:
///
/// ```toml
/// name = "orders"
/// version = "1.4.0"
/// publisher_token = "0123456789abcdef"
/// handlers = ["Orders.PlaceOrder", "Orders.CancelOrder"]
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestInspector;

impl ModuleInspector for ManifestInspector {
    fn inspect(&self, path: &Path) -> Result<ModuleIdentity, ModuleError> {
        let manifest_path = path.with_extension("toml");
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            ModuleError::new(ModuleErrorKind::Io {
                path: manifest_path.clone(),
                source: e,
            })
        })?;

        toml::from_str(&content).map_err(|e| {
            ModuleError::new(ModuleErrorKind::Manifest {
                path: manifest_path,
                source: e,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_sidecar_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = tmp.path().join("orders.so");
        std::fs::write(&binary, b"").unwrap();
        std::fs::write(
            tmp.path().join("orders.toml"),
            r#"
name = "orders"
version = "1.4.0"
publisher_token = "0123456789ABCDEF"
handlers = ["Orders.PlaceOrder"]
"#,
        )
        .unwrap();

        let identity = ManifestInspector.inspect(&binary).unwrap();

        assert_eq!(identity.name, "orders");
        assert_eq!(identity.version.as_deref(), Some("1.4.0"));
        assert_eq!(
            identity.publisher_token.map(|t| t.to_string()).as_deref(),
            Some("0123456789abcdef")
        );
        assert_eq!(identity.handlers, vec!["Orders.PlaceOrder".to_owned()]);
    }

    #[test]
    fn invalid_token_is_a_manifest_error() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = tmp.path().join("orders.so");
        std::fs::write(
            tmp.path().join("orders.toml"),
            "name = \"orders\"\npublisher_token = \"nope\"\n",
        )
        .unwrap();

        let err = ManifestInspector.inspect(&binary).unwrap_err();

        assert!(matches!(err.kind(), ModuleErrorKind::Manifest { .. }));
    }

    #[test]
    fn missing_manifest_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();

        let err = ManifestInspector
            .inspect(&tmp.path().join("ghost.so"))
            .unwrap_err();

        assert!(matches!(err.kind(), ModuleErrorKind::Io { .. }));
    }
}
