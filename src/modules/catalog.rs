use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    modules::{ExtensionRegistry, ModuleError, ModuleErrorKind, ModuleIdentity},
    pipeline::MessageHandler,
};

/// Registry of message handlers, grouped by the module that provides them.
///
/// Handlers that live in the function itself are registered with
/// [`register_handlers`](Self::register_handlers) and are active straight
/// away. Handlers shipped as a separate module are registered with
/// [`register_module`](Self::register_module) and stay inactive until the
/// module loader finds that module in the module directory.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    modules: Arc<RwLock<Vec<RegisteredModule>>>,
}

struct RegisteredModule {
    name: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
    source: Option<PathBuf>,
    active: bool,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handlers that are part of the function itself.
    pub fn register_handlers(
        &self,
        module: impl Into<String>,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> &Self {
        self.insert(module.into(), handlers, true);
        self
    }

    /// Register a handler module. Its handlers become visible once the module
    /// is loaded from the module directory.
    pub fn register_module(
        &self,
        module: impl Into<String>,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> &Self {
        self.insert(module.into(), handlers, false);
        self
    }

    fn insert(&self, name: String, handlers: Vec<Arc<dyn MessageHandler>>, active: bool) {
        let mut modules = self.modules.write();
        match modules.iter_mut().find(|m| m.name == name) {
            Some(existing) => {
                existing.handlers = handlers;
                existing.active |= active;
            }
            None => modules.push(RegisteredModule {
                name,
                handlers,
                source: None,
                active,
            }),
        }
    }

    pub fn is_active(&self, module: &str) -> bool {
        self.modules
            .read()
            .iter()
            .any(|m| m.name == module && m.active)
    }

    /// Where an activated module was loaded from.
    pub fn source_of(&self, module: &str) -> Option<PathBuf> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name == module)
            .and_then(|m| m.source.clone())
    }

    /// Active handlers for `message_type`, in registration order.
    pub fn handlers_for(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.modules
            .read()
            .iter()
            .filter(|m| m.active)
            .flat_map(|m| m.handlers.iter())
            .filter(|h| h.message_type() == message_type)
            .cloned()
            .collect()
    }

    /// Message types with at least one active handler.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .modules
            .read()
            .iter()
            .filter(|m| m.active)
            .flat_map(|m| m.handlers.iter().map(|h| h.message_type().to_owned()))
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

impl ExtensionRegistry for HandlerCatalog {
    fn load(&self, path: &Path, identity: &ModuleIdentity) -> Result<(), ModuleError> {
        let mut modules = self.modules.write();
        let module = modules
            .iter_mut()
            .find(|m| m.name == identity.name)
            .ok_or_else(|| {
                ModuleError::new(ModuleErrorKind::UnknownModule(identity.name.clone()))
            })?;

        let missing: Vec<String> = identity
            .handlers
            .iter()
            .filter(|t| !module.handlers.iter().any(|h| h.message_type() == t.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ModuleError::new(ModuleErrorKind::MissingHandlers {
                module: identity.name.clone(),
                message_types: missing,
            }));
        }

        if !module.active {
            module.active = true;
            module.source = Some(path.to_path_buf());
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules = self.modules.read();
        f.debug_list()
            .entries(modules.iter().map(|m| (&m.name, m.active)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::context::ProcessingContext;

    struct Noop(&'static str);

    #[async_trait]
    impl MessageHandler for Noop {
        fn message_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _context: &ProcessingContext) -> Result<(), tower::BoxError> {
            Ok(())
        }
    }

    fn identity(name: &str, handlers: &[&str]) -> ModuleIdentity {
        ModuleIdentity {
            name: name.to_owned(),
            version: None,
            publisher_token: None,
            handlers: handlers.iter().map(|h| (*h).to_owned()).collect(),
        }
    }

    #[test]
    fn module_handlers_are_hidden_until_loaded() {
        let catalog = HandlerCatalog::new();
        catalog
            .register_handlers("function", vec![Arc::new(Noop("Ping"))])
            .register_module("orders", vec![Arc::new(Noop("PlaceOrder"))]);

        assert_eq!(catalog.message_types(), vec!["Ping".to_owned()]);
        assert!(catalog.handlers_for("PlaceOrder").is_empty());

        let path = Path::new("/app/bin/orders.so");
        catalog.load(path, &identity("orders", &["PlaceOrder"])).unwrap();
        catalog.load(path, &identity("orders", &[])).unwrap();

        assert!(catalog.is_active("orders"));
        assert_eq!(catalog.source_of("orders").as_deref(), Some(path));
        assert_eq!(catalog.handlers_for("PlaceOrder").len(), 1);
    }

    #[test]
    fn unknown_modules_are_rejected() {
        let catalog = HandlerCatalog::new();

        let err = catalog
            .load(Path::new("stray.so"), &identity("stray", &[]))
            .unwrap_err();

        assert!(matches!(err.kind(), ModuleErrorKind::UnknownModule(name) if name == "stray"));
    }

    #[test]
    fn declared_handlers_must_be_linked_in() {
        let catalog = HandlerCatalog::new();
        catalog.register_module("billing", vec![Arc::new(Noop("ChargeCard"))]);

        let err = catalog
            .load(
                Path::new("billing.so"),
                &identity("billing", &["ChargeCard", "RefundCard"]),
            )
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            ModuleErrorKind::MissingHandlers { message_types, .. } if message_types == &["RefundCard".to_owned()]
        ));
        assert!(!catalog.is_active("billing"));
    }
}
