use super::mock::MockBackend;
use super::openai::OpenAiBackend;
use super::process::{OutputMode, ProcessBackend};
use super::{ChatBackend, RunnerContext};
use crate::errors::RegistryError;
use crate::model::Options;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type BackendConstructor =
    Arc<dyn Fn(&RunnerContext) -> Box<dyn ChatBackend> + Send + Sync + 'static>;

/// Name → constructor mapping. Owned by whoever runs jobs; there is no global instance.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, BackendConstructor>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_defaults();
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&RunnerContext) -> Box<dyn ChatBackend> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }
        self.constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    /// Registers the built-in backends. Names already present are left alone.
    pub fn register_defaults(&mut self) {
        let builtins: [(&str, BackendConstructor); 5] = [
            ("openai", Arc::new(|_ctx: &RunnerContext| Box::new(OpenAiBackend::new()) as Box<dyn ChatBackend>)),
            ("process", Arc::new(|_ctx: &RunnerContext| Box::new(ProcessBackend::direct()) as Box<dyn ChatBackend>)),
            ("adb-cli", Arc::new(|_ctx: &RunnerContext| Box::new(ProcessBackend::adb()) as Box<dyn ChatBackend>)),
            (
                "adb-cli-freeform",
                Arc::new(|_ctx: &RunnerContext| {
                    Box::new(ProcessBackend::adb().with_output_mode(OutputMode::Freeform))
                        as Box<dyn ChatBackend>
                }),
            ),
            ("mock", Arc::new(|_ctx: &RunnerContext| Box::new(MockBackend::new()) as Box<dyn ChatBackend>)),
        ];
        for (name, constructor) in builtins {
            self.constructors
                .entry(name.to_string())
                .or_insert(constructor);
        }
    }

    pub fn create(
        &self,
        name: &str,
        context: &RunnerContext,
        options: &Options,
    ) -> Result<Arc<dyn ChatBackend>, RegistryError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| RegistryError::Unknown {
                name: name.to_string(),
                available: self.names(),
            })?;
        let mut backend = constructor(context);
        backend
            .configure(options)
            .map_err(|source| RegistryError::Configure {
                name: name.to_string(),
                source,
            })?;
        tracing::debug!(backend = name, options = options.len(), "backend configured");
        Ok(Arc::from(backend))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names in sorted order, for pre-flight validation.
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClassifiedError;
    use crate::model::{ChatResponse, RunRequest};
    use async_trait::async_trait;

    struct Picky;

    #[async_trait]
    impl ChatBackend for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        fn configure(&mut self, options: &Options) -> Result<(), ClassifiedError> {
            if options.contains_key("required") {
                Ok(())
            } else {
                Err(ClassifiedError::backend_config("config", "missing 'required'"))
            }
        }

        async fn send(&self, _request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
            Ok(ChatResponse::text("ok"))
        }
    }

    #[test]
    fn names_are_sorted_defaults() {
        let reg = BackendRegistry::with_defaults();
        assert_eq!(
            reg.names(),
            vec!["adb-cli", "adb-cli-freeform", "mock", "openai", "process"]
        );
    }

    #[test]
    fn duplicate_registration_errors() {
        let mut reg = BackendRegistry::new();
        reg.register("picky", |_| Box::new(Picky)).unwrap();
        let err = reg.register("picky", |_| Box::new(Picky)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { ref name } if name == "picky"));
    }

    #[test]
    fn register_defaults_is_idempotent_and_keeps_overrides() {
        let mut reg = BackendRegistry::new();
        reg.register("mock", |_| Box::new(Picky)).unwrap();
        reg.register_defaults();
        reg.register_defaults();
        assert_eq!(reg.names().len(), 5);

        let mut opts = Options::new();
        opts.insert("required".into(), true.into());
        let backend = reg.create("mock", &RunnerContext::default(), &opts).unwrap();
        assert_eq!(backend.name(), "picky");
    }

    #[test]
    fn create_unknown_lists_available() {
        let reg = BackendRegistry::with_defaults();
        let err = reg
            .create("nope", &RunnerContext::default(), &Options::new())
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("'nope' is not registered"));
        assert!(msg.contains("mock, openai"));
    }

    #[test]
    fn create_surfaces_configure_failure() {
        let mut reg = BackendRegistry::new();
        reg.register("picky", |_| Box::new(Picky)).unwrap();
        let err = reg
            .create("picky", &RunnerContext::default(), &Options::new())
            .err()
            .unwrap();
        match err {
            RegistryError::Configure { name, source } => {
                assert_eq!(name, "picky");
                assert!(!source.retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
