use super::ClassifiedError;

/// Registry failures. The runner only refuses a job on `Unknown`; a
/// `Configure` failure turns into an `error` record for every sample.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{name}' is already registered")]
    Duplicate { name: String },

    #[error("backend '{name}' is not registered (available: {})", available.join(", "))]
    Unknown {
        name: String,
        available: Vec<String>,
    },

    #[error("backend '{name}' rejected its configuration: {source}")]
    Configure {
        name: String,
        #[source]
        source: ClassifiedError,
    },
}
