use crate::StoreIdentity;

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "invalid version {_0}: versions must be non-negative")]
    InvalidVersion(i64),
    #[display(fmt = "key does not conform to the key schema")]
    InvalidKey,
    #[display(fmt = "value does not conform to the value schema")]
    InvalidValue,
    #[display(fmt = "invalid state schema")]
    InvalidSchema,
    #[display(fmt = "version {version} of {id} not found")]
    VersionNotFound { id: StoreIdentity, version: i64 },
    #[display(fmt = "failed to commit version {version} of {id}")]
    Commit { id: StoreIdentity, version: i64 },
    #[display(fmt = "cannot {method} a state store which was already {state}")]
    StoreClosed {
        method: &'static str,
        state: &'static str,
    },
    #[display(fmt = "maintenance failed for {_0}")]
    Maintenance(StoreIdentity),
    #[display(fmt = "failed to create state backend")]
    CreateBackend,
    #[display(fmt = "failed to perform '{_0}' on backend")]
    Backend(&'static str),
    #[display(fmt = "failed to serialize state")]
    Serialize,
    #[display(fmt = "failed to deserialize state")]
    Deserialize,
    #[display(fmt = "no state store provider registered as '{_0}'")]
    UnknownProvider(String),
    #[display(fmt = "state store provider used before initialization")]
    ProviderNotInitialized,
    #[display(fmt = "state store provider already initialized")]
    ProviderAlreadyInitialized,
    #[display(fmt = "failed to spawn state store maintenance")]
    SpawnMaintenance,
    #[display(fmt = "error communicating with the state store coordinator")]
    Coordinator,
}

impl error_stack::Context for Error {}

/// Path attached to errors reporting on files or directories.
pub struct StorePath(std::path::PathBuf);

impl StorePath {
    pub fn new(path: &std::path::Path) -> Self {
        StorePath(path.to_owned())
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl std::fmt::Debug for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
