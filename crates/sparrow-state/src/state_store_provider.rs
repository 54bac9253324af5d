//! Providers own the durable state of a single store across all versions.
//!
//! # Adding a provider
//!
//! 1. Implement [StateStoreProvider] for the provider struct. The struct is
//!    created empty and configured by [StateStoreProvider::init].
//! 2. Write a function `create` which returns a boxed, uninitialized provider.
//! 3. Register the function with the inventory of providers:
//!
//! ```ignore
//! inventory::submit!(sparrow_state::ProviderRegistration {
//!     name: "sled",
//!     create: &create
//! });
//! ```
//!
//! The provider is then selected by setting [crate::StateStoreConf::provider]
//! to the registered name.

use std::sync::Arc;

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{BackendConf, Error, StateSchema, StateStore, StateStoreConf, StoreIdentity};

/// The `StateStoreProvider` is responsible for how the state of a store is persisted.
pub trait StateStoreProvider: Send + Sync {
    /// Configure the provider for the given store.
    ///
    /// Called once, immediately after creation and before any other method.
    fn init(
        &mut self,
        id: StoreIdentity,
        schema: StateSchema,
        conf: &StateStoreConf,
        backend_conf: &BackendConf,
    ) -> error_stack::Result<(), Error>;

    /// The identity this provider was initialized with.
    fn id(&self) -> Option<&StoreIdentity>;

    /// Open a store against the given version.
    ///
    /// Fails with [Error::VersionNotFound] if the provider is unable to
    /// produce the state of that version.
    fn get_store(&self, version: i64) -> error_stack::Result<Box<dyn StateStore>, Error>;

    /// Perform background housekeeping, such as compacting or deleting old versions.
    ///
    /// May be called repeatedly, and concurrently with open stores.
    fn do_maintenance(&self) -> error_stack::Result<(), Error> {
        Ok(())
    }

    /// Release the resources held by this provider.
    ///
    /// No other methods are called after this.
    fn close(&self) -> error_stack::Result<(), Error>;
}

/// Type alias for a function used to create an uninitialized [StateStoreProvider].
pub type ProviderFactoryFn = dyn Fn() -> Box<dyn StateStoreProvider> + Send + Sync;

/// Registration of a provider under a specific name.
pub struct ProviderRegistration {
    pub name: &'static str,
    pub create: &'static ProviderFactoryFn,
}

inventory::collect!(ProviderRegistration);

// This needs to be marked lazy so it is run after the providers
// are submitted to the inventory.
#[static_init::dynamic(lazy)]
static REGISTERED: HashMap<&'static str, &'static ProviderFactoryFn> = {
    let mut result = HashMap::new();
    let mut duplicates = Vec::new();
    for registration in inventory::iter::<ProviderRegistration> {
        if result
            .insert(registration.name, registration.create)
            .is_some()
        {
            duplicates.push(registration.name);
        }
    }

    debug_assert!(
        duplicates.is_empty(),
        "Expected every provider to be registered once. Duplicates: {duplicates:?}"
    );
    result
};

/// The table of providers available to a [crate::StateStoreRegistry].
#[derive(Clone, Default)]
pub struct ProviderFactories {
    factories: HashMap<String, Arc<ProviderFactoryFn>>,
}

impl std::fmt::Debug for ProviderFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactories")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderFactories {
    /// The providers registered with the inventory.
    pub fn registered() -> Self {
        let factories = REGISTERED
            .iter()
            .map(|(name, create)| {
                let create: &'static ProviderFactoryFn = *create;
                let factory: Arc<ProviderFactoryFn> = Arc::new(move || create());
                ((*name).to_owned(), factory)
            })
            .collect();
        Self { factories }
    }

    /// Add (or replace) the provider created by `create` under the given name.
    pub fn register<F>(&mut self, name: impl Into<String>, create: F)
    where
        F: Fn() -> Box<dyn StateStoreProvider> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(create));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// The registered names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.factories.keys().map(String::as_str).sorted()
    }

    /// Create an uninitialized provider of the given name.
    pub fn create(&self, name: &str) -> error_stack::Result<Box<dyn StateStoreProvider>, Error> {
        let Some(create) = self.factories.get(name) else {
            let registered = self.names().join(", ");
            return Err(error_stack::report!(Error::UnknownProvider(name.to_owned()))
                .attach_printable(format!("registered providers: [{registered}]")));
        };
        Ok(create())
    }
}
