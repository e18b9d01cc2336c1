//! Host services handed to modules at load time.
//!
//! The host registers its cache, scheduler and database under stable names
//! in a [`ServiceRegistry`]. When a module is loaded, a [`ServiceLocator`]
//! resolves the three of them with the module's expected types and passes
//! the result to [`ModuleInit::init`].
//!
//! Resolution is best-effort: each service is looked up independently, a
//! failure is logged at `error` level and recorded, and the module still
//! loads without that service.
//!
//! ```
//! use modserve::{Method, Module, RouteTable, services::{self, ModuleInit, ServiceLocator, ServiceRegistry}};
//! use std::sync::{Arc, Mutex};
//!
//! struct Cache(Mutex<Vec<String>>);
//! struct Scheduler;
//! struct Database;
//!
//! struct Visits;
//!
//! impl ModuleInit for Visits {
//!     type Cache = Cache;
//!     type Scheduler = Scheduler;
//!     type Database = Database;
//!
//!     fn init(&self, services: ServiceLocator<Cache, Scheduler, Database>) -> Module {
//!         let cache = services.cache().cloned();
//!
//!         Module::new("visits", "ops").route("/visit", Method::Post, move |req, _| {
//!             if let Some(cache) = &cache {
//!                 cache.0.lock().unwrap().push(req.path().to_owned());
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register(services::CACHE, Arc::new(Cache(Mutex::new(Vec::new()))));
//! registry.declare(services::DATABASE); // exported but not set up yet
//!
//! let routes = RouteTable::default();
//! services::load_module(&routes, &registry, &Visits).unwrap();
//! ```

use crate::{Module, RouteError, RouteTable};
use std::{
    any::{type_name, Any},
    collections::HashMap,
    fmt,
    sync::Arc,
};
use thiserror::Error;

pub const CACHE: &str = "cache";
pub const SCHEDULER: &str = "scheduler";
pub const DATABASE: &str = "database";

type Service = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service `{0}` is not registered")]
    NotFound(String),
    #[error("service `{0}` is registered but not set")]
    Empty(String),
    #[error("service `{name}` is not a `{expected}`")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Named services exported by the host.
///
/// Filled once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, Option<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`, replacing an earlier entry.
    pub fn register<T: Any + Send + Sync>(&mut self, name: &str, service: Arc<T>) -> &mut Self {
        self.entries.insert(name.to_owned(), Some(service));
        self
    }

    /// Declares `name` without a value yet.
    ///
    /// Lookups then fail with [`ServiceError::Empty`] instead of
    /// [`ServiceError::NotFound`].
    pub fn declare(&mut self, name: &str) -> &mut Self {
        self.entries.entry(name.to_owned()).or_insert(None);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        let service = self
            .entries
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_owned()))?
            .as_ref()
            .ok_or_else(|| ServiceError::Empty(name.to_owned()))?;

        Arc::clone(service)
            .downcast::<T>()
            .map_err(|_| ServiceError::TypeMismatch {
                name: name.to_owned(),
                expected: type_name::<T>(),
            })
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.is_some())))
            .finish()
    }
}

/// Cache, scheduler and database as resolved for one module.
pub struct ServiceLocator<C, S, D> {
    cache: Option<Arc<C>>,
    scheduler: Option<Arc<S>>,
    database: Option<Arc<D>>,
    failures: Vec<ServiceError>,
}

impl<C, S, D> ServiceLocator<C, S, D>
where
    C: Any + Send + Sync,
    S: Any + Send + Sync,
    D: Any + Send + Sync,
{
    /// Looks up all three services, each independently of the others.
    pub fn resolve(registry: &ServiceRegistry) -> Self {
        let mut failures = Vec::new();

        let cache = resolve(registry, CACHE, &mut failures);
        let scheduler = resolve(registry, SCHEDULER, &mut failures);
        let database = resolve(registry, DATABASE, &mut failures);

        Self {
            cache,
            scheduler,
            database,
            failures,
        }
    }
}

fn resolve<T: Any + Send + Sync>(
    registry: &ServiceRegistry,
    name: &str,
    failures: &mut Vec<ServiceError>,
) -> Option<Arc<T>> {
    match registry.get(name) {
        Ok(service) => Some(service),
        Err(err) => {
            tracing::error!(service = name, error = %err, "service unavailable");
            failures.push(err);
            None
        }
    }
}

impl<C, S, D> ServiceLocator<C, S, D> {
    #[inline(always)]
    pub fn cache(&self) -> Option<&Arc<C>> {
        self.cache.as_ref()
    }

    #[inline(always)]
    pub fn scheduler(&self) -> Option<&Arc<S>> {
        self.scheduler.as_ref()
    }

    #[inline(always)]
    pub fn database(&self) -> Option<&Arc<D>> {
        self.database.as_ref()
    }

    /// Every lookup that failed, in resolution order.
    #[inline(always)]
    pub fn failures(&self) -> &[ServiceError] {
        &self.failures
    }

    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Load-time entry point of a module.
pub trait ModuleInit {
    type Cache: Any + Send + Sync;
    type Scheduler: Any + Send + Sync;
    type Database: Any + Send + Sync;

    /// Builds the module from whatever services resolved.
    fn init(&self, services: ServiceLocator<Self::Cache, Self::Scheduler, Self::Database>)
        -> Module;
}

/// Resolves services for `init`, builds its module and loads it into `table`.
///
/// Missing services degrade the module, they never fail the load.
pub fn load_module<M: ModuleInit>(
    table: &RouteTable,
    registry: &ServiceRegistry,
    init: &M,
) -> Result<(), RouteError> {
    let services = ServiceLocator::resolve(registry);
    let degraded = services.failures().len();

    let module = init.init(services);
    if degraded > 0 {
        tracing::warn!(module = %module.name, missing = degraded, "module loaded without all services");
    }

    table.load(module)
}
