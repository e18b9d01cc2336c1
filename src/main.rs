use modserve::{
    services::{self, ModuleInit, ServiceLocator, ServiceRegistry},
    HandlerError, Method, Module, RouteListing, RouteTable, Server, StatusCode,
};
use std::{
    collections::HashMap,
    env,
    sync::{Arc, Mutex},
    thread,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// In-memory key-value cache exported to modules.
#[derive(Default)]
struct Cache(Mutex<HashMap<String, String>>);

impl Cache {
    fn set(&self, key: &str, value: &str) -> Result<(), HandlerError> {
        self.0
            .lock()
            .map_err(|_| HandlerError::failed("cache poisoned"))?
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn dump(&self) -> Result<String, HandlerError> {
        let map = self
            .0
            .lock()
            .map_err(|_| HandlerError::failed("cache poisoned"))?;

        let mut keys: Vec<_> = map.keys().collect();
        keys.sort();
        Ok(keys.into_iter().map(|k| format!("{k}={}\n", map[k])).collect())
    }
}

struct Scheduler;
struct Database;

/// `POST /notes` stores the `key`/`value` form fields, `GET /notes` lists them.
struct Notes;

impl ModuleInit for Notes {
    type Cache = Cache;
    type Scheduler = Scheduler;
    type Database = Database;

    fn init(&self, services: ServiceLocator<Cache, Scheduler, Database>) -> Module {
        let Some(cache) = services.cache().cloned() else {
            return Module::new("notes", "modserve");
        };
        let reader = Arc::clone(&cache);

        Module::new("notes", "modserve")
            .route("/notes", Method::Post, move |req, resp| {
                let (Some(key), Some(value)) = (req.data().get("key"), req.data().get("value"))
                else {
                    resp.status(StatusCode::BadRequest).write("key and value required\n");
                    return Ok(());
                };

                cache.set(key, value)?;
                resp.status(StatusCode::Ok).write("stored\n");
                Ok(())
            })
            .route("/notes", Method::Get, move |_, resp| {
                resp.status(StatusCode::Ok)
                    .header("Content-Type", "text/plain")
                    .write(reader.dump()?);
                Ok(())
            })
    }
}

fn hello() -> Module {
    Module::new("hello", "modserve").route("/hello", Method::Get, |req, resp| {
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .write("Hello ")
            .write(req.params().get("name").unwrap_or("world"))
            .write("!\n");
        Ok(())
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modserve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = env::var("MODSERVE_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());

    let mut registry = ServiceRegistry::new();
    registry
        .register(services::CACHE, Arc::new(Cache::default()))
        .declare(services::SCHEDULER)
        .declare(services::DATABASE);

    let routes = Arc::new(RouteTable::default());
    routes.load(hello())?;
    services::load_module(&routes, &registry, &Notes)?;

    let server = Server::builder()
        .router(routes.clone())
        .management(Arc::new(RouteListing::new(routes)))
        .bind(addr.as_str())?;

    let handle = server.shutdown_handle();
    thread::Builder::new()
        .name("modserve-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(error = %err, "cannot start signal runtime");
                    return;
                }
            };

            runtime.block_on(shutdown_signal());
            tracing::info!("shutdown signal received");
            handle.shutdown();
        })?;

    server.launch();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
