//! Pool of HTTP request workers shared between many concurrent clients.
//!
//! Pool settings are read from a YAML file and can be overridden with environment
//! variables, e.g. `REQUEST_HANDLER__CAPACITY=2`. Use `RUST_LOG=debug` to see pool spans.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workpool::{r#async::Pool, Error, PoolConfigLoader, Resource};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_parser = validate_config_path,
        default_value = default_config_path(),
        env = "REQUEST_HANDLER_CONFIG_FILE"
    )]
    config_file: String,
    /// Number of concurrent client requests to simulate.
    #[arg(short, long, default_value_t = 12)]
    requests: usize,
    /// Time each manually leased worker spends streaming its response, in milliseconds.
    #[arg(short, long, default_value_t = 50)]
    latency_ms: u64,
}

/// Default path for configuration file.
fn default_config_path() -> &'static str {
    "demos/request_handler/config.yaml"
}

/// Sanitize provided configuration file path.
fn validate_config_path(v: &str) -> Result<String, String> {
    let path = v.to_string();
    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => return Err(format!("Unable to check file: {e}")),
    };
    if !meta.is_file() {
        return Err("Configuration is not a file".into());
    }
    Ok(path)
}

/// Incoming request.
#[derive(Clone, Debug)]
struct HttpRequest {
    method: &'static str,
    path: String,
}

/// Request processing failure.
#[derive(Debug, thiserror::Error)]
enum HandlerError {
    /// Worker does not know how to serve this method.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(&'static str),
}

/// Pooled request worker.
#[derive(Debug)]
struct Worker {
    id: usize,
    served: usize,
}

impl Resource for Worker {
    type Job = HttpRequest;
    type Output = String;
    type Error = HandlerError;

    fn process(&mut self, req: HttpRequest) -> Result<String, HandlerError> {
        match req.method {
            "GET" | "POST" => {
                self.served += 1;
                Ok(format!(
                    "200 OK {} {} (worker {}, request #{})",
                    req.method, req.path, self.id, self.served
                ))
            }
            other => Err(HandlerError::MethodNotAllowed(other)),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let config = PoolConfigLoader::new()
        .with_file(&args.config_file)
        .with_env("REQUEST_HANDLER")
        .build()?;
    info!(?config, "loaded pool configuration");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(
        Pool::new(config, worker_factory()),
        args.requests,
        Duration::from_millis(args.latency_ms),
    ));
    Ok(())
}

/// Factory numbering every worker it creates.
fn worker_factory() -> impl Fn() -> Worker + Send + Sync + 'static {
    let created = AtomicUsize::new(0);
    move || {
        let id = created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(id, "spawning worker");
        Worker { id, served: 0 }
    }
}

/// Fire all requests at once and report how each one went.
async fn run(pool: Pool<Worker>, requests: usize, latency: Duration) {
    let failed = Arc::new(AtomicUsize::new(0));
    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..requests {
        let pool = pool.clone();
        let failed = Arc::clone(&failed);
        let req = HttpRequest {
            method: match n % 5 {
                4 => "DELETE",
                3 => "POST",
                _ => "GET",
            },
            path: format!("/api/items/{n}"),
        };
        tasks.spawn(async move {
            let res = if n % 2 == 0 {
                pool.execute(req).await
            } else {
                serve_slowly(&pool, req, latency).await
            };
            match res {
                Ok(response) => info!(n, %response, "request served"),
                Err(err) if err.is_backpressure() => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(n, %err, "503 Service Unavailable");
                }
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(n, %err, "request failed");
                }
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            warn!(%err, "request task crashed");
        }
    }
    pool.update_metrics();
    let stats = pool.stats();
    info!(
        capacity = stats.capacity,
        created = stats.size(),
        idle = stats.idle,
        leased = stats.leased,
        failed = failed.load(Ordering::Relaxed),
        "all requests finished"
    );
}

/// Hold a worker while the response is slowly streamed back to the client.
async fn serve_slowly(
    pool: &Pool<Worker>,
    req: HttpRequest,
    latency: Duration,
) -> Result<String, Error<HandlerError>> {
    let mut lease = pool.get().await.map_err(Error::cast)?;
    let response = lease.process(req).map_err(Error::Execution)?;
    tokio::time::sleep(latency).await;
    if let Err(err) = pool.release(lease) {
        warn!(id = %err.id(), "worker did not belong to this pool");
    }
    Ok(response)
}
