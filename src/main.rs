//! Process entry point: loads configuration, constructs the pool and the
//! NEVERHANG manager, starts the background health scheduler, then drives
//! the stdio request/response loop (§6 "Process lifecycle").
//!
//! Configuration parse failure and pool construction failure are the only
//! two fatal conditions (§7); every in-band tool call failure is surfaced
//! to the caller as a classified error instead.

mod circuit;
mod config;
mod error;
mod executor;
mod health;
mod manager;
mod policy;
mod pool;
mod protocol;
mod timeout;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use config::GatewayConfig;
use manager::GatewayManager;
use pool::Pool;
use protocol::{encode_response, parse_request, Response};

fn init_tracing() {
    let format = std::env::var("PG_NEVERHANG_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Builds the health monitor's ping callback: a trivial liveness round-trip
/// through the same pool and configuration in-band calls use (§4.3, §6).
fn make_ping_fn(pool: Arc<Pool>, connect_deadline: Duration) -> health::PingFn {
    Arc::new(move || {
        let pool = Arc::clone(&pool);
        Box::pin(async move {
            let conn = pool
                .acquire(connect_deadline)
                .await
                .map_err(|e| e.to_string())?;
            let result = conn
                .client()
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());
            pool.release(conn);
            result
        })
    })
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "fatal: configuration load failed");
            std::process::exit(1);
        }
    };

    let pool = Pool::new(config.database.clone(), config.pool.clone());
    if let Err(err) = pool.warm_up().await {
        tracing::error!(error = %err, "fatal: pool construction failed");
        std::process::exit(1);
    }
    pool.start_idle_sweep();

    let ping = make_ping_fn(Arc::clone(&pool), config.timeout.connection_timeout);
    let manager = Arc::new(GatewayManager::new(config, ping));
    manager.health_monitor().start().await;

    tracing::info!("pg-neverhang gateway ready, reading requests from stdin");

    run_stdio_loop(&manager, &pool).await;

    manager.health_monitor().stop().await;
    pool.stop_idle_sweep();
    tracing::info!("pg-neverhang gateway shut down");
}

/// Drives the line-oriented stdio protocol (§6). Each request line is
/// dispatched on its own task so that multiple calls can be in flight at
/// once (§5's concurrency model) — concurrency is naturally bounded by the
/// pool's connection semaphore, not by this loop. Responses are funnelled
/// through a single writer task so concurrent completions never interleave
/// their output lines. A `ctrl_c` flips the shared shutdown flag; requests
/// already dispatched race against it and surface as `cancelled` (§4.4,
/// §5) instead of being silently dropped when the process exits.
async fn run_stdio_loop(manager: &Arc<GatewayManager>, pool: &Arc<Pool>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(err) = stdout.write_all(line.as_bytes()).await {
                tracing::error!(error = %err, "failed to write response to stdout");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                let _ = shutdown_tx.send(true);
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    tracing::info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let manager = Arc::clone(manager);
                let pool = Arc::clone(pool);
                let tx = tx.clone();
                let shutdown_rx = shutdown_rx.clone();
                in_flight.spawn(async move {
                    let response = handle_line(&manager, &pool, &line, shutdown_rx).await;
                    let _ = tx.send(encode_response(&response));
                });
            }
        }
    }

    // Give in-flight calls a chance to finish (or observe the shutdown flag
    // and return `cancelled`) before the process exits.
    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
}

/// Parses and dispatches one request line, racing the guarded call against
/// the shutdown flag so a process-level shutdown surfaces as `cancelled`
/// (§4.5, §5) rather than hanging the stdio loop at exit.
async fn handle_line(
    manager: &GatewayManager,
    pool: &Arc<Pool>,
    line: &str,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Response {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "malformed request line");
            return Response::failure(
                serde_json::Value::Null,
                serde_json::json!({
                    "type": "permission_denied",
                    "message": format!("malformed request: {err}"),
                    "duration_ms": 0,
                    "retryable": false,
                    "suggestion": "send a well-formed {id, tool, args} JSON line",
                }),
            );
        }
    };

    if *shutdown_rx.borrow() {
        return Response::failure(request.id, cancelled_wire(Duration::ZERO));
    }

    let call_start = std::time::Instant::now();
    tokio::select! {
        biased;
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            tracing::warn!(tool = %request.tool, "call cancelled by shutdown");
            Response::failure(request.id, cancelled_wire(call_start.elapsed()))
        }
        result = tools::dispatch(manager, pool, &request.tool, &request.args) => {
            match result {
                Ok(result) => Response::success(request.id, result),
                Err(err) => Response::failure(request.id, err.to_wire()),
            }
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn cancelled_wire(duration: Duration) -> serde_json::Value {
    serde_json::json!({
        "type": "cancelled",
        "message": "outer cancellation observed before completion",
        "duration_ms": duration.as_millis() as u64,
        "retryable": false,
        "suggestion": "the call was cancelled before completion",
    })
}
