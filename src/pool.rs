//! Connection pool discipline (§4.4).
//!
//! A hand-rolled pool over `tokio_postgres`, not an off-the-shelf pooling
//! crate: the gateway needs a *hard* acquisition deadline distinct from
//! statement execution, TTL-bounded connection age, idle eviction, and an
//! optional borrow-time validation probe — exactly the hooks the pack's own
//! hand-rolled Postgres pool documents as the reason it avoids
//! `deadpool-postgres` in the first place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::{DatabaseConfig, PoolConfig};
use crate::error::{FailureKind, GatewayError};

/// Connections older than this are revalidated with a cheap probe before
/// being handed out, when `validate_on_borrow` is enabled.
const VALIDATE_AGE_THRESHOLD: Duration = Duration::from_secs(30);
const VALIDATE_PROBE_DEADLINE: Duration = Duration::from_secs(1);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Conn {
    client: tokio_postgres::Client,
    created_at: Instant,
}

struct Idle {
    conn: Conn,
    permit: OwnedSemaphorePermit,
    released_at: Instant,
}

/// A connection checked out of the pool. Must be returned via
/// [`Pool::release`] when the caller is done with it.
pub struct PooledConnection {
    conn: Conn,
    permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.conn.client
    }

    pub fn age(&self) -> Duration {
        self.conn.created_at.elapsed()
    }
}

/// Bounded pool of live Postgres connections.
pub struct Pool {
    semaphore: Arc<Semaphore>,
    idle: StdMutex<VecDeque<Idle>>,
    database: DatabaseConfig,
    config: PoolConfig,
    sweeper: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    waiting: AtomicUsize,
}

/// Builds a native-roots `rustls` connector for `db.ssl` connections,
/// mirroring the pack's own rustls-backed Postgres client setup.
fn build_tls_connector() -> Result<MakeRustlsConnect, GatewayError> {
    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        roots.add(cert).map_err(|e| {
            GatewayError::new(
                FailureKind::ConnectionFailed,
                format!("failed to load native root certificate: {e}"),
                Duration::ZERO,
            )
        })?;
    }
    if !loaded.errors.is_empty() {
        tracing::warn!(errors = ?loaded.errors, "some native root certificates failed to load");
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

/// Connects with the given TLS mode, racing it against `deadline` and
/// translating driver-level failures the same way regardless of transport.
async fn connect_via<T>(
    pg_config: &tokio_postgres::Config,
    tls: T,
    start: Instant,
    deadline: Duration,
) -> Result<Conn, GatewayError>
where
    T: MakeTlsConnect<Socket> + Send + 'static,
    T::Stream: Send,
    T::TlsConnect: Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let connect = pg_config.connect(tls);

    match tokio::time::timeout(deadline, connect).await {
        Err(_) => Err(GatewayError::new(
            FailureKind::ConnectionFailed,
            "connect deadline elapsed",
            start.elapsed(),
        )),
        Ok(Err(e)) => Err(GatewayError::with_cause(
            FailureKind::ConnectionFailed,
            "failed to connect to postgres",
            start.elapsed(),
            e,
        )),
        Ok(Ok((client, connection))) => {
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "postgres connection task ended");
                }
            });
            Ok(Conn {
                client,
                created_at: Instant::now(),
            })
        }
    }
}

async fn connect_one(db: &DatabaseConfig, deadline: Duration) -> Result<Conn, GatewayError> {
    let start = Instant::now();

    let pg_config = if let Some(cs) = &db.connection_string {
        cs.parse::<tokio_postgres::Config>().map_err(|e| {
            GatewayError::with_cause(
                FailureKind::ConnectionFailed,
                "invalid connection string",
                start.elapsed(),
                e,
            )
        })?
    } else {
        let mut c = tokio_postgres::Config::new();
        c.host(&db.host)
            .port(db.port)
            .dbname(&db.database)
            .user(&db.user)
            .password(&db.password);
        c
    };

    if db.ssl {
        let connector = build_tls_connector()?;
        connect_via(&pg_config, connector, start, deadline).await
    } else {
        connect_via(&pg_config, NoTls, start, deadline).await
    }
}

async fn validate(client: &tokio_postgres::Client) -> Result<(), ()> {
    tokio::time::timeout(VALIDATE_PROBE_DEADLINE, client.simple_query("SELECT 1"))
        .await
        .map_err(|_| ())?
        .map(|_| ())
        .map_err(|_| ())
}

impl Pool {
    pub fn new(database: DatabaseConfig, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            idle: StdMutex::new(VecDeque::new()),
            database,
            config,
            sweeper: StdMutex::new(None),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Eagerly establishes `min_connections` warm connections. Failure here
    /// is fatal at startup per §7.
    pub async fn warm_up(self: &Arc<Self>) -> Result<(), GatewayError> {
        for _ in 0..self.config.min_connections {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let conn = connect_one(&self.database, Duration::from_secs(10)).await?;
            self.idle.lock().unwrap().push_back(Idle {
                conn,
                permit,
                released_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Starts the background idle-eviction sweep.
    pub fn start_idle_sweep(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
                let mut idle = this.idle.lock().unwrap();
                let idle_timeout = this.config.idle_timeout;
                let before = idle.len();
                idle.retain(|entry| entry.released_at.elapsed() < idle_timeout);
                let evicted = before - idle.len();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept idle connections past idle timeout");
                }
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    pub fn stop_idle_sweep(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// §4.4 step 3-4: acquires a connection under the connect deadline,
    /// validating and retrying at most once more if the chosen idle
    /// connection fails borrow-time validation.
    pub async fn acquire(&self, connect_deadline: Duration) -> Result<PooledConnection, GatewayError> {
        let start = Instant::now();
        let deadline_instant = start + connect_deadline;
        let mut validation_retries = 0u32;

        loop {
            let idle_entry = self.idle.lock().unwrap().pop_front();

            if let Some(Idle { conn, permit, .. }) = idle_entry {
                if conn.created_at.elapsed() >= self.config.connection_ttl {
                    drop(permit);
                    continue;
                }

                // §4.4 step 4: the threshold is against the connection's
                // age, the same notion TTL eviction and `PooledConnection::age`
                // use — not a per-validation-reset clock, so a long-lived
                // connection keeps getting revalidated on every borrow past
                // the threshold rather than just once.
                if self.config.validate_on_borrow
                    && conn.created_at.elapsed() >= VALIDATE_AGE_THRESHOLD
                {
                    match validate(&conn.client).await {
                        Ok(()) => {
                            return Ok(PooledConnection { conn, permit });
                        }
                        Err(()) => {
                            drop(permit);
                            validation_retries += 1;
                            if validation_retries > 1 {
                                return Err(GatewayError::new(
                                    FailureKind::ConnectionFailed,
                                    "validation failed twice while acquiring a connection",
                                    start.elapsed(),
                                ));
                            }
                            continue;
                        }
                    }
                }

                return Ok(PooledConnection { conn, permit });
            }

            let remaining = deadline_instant.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::new(
                    FailureKind::PoolExhausted,
                    "no connection slot available before the connect deadline",
                    start.elapsed(),
                ));
            }

            self.waiting.fetch_add(1, Ordering::Relaxed);
            let acquired = tokio::time::timeout(
                remaining,
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await;
            self.waiting.fetch_sub(1, Ordering::Relaxed);

            let permit = match acquired {
                Err(_) => {
                    return Err(GatewayError::new(
                        FailureKind::PoolExhausted,
                        "no connection slot available before the connect deadline",
                        start.elapsed(),
                    ));
                }
                Ok(Err(_)) => {
                    return Err(GatewayError::new(
                        FailureKind::ConnectionFailed,
                        "pool is shutting down",
                        start.elapsed(),
                    ));
                }
                Ok(Ok(permit)) => permit,
            };

            let remaining = deadline_instant.saturating_duration_since(Instant::now());
            return connect_one(&self.database, remaining)
                .await
                .map(|conn| PooledConnection { conn, permit });
        }
    }

    /// §4.4 pool invariant: on release, if age >= TTL the connection is
    /// closed instead of returned to the idle set.
    pub fn release(&self, pooled: PooledConnection) {
        if pooled.conn.created_at.elapsed() >= self.config.connection_ttl {
            drop(pooled);
            return;
        }
        self.idle.lock().unwrap().push_back(Idle {
            conn: pooled.conn,
            permit: pooled.permit,
            released_at: Instant::now(),
        });
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().unwrap().len();
        let total = self.config.max_connections - self.semaphore.available_permits();
        PoolStats {
            total,
            idle,
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub waiting: usize,
}
