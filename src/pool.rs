//! Named connection pools shared across scenario steps.
//!
//! A pool is a bounded, ordered set of externally-opened connections. The
//! engine opens every connection once at session start, hands copies a
//! read-shared slot keyed by `copy_number % count`, and closes everything at
//! session end. Connections are opaque to the engine; thread-safety of the
//! connection object itself is the owner's concern. Pool sizing is the knob
//! users turn to control contention on each slot.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::stats::TestInfo;

/// A read-shared connection slot.
pub type Connection = Arc<dyn Any + Send + Sync>;

type OpenFn = dyn Fn(usize, PoolContext) -> BoxFuture<'static, Result<Box<dyn Any + Send + Sync>, String>>
    + Send
    + Sync;
type CloseFn =
    dyn Fn(Connection, PoolContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync;

/// Context handed to user `open`/`close` callbacks.
#[derive(Clone)]
pub struct PoolContext {
    pub test_info: Arc<TestInfo>,
    pub cancellation: CancellationToken,
}

/// Declarative pool configuration attached to steps at build time.
///
/// The runtime pool is resolved from these args once per session; the
/// effective pool name is `"{scenario_name}.{name}"` so pools in
/// independent scenarios never collide.
pub struct ConnectionPoolArgs {
    name: String,
    count: usize,
    open: Arc<OpenFn>,
    close: Arc<CloseFn>,
}

impl ConnectionPoolArgs {
    /// Declare a pool of `count` connections opened by `open` and released
    /// by `close`.
    ///
    /// # Example
    /// ```no_run
    /// use stampede::pool::ConnectionPoolArgs;
    ///
    /// let pool = ConnectionPoolArgs::new(
    ///     "redis",
    ///     10,
    ///     |index, _ctx| async move {
    ///         let client = format!("client-{index}");
    ///         Ok(Box::new(client) as Box<dyn std::any::Any + Send + Sync>)
    ///     },
    ///     |_conn, _ctx| async move { Ok(()) },
    /// );
    /// ```
    pub fn new<O, OFut, C, CFut>(
        name: impl Into<String>,
        count: usize,
        open: O,
        close: C,
    ) -> Arc<Self>
    where
        O: Fn(usize, PoolContext) -> OFut + Send + Sync + 'static,
        OFut: Future<Output = Result<Box<dyn Any + Send + Sync>, String>> + Send + 'static,
        C: Fn(Connection, PoolContext) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            count,
            open: Arc::new(
                move |index, ctx| -> BoxFuture<'static, Result<Box<dyn Any + Send + Sync>, String>> {
                    Box::pin(open(index, ctx))
                },
            ),
            close: Arc::new(move |conn, ctx| -> BoxFuture<'static, Result<(), String>> {
                Box::pin(close(conn, ctx))
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// A runtime pool: the resolved name plus its opened connections.
pub struct ConnectionPool {
    name: String,
    connections: Vec<Connection>,
    close: Arc<CloseFn>,
}

impl ConnectionPool {
    /// Open all connections of the pool in parallel.
    ///
    /// `count` may differ from the declared count when overridden by
    /// external settings. If any `open` call fails, every connection that
    /// did open is closed again and the first failure (by slot index) is
    /// returned as [`EngineError::PoolOpenFailed`].
    pub async fn open(
        resolved_name: &str,
        args: &ConnectionPoolArgs,
        count: usize,
        ctx: &PoolContext,
    ) -> Result<ConnectionPool, EngineError> {
        // A pool with no slots cannot serve copies; `get` relies on a
        // non-empty connection list.
        let count = count.max(1);
        info!(pool = resolved_name, count, "Opening connection pool");

        let mut tasks: JoinSet<(usize, Result<Box<dyn Any + Send + Sync>, String>)> =
            JoinSet::new();
        for index in 0..count {
            let open = Arc::clone(&args.open);
            let ctx = ctx.clone();
            tasks.spawn(async move { (index, open(index, ctx).await) });
        }

        let mut opened: Vec<Option<Connection>> = (0..count).map(|_| None).collect();
        let mut failures: Vec<(usize, String)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(conn))) => opened[index] = Some(Arc::from(conn)),
                Ok((index, Err(cause))) => failures.push((index, cause)),
                Err(join_err) => failures.push((count, join_err.to_string())),
            }
        }

        if let Some((index, cause)) = failures.into_iter().min_by_key(|(index, _)| *index) {
            // Roll back whatever did open before surfacing the failure.
            let pool = ConnectionPool {
                name: resolved_name.to_string(),
                connections: opened.into_iter().flatten().collect(),
                close: Arc::clone(&args.close),
            };
            pool.dispose(ctx).await;

            return Err(EngineError::PoolOpenFailed {
                pool: resolved_name.to_string(),
                index,
                cause,
            });
        }

        let connections: Vec<Connection> = opened.into_iter().flatten().collect();
        debug!(pool = resolved_name, connections = connections.len(), "Connection pool ready");

        Ok(ConnectionPool {
            name: resolved_name.to_string(),
            connections,
            close: Arc::clone(&args.close),
        })
    }

    /// The resolved pool name (`"{scenario}.{pool}"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// The slot for a virtual user: `connections[copy_number % count]`.
    ///
    /// Never allocates and never fails after a successful open.
    pub fn get(&self, copy_number: u64) -> Connection {
        let slot = (copy_number as usize) % self.connections.len();
        Arc::clone(&self.connections[slot])
    }

    /// Close every connection. Individual close failures are logged and
    /// ignored so one bad connection cannot leak the rest.
    pub async fn dispose(&self, ctx: &PoolContext) {
        for (index, conn) in self.connections.iter().enumerate() {
            let result = (self.close)(Arc::clone(conn), ctx.clone()).await;
            if let Err(cause) = result {
                warn!(pool = %self.name, index, %cause, "Failed to close pool connection");
            }
        }
        info!(pool = %self.name, count = self.connections.len(), "Connection pool disposed");
    }
}
