//! The HTTP kernel: server lifecycle, filter chain, dispatch, counters.
//!
//! An [`HttpServer`] owns the route table, the pre-dispatch filter chain,
//! the optional index slot, an i18n message bundle, and the aggregate
//! request counters. Every request follows the same lifecycle: CORS
//! handling, filters, first-match dispatch (or the 404 document), then
//! counter accumulation. Handler panics are confined to the request that
//! caused them.

pub mod context;
pub mod metrics;
pub mod router;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::response::Response;
use futures::FutureExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Properties;
use crate::errors::{Error, Result};
use context::RequestContext;
use router::{FilterFn, Handler, RouteTable};

/// Built-in 404 document.
pub const NOT_FOUND_VIEW: &str =
    "<html><head><title>NOT FOUND</title></head><body><h1>404 NOT FOUND</h1></body></html>";

const ALLOWED_METHODS: &str = "POST,GET,OPTIONS,DELETE";

const STATUS_NEW: u8 = 0;
const STATUS_STARTED: u8 = 1;

/// Snapshot of the aggregate request counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub total_count: u64,
    pub total_elapsed_ms: u64,
    pub success_count: u64,
    pub success_elapsed_ms: u64,
}

#[derive(Default)]
struct Counters {
    total_count: AtomicU64,
    total_elapsed_ms: AtomicU64,
    success_count: AtomicU64,
    success_elapsed_ms: AtomicU64,
}

struct ServerShared {
    table: RwLock<RouteTable>,
    messages: RwLock<HashMap<String, String>>,
    counters: Counters,
    cross_origin: bool,
    status: AtomicU8,
}

/// A cheaply clonable handle on one server instance. Tests construct as
/// many isolated servers as they need; there is no process-wide default.
#[derive(Clone)]
pub struct HttpServer {
    shared: Arc<ServerShared>,
}

impl HttpServer {
    pub fn new(cross_origin: bool) -> Self {
        HttpServer {
            shared: Arc::new(ServerShared {
                table: RwLock::new(RouteTable::default()),
                messages: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                cross_origin,
                status: AtomicU8::new(STATUS_NEW),
            }),
        }
    }

    // ---- registration ------------------------------------------------------

    /// Register a handler under a path pattern; see [`router`] for the
    /// pattern grammar.
    pub fn register_handler<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(path, router::handler(f));
    }

    pub fn register(&self, path: &str, handler: Handler) {
        self.table_mut().register(path, handler);
    }

    /// Register a pre-dispatch filter. Returning `false` from the
    /// predicate halts the request.
    pub fn register_filter<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.table_mut().register_filter(path, router::filter(f));
    }

    /// Bind the index slot for the literal `/`.
    pub fn register_index<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.table_mut().register_index(router::handler(f));
    }

    /// Map a URL prefix onto a directory of static files.
    pub fn register_static(&self, prefix: &str, dir: &str) {
        let mut prefix = prefix.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let dir = dir.trim_end_matches('/').to_string();
        let strip = prefix.clone();
        self.register_handler(&prefix, move |ctx| {
            let dir = dir.clone();
            let strip = strip.clone();
            async move {
                let rest = ctx.path().strip_prefix(strip.as_str()).unwrap_or_default();
                if rest.split('/').any(|seg| seg == "..") {
                    let _ = ctx.error(404, NOT_FOUND_VIEW);
                    return;
                }
                let _ = ctx.serve_file(&format!("{dir}/{rest}")).await;
            }
        });
    }

    /// Load the i18n message bundle from a properties map.
    pub fn load_messages(&self, props: &Properties) {
        let mut messages = self.shared.messages.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in props {
            messages.insert(key.clone(), value.clone());
        }
    }

    pub fn message(&self, key: &str) -> Option<String> {
        self.shared
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    // ---- observability -----------------------------------------------------

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.shared.counters;
        CounterSnapshot {
            total_count: c.total_count.load(Ordering::Relaxed),
            total_elapsed_ms: c.total_elapsed_ms.load(Ordering::Relaxed),
            success_count: c.success_count.load(Ordering::Relaxed),
            success_elapsed_ms: c.success_elapsed_ms.load(Ordering::Relaxed),
        }
    }

    pub fn started(&self) -> bool {
        self.shared.status.load(Ordering::SeqCst) == STATUS_STARTED
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Serve on an already-bound listener until `shutdown` resolves.
    /// Starting a server twice is refused.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self
            .shared
            .status
            .compare_exchange(STATUS_NEW, STATUS_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("server already started");
            return Err(Error::AlreadyStarted);
        }

        let addr = listener.local_addr()?;
        info!(%addr, "server start");

        let app = Router::new()
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone());

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    fn table_mut(&self) -> std::sync::RwLockWriteGuard<'_, RouteTable> {
        self.shared.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn dispatch(
    State(shared): State<Arc<ServerShared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let ctx = Arc::new(RequestContext::from_request(req, Some(peer)));

    if shared.cross_origin {
        ctx.set_header("Access-Control-Allow-Origin", "*");
        ctx.set_header("Access-Control-Allow-Methods", ALLOWED_METHODS);
        ctx.set_header("Access-Control-Allow-Headers", "*");
        if ctx.method() == Method::OPTIONS {
            let _ = ctx.code(202);
            return finalize(&shared, ctx, started);
        }
    }

    let path = ctx.path().to_string();

    let filters: Vec<FilterFn> = {
        let table = shared.table.read().unwrap_or_else(PoisonError::into_inner);
        table.matching_filters(&path)
    };
    for predicate in filters {
        if !predicate(ctx.clone()).await {
            return finalize(&shared, ctx, started);
        }
    }

    // The whole route walk happens under the reader lock; the handler runs
    // after it is released.
    let resolved = {
        let table = shared.table.read().unwrap_or_else(PoisonError::into_inner);
        if path == "/" {
            table.index().map(|h| (h, HashMap::new())).or_else(|| table.resolve(&path))
        } else {
            table.resolve(&path)
        }
    };

    match resolved {
        Some((handler, params)) => {
            ctx.set_path_params(params);
            let outcome = std::panic::AssertUnwindSafe(handler(ctx.clone())).catch_unwind().await;
            if outcome.is_err() {
                error!(%path, "handler panicked");
                if ctx.writable() {
                    let _ = ctx.code(500);
                }
            }
        }
        None => {
            let _ = ctx.error(404, NOT_FOUND_VIEW);
        }
    }

    finalize(&shared, ctx, started)
}

fn finalize(shared: &ServerShared, ctx: Arc<RequestContext>, started: Instant) -> Response {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let counters = &shared.counters;
    counters.total_count.fetch_add(1, Ordering::Relaxed);
    counters.total_elapsed_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    if ctx.captured_status() == 200 {
        counters.success_count.fetch_add(1, Ordering::Relaxed);
        counters.success_elapsed_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }
    ctx.finish()
}
