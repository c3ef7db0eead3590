//! Pattern-based route table with path-parameter extraction.
//!
//! Patterns are registered as written by the caller and compiled to anchored
//! regexes. `{name}` placeholders become greedy capture groups and their
//! names are retained in declaration order; a trailing `/` turns the
//! pattern into a prefix match, anything else is matched exactly.
//!
//! The table is an ordered list: exact patterns are tried before prefix
//! patterns, and longer patterns before shorter ones within the same class,
//! so overlapping registrations resolve deterministically regardless of
//! registration order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::context::RequestContext;

/// At most this many path parameters are bound per match.
const MAX_PATH_PARAMS: usize = 10;

static PATH_PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").expect("placeholder regex"));

/// Boxed request handler. Handlers receive the shared per-request context
/// and write their response through it.
pub type Handler = Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Boxed filter predicate. Returning `false` halts processing of the
/// request; the filter may have written a response first.
pub type FilterFn = Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap an async closure into a [`FilterFn`].
pub fn filter<F, Fut>(f: F) -> FilterFn
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A compiled route: anchored pattern, parameter names in declaration
/// order, and the handler to dispatch to.
#[derive(Clone)]
pub struct Route {
    pattern: String,
    regex: Arc<Regex>,
    params: Vec<String>,
    prefix: bool,
    pub(crate) handler: Handler,
}

impl Route {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

#[derive(Clone)]
pub struct Filter {
    regex: Arc<Regex>,
    pub(crate) predicate: FilterFn,
}

/// Compile a user-supplied path into (anchored regex source, param names,
/// is_prefix). Returns `None` for an empty path.
fn compile(path: &str) -> Option<(String, Vec<String>, bool)> {
    if path.is_empty() {
        return None;
    }
    let mut pattern = path.to_string();
    let prefix = pattern.ends_with('/');
    if prefix {
        pattern.push_str(".*");
    } else {
        pattern.push('$');
    }
    if !pattern.starts_with('/') {
        pattern.insert(0, '/');
    }

    let mut params = Vec::new();
    let source = pattern.clone();
    for cap in PATH_PARAM_RE.captures_iter(&source) {
        params.push(cap[1].to_string());
        pattern = pattern.replacen(&cap[0], "(.*)", 1);
    }

    pattern.insert(0, '^');
    Some((pattern, params, prefix))
}

/// The mutable routing state owned by the server: ordered routes, the
/// filter chain, and the optional index slot for the literal `/`.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    filters: Vec<Filter>,
    index: Option<Handler>,
}

impl RouteTable {
    /// Register a handler under a path pattern. Empty paths are a no-op.
    /// The table stays sorted: exact before prefix, longer before shorter.
    pub fn register(&mut self, path: &str, handler: Handler) {
        let Some((pattern, params, prefix)) = compile(path) else {
            return;
        };
        let regex = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(err) => {
                warn!(%pattern, %err, "invalid route pattern, ignoring");
                return;
            }
        };
        info!(%pattern, "registered handler");
        // Re-registering a pattern replaces the previous handler.
        self.routes.retain(|r| r.pattern != pattern);
        self.routes.push(Route {
            pattern,
            regex: Arc::new(regex),
            params,
            prefix,
            handler,
        });
        self.routes.sort_by(|a, b| {
            a.prefix
                .cmp(&b.prefix)
                .then_with(|| b.pattern.len().cmp(&a.pattern.len()))
                .then_with(|| a.pattern.cmp(&b.pattern))
        });
    }

    /// Register a pre-dispatch filter. Empty paths are a no-op.
    pub fn register_filter(&mut self, path: &str, predicate: FilterFn) {
        let Some((pattern, _, _)) = compile(path) else {
            return;
        };
        match Regex::new(&pattern) {
            Ok(re) => self.filters.push(Filter {
                regex: Arc::new(re),
                predicate,
            }),
            Err(err) => warn!(%pattern, %err, "invalid filter pattern, ignoring"),
        }
    }

    pub fn register_index(&mut self, handler: Handler) {
        self.index = Some(handler);
    }

    pub fn index(&self) -> Option<Handler> {
        self.index.clone()
    }

    /// Predicates whose pattern matches `path`, in registration order.
    pub fn matching_filters(&self, path: &str) -> Vec<FilterFn> {
        self.filters
            .iter()
            .filter(|f| f.regex.is_match(path))
            .map(|f| f.predicate.clone())
            .collect()
    }

    /// First-match lookup. On a hit, binds up to [`MAX_PATH_PARAMS`]
    /// capture groups to the route's parameter names; surplus captures are
    /// skipped and surplus names stay unbound.
    pub fn resolve(&self, path: &str) -> Option<(Handler, HashMap<String, String>)> {
        for route in &self.routes {
            let Some(caps) = route.regex.captures(path) else {
                continue;
            };
            let mut params = HashMap::new();
            for (i, value) in caps.iter().skip(1).take(MAX_PATH_PARAMS).enumerate() {
                let Some(name) = route.params.get(i) else {
                    break;
                };
                if let Some(value) = value {
                    params.insert(name.clone(), value.as_str().to_string());
                }
            }
            return Some((route.handler.clone(), params));
        }
        None
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
