//! # gantry: a single-process service middleware kernel
//!
//! `gantry` bundles the machinery a small service needs into one process:
//! an HTTP application server with a pattern router and per-request
//! instrumentation, a named-task scheduler with pause/continue/stop
//! control, an asynchronous task queue with per-task timeouts and full run
//! history, and a DAG pipeline engine that routes values through gated
//! logic nodes with tracing. At the edges sit a peer-replicated service
//! registry, a TTL cache, and (behind the `kafka` feature) a
//! publish/subscribe façade over a broker cluster.
//!
//! ## Overview
//!
//! Requests enter through [`http::HttpServer`]: the filter chain runs
//! first, then the router resolves the first matching pattern and hands the
//! handler a shared [`http::context::RequestContext`]. Handlers read the
//! request through the context and write the response through it, and
//! exactly one terminal write wins per request. From there a handler can
//! enqueue work on a [`queue::TaskQueue`], start a [`pipeline::Pipeline`]
//! run, publish on the bus, or consult the
//! [`registry::ServiceRegistry`]. The side subsystems (scheduled tasks,
//! cache eviction, the registry staleness sweeper) run on background
//! workers that exit on explicit stop signals or on panic; a panic never
//! escapes its worker.
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use gantry::{Application, config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = config::Args::parse();
//!     let cfg = config::Config::load(&args)?;
//!     gantry::telemetry::init_telemetry()?;
//!
//!     let app = Application::new(cfg)?;
//!     app.server().register_handler("/hello/{name}", |ctx| async move {
//!         let name = ctx.path_param("name").unwrap_or_default();
//!         let _ = ctx.api_response(0, "", serde_json::json!({ "hello": name }));
//!     });
//!
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("ctrl-c handler");
//!     })
//!     .await
//! }
//! ```

#[cfg(feature = "kafka")]
pub mod bus;
pub mod cache;
pub mod config;
pub mod errors;
pub mod http;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod telemetry;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::{Config, Properties};
use http::HttpServer;
use pipeline::PipelineManager;
use registry::ServiceRegistry;
use schedule::ScheduleRegistry;

/// One assembled middleware process: the HTTP server plus the shared side
/// subsystems, wired from a [`Config`].
pub struct Application {
    config: Config,
    server: HttpServer,
    schedules: ScheduleRegistry,
    pipelines: PipelineManager,
    registry: ServiceRegistry,
}

impl Application {
    /// Wire up the server and built-in services. Nothing is bound or
    /// spawned yet; that happens in [`Application::serve`].
    pub fn new(config: Config) -> errors::Result<Self> {
        let server = HttpServer::new(config.cross_origin);
        let schedules = ScheduleRegistry::new();
        let pipelines = PipelineManager::new();
        let registry = ServiceRegistry::new(config.registry_peers.clone(), config.registry_key.clone());

        if let Some(path) = &config.messages_path {
            server.load_messages(&Properties::load(path)?);
        }
        if config.enable_metrics {
            http::metrics::register_metrics_service(&server);
        }
        registry::register_registry_service(&server, &registry, config.registry_query);
        schedule::register_schedule_service(&server, &schedules, "/_service/schedule");

        Ok(Application {
            config,
            server,
            schedules,
            pipelines,
            registry,
        })
    }

    pub fn server(&self) -> &HttpServer {
        &self.server
    }

    pub fn schedules(&self) -> &ScheduleRegistry {
        &self.schedules
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind, start the background workers, and serve until `shutdown`
    /// resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "gantry listening");

        let stop = CancellationToken::new();
        self.registry.spawn_sweeper(stop.clone());

        let result = self.server.serve(listener, shutdown).await;
        stop.cancel();
        result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn application_wires_builtin_services() {
        let config = Config::default();
        let app = Application::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = app.server().clone();
        tokio::spawn(async move {
            server.serve(listener, std::future::pending()).await.unwrap();
        });

        let metrics = reqwest::get(format!("http://{addr}/metrics")).await.unwrap().text().await.unwrap();
        assert!(metrics.contains("request_count"));

        let schedules = reqwest::get(format!("http://{addr}/_service/schedule")).await.unwrap();
        assert_eq!(schedules.status().as_u16(), 200);

        let endpoints = reqwest::get(format!("http://{addr}/_service/endpoints")).await.unwrap().text().await.unwrap();
        assert!(endpoints.contains("\"code\":0"));
    }
}
