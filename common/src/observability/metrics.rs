//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per process. The coordinator records into it from
//! the hot path with plain counter increments and histogram observations.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus registry plus the group-sync metric handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Clock sync
    pub probes_sent_total: IntCounter,
    pub probes_timed_out_total: IntCounter,
    pub probes_failed_total: IntCounter,
    pub clock_offset_ms: IntGauge,
    pub round_trip_seconds: Histogram,

    // Commands
    pub commands_applied_total: IntCounter,
    pub commands_ignored_total: IntCounter,

    // Drift correction
    pub drift_seconds: Histogram,
    pub speed_corrections_total: IntCounter,
    pub skip_corrections_total: IntCounter,
    pub corrections_exhausted_total: IntCounter,

    // Peers
    pub peers_connected: IntGauge,
    pub peer_messages_dropped_total: IntCounter,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    // ---
    Ok(IntCounter::with_opts(Opts::new(name, help))?)
}

fn gauge(name: &str, help: &str) -> Result<IntGauge> {
    // ---
    Ok(IntGauge::with_opts(Opts::new(name, help))?)
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("groupsync".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let probes_sent_total = counter("time_probes_sent_total", "Total clock probes sent")?;
        let probes_timed_out_total = counter(
            "time_probes_timed_out_total",
            "Clock probes that got no answer before their deadline",
        )?;
        let probes_failed_total = counter(
            "time_probes_failed_total",
            "Clock probes that failed at the transport level",
        )?;
        let clock_offset_ms = gauge(
            "clock_offset_ms",
            "Current estimated server clock offset in milliseconds",
        )?;
        let round_trip_seconds = Histogram::with_opts(
            HistogramOpts::new("time_probe_round_trip_seconds", "Probe round trip (seconds)")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;

        let commands_applied_total = counter(
            "commands_applied_total",
            "Group playback commands scheduled locally",
        )?;
        let commands_ignored_total = counter(
            "commands_ignored_total",
            "Group playback commands dropped as stale or duplicate",
        )?;

        let drift_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "playback_drift_seconds",
                "Absolute local playback drift at each drift check (seconds)",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.2, 0.3, 0.5, 1.0, 2.0, 5.0]),
        )?;
        let speed_corrections_total = counter(
            "speed_corrections_total",
            "Drift corrections applied by playback-rate change",
        )?;
        let skip_corrections_total = counter(
            "skip_corrections_total",
            "Drift corrections applied by hard seek",
        )?;
        let corrections_exhausted_total = counter(
            "corrections_exhausted_total",
            "Times drift correction gave up for a session",
        )?;

        let peers_connected = gauge("peers_connected", "Currently connected peers")?;
        let peer_messages_dropped_total = counter(
            "peer_messages_dropped_total",
            "Peer messages dropped as malformed or undeliverable",
        )?;

        // Register all metrics
        registry.register(Box::new(probes_sent_total.clone()))?;
        registry.register(Box::new(probes_timed_out_total.clone()))?;
        registry.register(Box::new(probes_failed_total.clone()))?;
        registry.register(Box::new(clock_offset_ms.clone()))?;
        registry.register(Box::new(round_trip_seconds.clone()))?;
        registry.register(Box::new(commands_applied_total.clone()))?;
        registry.register(Box::new(commands_ignored_total.clone()))?;
        registry.register(Box::new(drift_seconds.clone()))?;
        registry.register(Box::new(speed_corrections_total.clone()))?;
        registry.register(Box::new(skip_corrections_total.clone()))?;
        registry.register(Box::new(corrections_exhausted_total.clone()))?;
        registry.register(Box::new(peers_connected.clone()))?;
        registry.register(Box::new(peer_messages_dropped_total.clone()))?;

        Ok(Self {
            registry,
            probes_sent_total,
            probes_timed_out_total,
            probes_failed_total,
            clock_offset_ms,
            round_trip_seconds,
            commands_applied_total,
            commands_ignored_total,
            drift_seconds,
            speed_corrections_total,
            skip_corrections_total,
            corrections_exhausted_total,
            peers_connected,
            peer_messages_dropped_total,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_registers_sync_series() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.speed_corrections_total.inc();
        ctx.drift_seconds.observe(0.15);

        let names: Vec<String> = ctx.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"groupsync_speed_corrections_total".to_string()));
        assert!(names.contains(&"groupsync_playback_drift_seconds".to_string()));
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let registry = Arc::new(ctx.registry.clone());

        let req = Request::builder()
            .method(Method::GET)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = handle_metrics_request(req, Arc::clone(&registry)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = handle_metrics_request(req, registry).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
