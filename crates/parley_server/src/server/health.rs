#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Liveness/readiness state shared with the accept loop.
///
/// Liveness is implied by the probe endpoint answering at all; readiness is
/// flipped once the QUIC endpoint is bound and serving, and can be withdrawn
/// again during shutdown so orchestrators stop routing new clients here.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	started_at: Instant,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			started_at: Instant::now(),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_unready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn uptime_secs(&self) -> u64 {
		self.started_at.elapsed().as_secs()
	}
}

impl Default for HealthState {
	fn default() -> Self {
		Self::new()
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let state = state.clone();
				async move { Ok::<_, hyper::Error>(probe_response(req.method(), req.uri().path(), &state)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn probe_response(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return text_response(StatusCode::METHOD_NOT_ALLOWED, String::new());
	}

	match path {
		"/healthz" => {
			metrics::counter!("parley_server_health_probes_total", "probe" => "healthz").increment(1);
			text_response(
				StatusCode::OK,
				format!("ok {} uptime={}s", env!("CARGO_PKG_VERSION"), state.uptime_secs()),
			)
		}
		"/readyz" => {
			metrics::counter!("parley_server_health_probes_total", "probe" => "readyz").increment(1);
			if state.is_ready() {
				text_response(StatusCode::OK, format!("ready uptime={}s", state.uptime_secs()))
			} else {
				text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready".to_string())
			}
		}
		_ => text_response(StatusCode::NOT_FOUND, String::new()),
	}
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from(body)))
		.expect("static response parts are valid")
}
