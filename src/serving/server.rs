use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;

use super::{LoadRequest, ModelRegistry};
use crate::error::RegistryError;
use crate::observability::MetricsCollector;

#[derive(Deserialize)]
struct PredictRequest {
    data: Vec<Vec<f64>>,
}

/// HTTP front for a [`ModelRegistry`], running on its own thread.
pub struct ModelServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

struct Shared {
    registry: Arc<ModelRegistry>,
    metrics: MetricsCollector,
}

impl ModelServer {
    pub fn start(
        listen: SocketAddr,
        registry: Arc<ModelRegistry>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let shared = Arc::new(Shared { registry, metrics });

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(err.to_string())).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let shared = shared.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let shared = shared.clone();
                            async move { handle_request(req, shared).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Model server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .context("Model server thread exited before binding")?
            .map_err(|err| anyhow!("Failed to bind model server on {listen}: {err}"))?;
        tracing::info!(%address, "Model server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Blocks until the server thread exits.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ModelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    shared: Arc<Shared>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["internal", "load", name]) => {
            let name = name.to_string();
            let body = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<LoadRequest>(&body) {
                Ok(request) => {
                    let registry = shared.registry.clone();
                    let loaded = tokio::task::spawn_blocking(move || {
                        registry.load(&name, &request.run_reference, &request.version)
                    })
                    .await;
                    match loaded {
                        Ok(Ok(info)) => json_response(
                            StatusCode::OK,
                            &json!({
                                "message": format!(
                                    "Model '{}' v{} loaded successfully.",
                                    info.model_name, info.version
                                )
                            }),
                        ),
                        Ok(Err(err)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("Failed to load model: {err}")),
                        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
                    }
                }
                Err(err) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
            }
        }
        (&Method::POST, ["predict", name]) => {
            let name = name.to_string();
            let body = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<PredictRequest>(&body) {
                Ok(request) => match shared.registry.predict(&name, &request.data) {
                    Ok(prediction) => json_response(StatusCode::OK, &prediction),
                    Err(err) => registry_error(err),
                },
                Err(err) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
            }
        }
        (&Method::GET, ["models"]) => match shared.registry.list() {
            Ok(models) => json_response(StatusCode::OK, &models),
            Err(err) => registry_error(err),
        },
        (&Method::DELETE, ["models", name]) => match shared.registry.unload(name) {
            Ok(()) => json_response(
                StatusCode::OK,
                &json!({ "message": format!("Model '{name}' unloaded.") }),
            ),
            Err(err) => registry_error(err),
        },
        (&Method::GET, ["metrics"]) => {
            Response::new(Body::from(shared.metrics.snapshot().to_prometheus()))
        }
        _ => plain(StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found")),
    };
    Ok(response)
}

fn registry_error(err: RegistryError) -> Response<Body> {
    let status = match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, detail: &str) -> Response<Body> {
    json_response(status, &json!({ "detail": detail }))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn plain(status: StatusCode, body: Bytes) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
