//! Admin HTTP endpoint over the registry: lookups plus registration,
//! deregistration and heartbeats for instances that report in themselves

use hyper::{
    body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use http_body_util::{BodyExt, Full, Limited};
use registry_core::{RegistryError, ServiceDefinition, ServiceInstance};
use registry_health::RegistryRuntime;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Largest request body accepted on write routes
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Accept admin connections until the task is aborted
pub async fn serve(listener: TcpListener, runtime: Arc<RegistryRuntime>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Error accepting admin connection: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let runtime = runtime.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let runtime = runtime.clone();
                handle_request(req, runtime)
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving admin connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    runtime: Arc<RegistryRuntime>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    debug!("{} {}", method, path);

    let reply = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(body) => route(&runtime, &method, &path, &query, &body.to_bytes()).await,
        Err(e) => Reply::text(StatusCode::PAYLOAD_TOO_LARGE, &format!("{}\n", e)),
    };
    let response = Response::builder()
        .status(reply.status)
        .header("Content-Type", reply.content_type)
        .body(Full::new(Bytes::from(reply.body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
    Ok(response)
}

/// Response produced by `route`, before it is turned into HTTP
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Reply {
    fn json<T: Serialize>(value: &T) -> Self {
        Self::json_with(StatusCode::OK, value)
    }

    fn json_with<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::text(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e)),
        }
    }

    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.as_bytes().to_vec(),
        }
    }

    fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, "Not Found\n")
    }

    fn error(e: &RegistryError) -> Self {
        let status = match e {
            RegistryError::ServiceNotFound(_) | RegistryError::InstanceNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RegistryError::RevisionConflict { .. } => StatusCode::CONFLICT,
            RegistryError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::InvalidConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::text(status, &format!("{}\n", e))
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Reply> {
    serde_json::from_slice(body)
        .map_err(|e| Reply::text(StatusCode::BAD_REQUEST, &format!("Invalid body: {}\n", e)))
}

pub async fn route(
    runtime: &RegistryRuntime,
    method: &Method,
    path: &str,
    query: &str,
    body: &[u8],
) -> Reply {
    let registry = runtime.registry();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["healthz"]) => Reply::text(StatusCode::OK, "OK\n"),
        (&Method::GET, ["metrics"]) => match runtime.metrics().gather() {
            Ok(text) => Reply {
                status: StatusCode::OK,
                content_type: "text/plain; version=0.0.4",
                body: text.into_bytes(),
            },
            Err(e) => Reply::text(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e)),
        },
        (&Method::GET, ["statistics"]) => Reply::json(&registry.get_service_statistics().await),
        (&Method::GET, ["services"]) => Reply::json(&registry.get_all_services().await),
        (&Method::POST, ["services"]) => {
            let definition: ServiceDefinition = match parse_body(body) {
                Ok(definition) => definition,
                Err(reply) => return reply,
            };
            match registry.register_service(definition.clone()).await {
                Ok(()) => Reply::json_with(StatusCode::CREATED, &definition),
                Err(e) => Reply::error(&e),
            }
        }
        (&Method::GET, ["services", id]) => match registry.get_service(id).await {
            Some(service) => Reply::json(&service),
            None => Reply::not_found(),
        },
        (&Method::DELETE, ["services", id]) => match registry.deregister_service(id).await {
            Ok(definition) => Reply::json(&definition),
            Err(e) => Reply::error(&e),
        },
        (&Method::GET, ["services", id, "instances"]) => match registry.get_service(id).await {
            Some(_) => Reply::json(&registry.get_instances(id).await),
            None => Reply::not_found(),
        },
        (&Method::POST, ["services", id, "instances"]) => {
            let mut instance: ServiceInstance = match parse_body(body) {
                Ok(instance) => instance,
                Err(reply) => return reply,
            };
            if instance.service_id != *id {
                return Reply::text(
                    StatusCode::BAD_REQUEST,
                    "Instance service_id does not match the path\n",
                );
            }
            // Identity and revision are assigned by the registry
            instance.id.clear();
            match registry.register_instance(instance).await {
                Ok(stored) => Reply::json_with(StatusCode::CREATED, &stored),
                Err(e) => Reply::error(&e),
            }
        }
        (&Method::DELETE, ["services", id, "instances", instance_id]) => {
            match registry.deregister_instance(id, instance_id).await {
                Ok(removed) => Reply::json(&removed),
                Err(e) => Reply::error(&e),
            }
        }
        (&Method::POST, ["services", id, "instances", instance_id, "heartbeat"]) => {
            match registry.record_heartbeat(id, instance_id).await {
                Ok(instance) => Reply::json(&instance),
                Err(e) => Reply::error(&e),
            }
        }
        (&Method::GET, ["services", id, "healthy"]) => match registry.get_service(id).await {
            Some(_) => Reply::json(&registry.get_healthy_instances(id).await),
            None => Reply::not_found(),
        },
        (&Method::GET, ["discover"]) => match query_param(query, "capability") {
            Some(capability) => Reply::json(&registry.discover_services(&capability).await),
            None => Reply::text(StatusCode::BAD_REQUEST, "Missing capability parameter\n"),
        },
        (m, _) if !matches!(*m, Method::GET | Method::POST | Method::DELETE) => {
            Reply::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n")
        }
        _ => Reply::not_found(),
    }
}

/// Percent-decoded value of `key` in a form-encoded query string
fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}
