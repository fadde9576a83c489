//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use classification_mesh::client::ServiceTransport;
use classification_mesh::config::{InstanceConfig, MeshConfig, ServiceConfig};
use classification_mesh::discovery::ServiceInstance;
use classification_mesh::health::probe::HealthProbe;
use classification_mesh::observability::MetricsSink;
use classification_mesh::{Mesh, MeshError, MeshResult};

/// Start a programmable JSON backend. `f` returns `(status, body)`.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;

                let (status, body) = f().await;
                let status_text = match status {
                    200 => "200 OK",
                    404 => "404 Not Found",
                    429 => "429 Too Many Requests",
                    500 => "500 Internal Server Error",
                    503 => "503 Service Unavailable",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_text,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Scripted outcome of one transport call.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Fail { retryable: bool },
    Hang(Duration),
}

/// Transport replaying scripted outcomes, then echoing the request.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    pub calls: AtomicU32,
    pub completed: AtomicU32,
    pub instances: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ServiceTransport for ScriptedTransport {
    fn call<'a>(
        &'a self,
        instance: &'a ServiceInstance,
        method: &'a str,
        request: &'a Value,
    ) -> BoxFuture<'a, MeshResult<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().unwrap().push(instance.id.clone());
        let step = self.steps.lock().unwrap().pop_front();

        Box::pin(async move {
            let result = match step {
                None => Ok(json!({ "instance": instance.id, "method": method, "echo": request })),
                Some(Step::Ok(value)) => Ok(value),
                Some(Step::Fail { retryable }) => Err(MeshError::Upstream {
                    target: instance.service.clone(),
                    message: "scripted failure".into(),
                    retryable,
                }),
                Some(Step::Hang(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(json!({ "late": true }))
                }
            };
            self.completed.fetch_add(1, Ordering::SeqCst);
            result
        })
    }
}

/// Probe that always answers healthy.
pub struct AlwaysUp;

impl HealthProbe for AlwaysUp {
    fn probe<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Request { target: String, success: bool },
    Latency { target: String },
    Error { target: String, kind: String },
}

/// Sink keeping every record in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<Recorded> {
        self.records.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn record_request(&self, target: &str, _method: &str, _duration: Duration, success: bool) {
        self.records.lock().unwrap().push(Recorded::Request {
            target: target.into(),
            success,
        });
    }

    fn record_latency(&self, target: &str, _method: &str, _latency: Duration) {
        self.records.lock().unwrap().push(Recorded::Latency { target: target.into() });
    }

    fn record_error(&self, target: &str, _method: &str, kind: &str) {
        self.records.lock().unwrap().push(Recorded::Error {
            target: target.into(),
            kind: kind.into(),
        });
    }
}

/// A service with `count` instances `<name>-0`, `<name>-1`, …
pub fn service(name: &str, count: u16) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        version: "v1".into(),
        kind: Default::default(),
        capabilities: vec!["classify".into()],
        instances: (0..count)
            .map(|i| InstanceConfig {
                id: Some(format!("{name}-{i}")),
                host: "127.0.0.1".into(),
                port: 9000 + i,
                protocol: Default::default(),
                capacity: 10,
                metadata: Default::default(),
            })
            .collect(),
    }
}

pub fn build_mesh(config: MeshConfig, transport: Arc<ScriptedTransport>) -> Mesh {
    Mesh::with_parts(config, Arc::new(AlwaysUp), transport).unwrap()
}

/// Client over `mesh` with its own transport and metrics sink.
pub fn build_client(
    mesh: &Mesh,
    transport: Arc<ScriptedTransport>,
    sink: Arc<RecordingSink>,
) -> Arc<classification_mesh::ServiceClient> {
    Arc::new(
        classification_mesh::ServiceClient::new(
            mesh.config.client.clone(),
            mesh.balancer.clone(),
            mesh.limiter.clone(),
            mesh.breakers.clone(),
            transport,
        )
        .with_metrics(sink)
        .with_passive_health(mesh.passive.clone()),
    )
}
