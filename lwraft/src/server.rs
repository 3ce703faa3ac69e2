use crate::config::RuntimeConfig;
use crate::metrics;
use crate::raft::{ConsensusNode, FileHardStateStore, FileLogStore, RaftHandle};
use crate::raft_client::GrpcTransport;
use crate::raft_service;
use crate::store::JournalSink;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One lwraft process: the consensus node, its peer listener, and the
/// metrics endpoint.
pub struct Server {
    config: RuntimeConfig,
    handle: Option<RaftHandle>,
    node_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: RuntimeConfig) -> Self {
        Server {
            config,
            handle: None,
            node_task: None,
            tasks: Vec::new(),
        }
    }

    pub fn handle(&self) -> Option<&RaftHandle> {
        self.handle.as_ref()
    }

    pub async fn start(&mut self, logger: &slog::Logger) -> anyhow::Result<()> {
        let handle = self.start_node(logger).await?;
        self.start_raft_server(handle.clone()).await?;
        self.start_metrics_server(handle.clone())?;
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        if let Some(task) = self.node_task.take() {
            let _ = task.await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        log::info!("server stop");
    }

    async fn start_node(&mut self, logger: &slog::Logger) -> anyhow::Result<RaftHandle> {
        let data_dir = &self.config.data_dir;
        let raft = &self.config.raft;
        let log_store = FileLogStore::open(data_dir.join("log"), raft.segment_entries)
            .with_context(|| format!("opening log under {}", data_dir.display()))?;
        let hard_state = FileHardStateStore::open(data_dir)?;
        let sink = JournalSink::open(data_dir)?;
        let transport = Arc::new(GrpcTransport::new(raft.max_frame_bytes));

        let (node, handle) = ConsensusNode::new(
            self.config.id,
            raft.clone(),
            self.config.bootstrap(),
            log_store,
            hard_state,
            sink,
            transport,
            logger,
        )?;
        self.node_task = Some(node.spawn());
        Ok(handle)
    }

    async fn start_raft_server(&mut self, handle: RaftHandle) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("binding raft listener on {}", self.config.addr))?;
        log::info!("raft server started on {}", self.config.addr);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = raft_service::serve(listener, handle).await {
                log::error!("raft server failed: {}", e);
            }
        }));
        Ok(())
    }

    fn start_metrics_server(&mut self, handle: RaftHandle) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics_addr {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let handle = handle.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let handle = handle.clone();
                    async move { Ok::<_, hyper::Error>(route(&req, &handle)) }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        }));
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}

fn route(req: &Request<Body>, handle: &RaftHandle) -> Response<Body> {
    match req.uri().path() {
        "/metrics" => match metrics::encode_text() {
            Ok(buffer) => Response::new(Body::from(buffer)),
            Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/status" => match serde_json::to_vec(&handle.status()) {
            Ok(body) => Response::new(Body::from(body)),
            Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => plain(StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

fn plain(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
