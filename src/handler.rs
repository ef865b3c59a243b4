//! Inbound request transport (§5 "RequestHandler"): accepts one mTLS
//! connection per request, authenticates the peer by certificate CN,
//! applies exactly one `Store` write, and replies on the same connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::message::{framing_codec, InboundRequest, Priority, ReplyMessage};
use crate::store::Store;

pub struct RequestHandler {
    config: Arc<Config>,
    store: Store,
}

impl RequestHandler {
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        Self { config, store }
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve(token).await {
                error!("request handler stopped: {e:#}");
            }
        })
    }

    async fn serve(&self, token: CancellationToken) -> anyhow::Result<()> {
        let tls_config = crate::tls::server_tls_config(
            &self.config.server_cert_path(),
            &self.config.server_key_path(),
            &self.config.client_ca_bundle_path(),
        )?;
        let acceptor = TlsAcceptor::from(tls_config);
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("request handler listening on {addr}");

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => result,
            };
            let (tcp, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let store = self.store.clone();
            let max_queue = self.config.max_queue;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(acceptor, tcp, peer_addr.ip().to_string(), store, max_queue).await {
                    warn!(peer = %peer_addr, "request handling failed: {e:#}");
                }
            });
        }
        Ok(())
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer_ip: String,
    store: Store,
    max_queue: i64,
) -> anyhow::Result<()> {
    let stream = acceptor.accept(tcp).await?;
    let client_name = peer_common_name(&stream)?;

    let mut framed: Framed<TlsStream<TcpStream>, tokio_util::codec::LengthDelimitedCodec> =
        Framed::new(stream, framing_codec());

    let Some(frame) = framed.next().await else {
        return Ok(());
    };
    let frame = frame?;

    let request: InboundRequest = match serde_json::from_slice(&frame) {
        Ok(r) => r,
        Err(e) => {
            // §8 S6: an unrecognized or malformed request is refused on the
            // same connection rather than silently dropped.
            warn!(client = %client_name, "malformed request: {e}");
            let payload = serde_json::to_vec(&ReplyMessage::Refused {
                reason: "The request message was invalid".to_string(),
            })?;
            framed.send(payload.into()).await?;
            return Ok(());
        }
    };

    let reply = match request {
        InboundRequest::NewJob { job } => handle_new_job(&store, &client_name, &peer_ip, job, max_queue).await,
        InboundRequest::Terminate { job_id } => handle_terminate(&store, job_id).await,
    };

    if let Some(reply) = reply {
        let payload = serde_json::to_vec(&reply)?;
        framed.send(payload.into()).await?;
    }
    Ok(())
}

async fn handle_new_job(
    store: &Store,
    client_name: &str,
    peer_ip: &str,
    job: crate::message::NewJobBody,
    max_queue: i64,
) -> Option<ReplyMessage> {
    let priority = match Priority::try_from(job.priority as i64) {
        Ok(p) => p,
        Err(()) => {
            return Some(ReplyMessage::Refused {
                reason: "The request message was invalid".to_string(),
            });
        }
    };

    match store
        .enqueue_job(client_name, peer_ip, job.comms_port, priority, &job.ports, max_queue)
        .await
    {
        Ok(job_id) => {
            info!(job_id, client = client_name, "job accepted");
            Some(ReplyMessage::Accepted { request_type: "Start", job_id })
        }
        Err(crate::error::EdgeError::QueueFull) => {
            Some(ReplyMessage::Refused { reason: "No space in job queue".to_string() })
        }
        Err(e) => {
            error!(client = client_name, "enqueue failed: {e}");
            Some(ReplyMessage::Refused { reason: "Internal error".to_string() })
        }
    }
}

/// §6 Terminate logic: a still-waiting job is removed immediately and
/// acknowledged with `Terminated`/`Termination Requested`; a job that has
/// already been dispatched has no waiting row to remove, so it is instead
/// queued for the monitor's drain (which later reports the outcome over its
/// own callback connection) and acknowledged here with plain `Accepted`.
async fn handle_terminate(store: &Store, job_id: i64) -> Option<ReplyMessage> {
    match store.remove_waiting(job_id).await {
        Ok(true) => Some(ReplyMessage::TerminatedWaiting { job_id, reason: "Termination Requested" }),
        Ok(false) => {
            if let Err(e) = store.enqueue_termination(job_id, "Termination Requested").await {
                error!(job_id, "queuing termination failed: {e}");
                return None;
            }
            Some(ReplyMessage::Accepted { request_type: "Terminate", job_id })
        }
        Err(e) => {
            error!(job_id, "terminate lookup failed: {e}");
            None
        }
    }
}

fn peer_common_name(stream: &TlsStream<TcpStream>) -> anyhow::Result<String> {
    let (_, session) = stream.get_ref();
    let certs = session
        .peer_certificates()
        .ok_or_else(|| anyhow::anyhow!("no client certificate presented"))?;
    let cert = certs.first().ok_or_else(|| anyhow::anyhow!("empty client certificate chain"))?;
    Ok(crate::tls::common_name(cert)?)
}
