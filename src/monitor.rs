//! The Monitor component (§4.4): reaps idle containers and drains the
//! termination queue, notifying clients of the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::message::{framing_codec, CallbackMessage};
use crate::runtime::{now_unix, RuntimeAdapter};
use crate::store::Store;

/// Minimum container uptime before it's considered for idle sampling (§4.4).
const MIN_UPTIME_SECS: i64 = 60;
/// Idle threshold: CPU utilization below this percentage over the sample
/// window counts as idle (§4.4).
const IDLE_THRESHOLD_PCT: f64 = 10.0;

pub struct Monitor {
    config: Arc<Config>,
    store: Store,
    runtime: Arc<dyn RuntimeAdapter>,
}

impl Monitor {
    pub fn new(config: Arc<Config>, store: Store, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self { config, store, runtime }
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let idle = Arc::clone(&self);
        let idle_token = token.clone();
        let drain = Arc::clone(&self);
        let drain_token = token;

        tokio::spawn(async move {
            let idle_handle = tokio::spawn(async move { idle.idle_scan_loop(idle_token).await });
            let drain_handle = tokio::spawn(async move { drain.drain_loop(drain_token).await });
            let _ = tokio::join!(idle_handle, drain_handle);
            info!("monitor stopped");
        })
    }

    async fn idle_scan_loop(&self, token: CancellationToken) {
        info!("idle scanner started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_scan_interval) => {}
            }
            if let Err(e) = self.scan_once().await {
                error!("idle scan failed: {e:#}");
            }
        }
    }

    /// One idle-detection cycle (§4.4): samples CPU twice, `idle_sample_window`
    /// apart, for every container older than `MIN_UPTIME_SECS`. A container
    /// that disappears between samples is simply skipped for this cycle —
    /// it contributes no idle finding, rather than reusing a stale reading
    /// (§9 Open Questions).
    async fn scan_once(&self) -> anyhow::Result<()> {
        let running = self.runtime.list().await?;
        let now = now_unix();
        let candidates: Vec<_> = running
            .into_iter()
            .filter(|c| now - c.created_at > MIN_UPTIME_SECS)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let mut first = HashMap::new();
        for c in &candidates {
            if let Ok(sample) = self.runtime.stats(&c.id).await {
                first.insert(c.id.clone(), sample);
            }
        }

        tokio::time::sleep(self.config.idle_sample_window).await;

        let cores = crate::host::HostProbe::new().core_count() as f64;
        for c in &candidates {
            let Some(before) = first.get(&c.id) else { continue };
            let after = match self.runtime.stats(&c.id).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let delta_total = after.cpu_total.saturating_sub(before.cpu_total) as f64;
            let delta_system = after.cpu_system.saturating_sub(before.cpu_system) as f64;
            if delta_system <= 0.0 {
                continue;
            }
            let pct = (delta_total / delta_system) * 100.0 * cores;
            if pct < IDLE_THRESHOLD_PCT {
                if let Ok(job_id) = c.name.parse::<i64>() {
                    info!(job_id, pct, "container idle, queuing for termination");
                    self.store.enqueue_termination(job_id, "Container Idle").await?;
                }
            }
        }
        Ok(())
    }

    async fn drain_loop(&self, token: CancellationToken) {
        info!("termination drain started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.termination_drain_interval) => {}
            }
            if let Err(e) = self.drain_once().await {
                error!("termination drain failed: {e:#}");
            }
        }
    }

    /// Drains the termination queue (§4.4): stop + remove each container
    /// (tolerating `NotFound`), delete the row, and notify the owning
    /// client only if the container was actually still running.
    async fn drain_once(&self) -> anyhow::Result<()> {
        for (job_id, reason) in self.store.list_termination_requests().await? {
            let name = job_id.to_string();
            let was_running = self.runtime.inspect(&name).await.is_ok();

            if let Err(e) = self.runtime.stop(&name).await {
                warn!(job_id, "stop during drain failed: {e}");
            }
            if let Err(e) = self.runtime.remove(&name).await {
                warn!(job_id, "remove during drain failed: {e}");
            }
            self.store.delete_termination_request(job_id).await?;

            if was_running {
                self.notify_terminated(job_id, &reason).await;
            }
        }
        Ok(())
    }

    async fn notify_terminated(&self, job_id: i64, reason: &str) {
        let Ok(Some((client_name, client_ip, client_port))) =
            self.store.lookup_history(job_id).await
        else {
            warn!(job_id, "no history row for terminated job, client not notified");
            return;
        };

        let ca_path = self.config.per_client_ca_path(&client_name);
        let tls_config = match crate::tls::client_tls_config(
            &ca_path,
            &self.config.server_cert_path(),
            &self.config.server_key_path(),
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(job_id, "building termination callback TLS config failed: {e}");
                return;
            }
        };
        let connector = TlsConnector::from(tls_config);
        let addr = format!("{client_ip}:{client_port}");

        let connect = async {
            let tcp = tokio::net::TcpStream::connect(&addr).await?;
            let server_name = crate::tls::server_name_for(&client_name)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            connector.connect(server_name, tcp).await
        };
        let mut stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(job_id, "termination callback connect to {addr} failed: {e}");
                return;
            }
            Err(_) => {
                warn!(job_id, "termination callback connect to {addr} timed out");
                return;
            }
        };

        let msg = CallbackMessage::Terminated { job_id, reason: reason.to_string() };
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                error!(job_id, "encoding Terminated callback failed: {e}");
                return;
            }
        };
        let mut codec = framing_codec();
        let mut buf = bytes::BytesMut::new();
        if let Err(e) = codec.encode(payload.into(), &mut buf) {
            error!(job_id, "framing Terminated callback failed: {e}");
            return;
        }
        if let Err(e) = stream.write_all(&buf).await {
            warn!(job_id, "sending Terminated callback failed: {e}");
        }
    }
}
