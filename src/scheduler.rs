//! The Scheduler component (§4.3): selects the next waiting job under one
//! of four fairness disciplines, allocates host ports, launches a
//! container, and hands the client a shell key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, Strategy};
use crate::host::HostProbe;
use crate::message::{framing_codec, CallbackMessage, Priority};
use crate::runtime::RuntimeAdapter;
use crate::store::{JobRow, Store};

const PRIORITY_WEIGHTS: [(Priority, f64); 3] = [
    (Priority::High, 0.50),
    (Priority::Medium, 0.35),
    (Priority::Low, 0.15),
];

fn priority_weight(p: Priority) -> f64 {
    PRIORITY_WEIGHTS.iter().find(|(q, _)| *q == p).map(|(_, w)| *w).unwrap_or(0.0)
}

/// Deficit-style priority selection (§4.3 `SelectPriority`), re-expressed as
/// a plain descending scan rather than the original's depth-≤3 recursion
/// (§9 design note).
pub fn select_priority(waiting_desc: &[Priority], freq: &HashMap<Priority, f64>) -> Priority {
    for (idx, p) in waiting_desc.iter().enumerate() {
        let observed = freq.get(p).copied().unwrap_or(0.0);
        if observed < priority_weight(*p) {
            return *p;
        }
        if idx == waiting_desc.len() - 1 {
            return waiting_desc[0];
        }
    }
    waiting_desc[0]
}

pub struct Scheduler {
    config: Arc<Config>,
    store: Store,
    runtime: Arc<dyn RuntimeAdapter>,
    host: Arc<HostProbe>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        runtime: Arc<dyn RuntimeAdapter>,
        host: Arc<HostProbe>,
    ) -> Self {
        Self { config, store, runtime, host }
    }

    /// Spawns the control loop (§4.3). Cooperative: a rejected admission
    /// gate yields a short sleep rather than busy-spinning.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("scheduler started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                match self.tick().await {
                    Ok(dispatched) => {
                        if !dispatched {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                    Err(e) => {
                        error!("scheduler tick failed: {e:#}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            self.shutdown().await;
            info!("scheduler stopped");
        })
    }

    /// One iteration of the control loop (§4.3). Returns whether a job was
    /// dispatched.
    async fn tick(&self) -> anyhow::Result<bool> {
        let running = self.runtime.list().await?;
        let waiting = self.store.waiting_size().await?;
        if waiting == 0 || running.len() as u32 >= self.config.max_jobs {
            return Ok(false);
        }
        if !self.host.resources_available(
            self.config.cpu_unit,
            self.config.max_cpu,
            self.config.mem_unit,
        ) {
            return Ok(false);
        }
        self.dispatch_one().await?;
        Ok(true)
    }

    async fn select_next_job(&self) -> anyhow::Result<Option<JobRow>> {
        let job = match self.config.strategy {
            Strategy::Fifo => self.store.oldest_waiting().await?,
            Strategy::FairByClient => {
                let client = self.pick_fair_client(None).await?;
                match client {
                    Some(c) => self.store.oldest_waiting_for_client(&c).await?,
                    None => None,
                }
            }
            Strategy::WeightedPriority => {
                let priority = self.select_next_priority().await?;
                match priority {
                    Some(p) => self.store.oldest_waiting_for_priority(p).await?,
                    None => None,
                }
            }
            Strategy::WeightedPriorityFairByClient => {
                let priority = self.select_next_priority().await?;
                match priority {
                    Some(p) => {
                        let client = self.pick_fair_client(Some(p)).await?;
                        match client {
                            Some(c) => self.store.oldest_waiting_for_client_priority(&c, p).await?,
                            None => None,
                        }
                    }
                    None => None,
                }
            }
        };
        Ok(job)
    }

    /// Among waiting clients (optionally scoped to one priority), the one
    /// with the fewest rolling-7-day history rows; ties broken by the order
    /// the client list itself was returned in (§4.3 strategy 1/3).
    async fn pick_fair_client(&self, priority: Option<Priority>) -> anyhow::Result<Option<String>> {
        let clients = self.store.distinct_waiting_clients(priority).await?;
        let mut best: Option<(String, i64)> = None;
        for client in clients {
            let count = self.store.history_count_7d(Some(&client), priority).await?;
            if best.as_ref().map(|(_, n)| count < *n).unwrap_or(true) {
                best = Some((client, count));
            }
        }
        Ok(best.map(|(c, _)| c))
    }

    async fn select_next_priority(&self) -> anyhow::Result<Option<Priority>> {
        let mut waiting = self.store.distinct_waiting_priorities().await?;
        if waiting.is_empty() {
            return Ok(None);
        }
        waiting.sort_by(|a, b| b.cmp(a));
        waiting.dedup();

        let total = self.store.history_count_7d(None, None).await?;
        let mut freq = HashMap::new();
        for p in &waiting {
            let count = self.store.history_count_7d(None, Some(*p)).await?;
            let f = if count > 0 && total > 0 { count as f64 / total as f64 } else { 0.0 };
            freq.insert(*p, f);
        }
        Ok(Some(select_priority(&waiting, &freq)))
    }

    fn parse_container_ports(requested: &str) -> Vec<String> {
        let mut ports: Vec<String> = requested
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        ports.push("22".to_string());
        ports
    }

    fn allocate_ports(&self, container_ports: &[String], used: &HashSet<u16>) -> BTreeMap<String, u16> {
        let mut rng = rand::rng();
        let mut used = used.clone();
        let mut result = BTreeMap::new();
        for cp in container_ports {
            loop {
                let candidate = rng.random_range(self.config.port_lower..=self.config.port_upper);
                if !used.contains(&candidate) {
                    used.insert(candidate);
                    result.insert(cp.clone(), candidate);
                    break;
                }
            }
        }
        result
    }

    async fn used_ports(&self) -> anyhow::Result<HashSet<u16>> {
        let running = self.runtime.list().await?;
        Ok(running
            .into_iter()
            .flat_map(|c| c.port_bindings.into_values())
            .collect())
    }

    /// Dispatch sequence (§4.3): move to history, allocate ports, connect
    /// out to the client, launch the container with a retry ladder, notify,
    /// then install the client's shell key.
    async fn dispatch_one(&self) -> anyhow::Result<()> {
        let job = match self.select_next_job().await? {
            Some(j) => j,
            None => return Ok(()),
        };

        if !self.store.move_to_history(job.id).await? {
            // The waiting row was already gone — e.g. a client's Terminate
            // request raced us and removed it first. No container for a job
            // the client was just told was terminated (Testable Property #9).
            info!(job_id = job.id, "job vanished before dispatch; skipping launch");
            return Ok(());
        }
        info!(job_id = job.id, client = %job.client_name, "dispatching job");

        let container_ports = Self::parse_container_ports(&job.requested_ports);
        let mut port_map = self.allocate_ports(&container_ports, &self.used_ports().await?);

        let callback = self.connect_to_client(&job).await;

        let container_id = self.launch_with_retries(&job, &mut port_map).await;

        let Some(container_id) = container_id else {
            warn!(job_id = job.id, "Unable to start the job");
            return Ok(());
        };

        if let Some(mut stream) = callback {
            if let Err(e) = self.notify_started(&mut stream, job.id, &port_map).await {
                warn!(job_id = job.id, "failed to notify client of Started: {e:#}");
            } else if let Err(e) = self.install_shell_key(&mut stream, &container_id).await {
                warn!(job_id = job.id, "failed to install shell key: {e:#}");
            }
        } else {
            warn!(job_id = job.id, "no callback channel; client was not notified");
        }

        Ok(())
    }

    /// §4.3 dispatch step 4's retry ladder: attempt with the assigned port
    /// map; on failure, reconstruct the runtime handle and retry once more
    /// with that same port map; on a further failure, re-allocate ports and
    /// retry once more; then abandon the dispatch.
    async fn launch_with_retries(
        &self,
        job: &JobRow,
        port_map: &mut BTreeMap<String, u16>,
    ) -> Option<String> {
        let cpu_period = self.config.max_cpu;
        let cpu_quota = self.config.cpu_unit;
        let mem_bytes = self.config.mem_unit * (1 << 20);
        let name = job.id.to_string();

        match self.runtime.run(&name, cpu_period, cpu_quota, mem_bytes, port_map).await {
            Ok(id) => return Some(id),
            Err(e) => warn!(job_id = job.id, attempt = 0, "container run failed: {e}"),
        }

        if let Err(e) = self.runtime.reconnect().await {
            warn!(job_id = job.id, "runtime handle reconnect failed: {e}");
        }
        match self.runtime.run(&name, cpu_period, cpu_quota, mem_bytes, port_map).await {
            Ok(id) => return Some(id),
            Err(e) => warn!(job_id = job.id, attempt = 1, "container run failed: {e}"),
        }

        if let Ok(used) = self.used_ports().await {
            let container_ports = Self::parse_container_ports(&job.requested_ports);
            *port_map = self.allocate_ports(&container_ports, &used);
        }
        match self.runtime.run(&name, cpu_period, cpu_quota, mem_bytes, port_map).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(job_id = job.id, attempt = 2, "container run failed: {e}");
                None
            }
        }
    }

    async fn connect_to_client(
        &self,
        job: &JobRow,
    ) -> Option<tokio_rustls::client::TlsStream<TcpStream>> {
        let ca_path = self.config.per_client_ca_path(&job.client_name);
        let tls_config = match crate::tls::client_tls_config(
            &ca_path,
            &self.config.server_cert_path(),
            &self.config.server_key_path(),
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(job_id = job.id, "building callback TLS config failed: {e}");
                return None;
            }
        };
        let connector = TlsConnector::from(tls_config);
        let addr = format!("{}:{}", job.client_ip, job.client_port);
        let connect = async {
            let tcp = TcpStream::connect(&addr).await?;
            let server_name = crate::tls::server_name_for(&job.client_name)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            connector.connect(server_name, tcp).await
        };
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                warn!(job_id = job.id, "callback connect to {addr} failed: {e}");
                None
            }
            Err(_) => {
                warn!(job_id = job.id, "callback connect to {addr} timed out");
                None
            }
        }
    }

    async fn notify_started(
        &self,
        stream: &mut tokio_rustls::client::TlsStream<TcpStream>,
        job_id: i64,
        ports: &BTreeMap<String, u16>,
    ) -> anyhow::Result<()> {
        let msg = CallbackMessage::Started { job_id, ports: ports.clone() };
        let payload = serde_json::to_vec(&msg)?;
        let mut codec = framing_codec();
        let mut buf = bytes::BytesMut::new();
        codec.encode(payload.into(), &mut buf)?;
        stream.write_all(&buf).await?;
        Ok(())
    }

    /// Reads the client's public shell key as raw bytes until EOF, bounded
    /// by `public_key_max_bytes` (§9 Open Questions).
    async fn install_shell_key(
        &self,
        stream: &mut tokio_rustls::client::TlsStream<TcpStream>,
        container_id: &str,
    ) -> anyhow::Result<()> {
        let mut key = Vec::new();
        let read = tokio::time::timeout(
            self.config.key_read_timeout,
            stream.take(self.config.public_key_max_bytes as u64 + 1).read_to_end(&mut key),
        )
        .await??;
        let _ = read;
        if key.len() > self.config.public_key_max_bytes {
            anyhow::bail!("public key exceeded {} bytes", self.config.public_key_max_bytes);
        }

        tokio::fs::write(&self.config.ssh_key_path, &key).await?;

        let tar_bytes = Self::build_key_tar(&key).await?;
        self.runtime.put_archive(container_id, "/tmp", tar_bytes).await?;
        self.runtime.exec(container_id, &["mkdir", "-p", "/root/.ssh"]).await?;
        self.runtime
            .exec(container_id, &["cp", "/tmp/id_rsa.pub", "/root/.ssh/authorized_keys"])
            .await?;
        Ok(())
    }

    async fn build_key_tar(key: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut builder = tokio_tar::Builder::new(Vec::new());
        let mut header = tokio_tar::Header::new_gnu();
        header.set_size(key.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "id_rsa.pub", key).await?;
        let bytes = builder.into_inner().await?;
        Ok(bytes)
    }

    /// Shutdown sequence (§4.3): stop every running container (iterate
    /// until `list()` is empty), then prune stopped containers.
    async fn shutdown(&self) {
        loop {
            let running = match self.runtime.list().await {
                Ok(r) => r,
                Err(e) => {
                    error!("listing containers during shutdown failed: {e}");
                    break;
                }
            };
            if running.is_empty() {
                break;
            }
            for container in running {
                if let Err(e) = self.runtime.stop(&container.id).await {
                    error!(container = %container.name, "stop during shutdown failed: {e}");
                }
            }
        }
        if let Err(e) = self.runtime.prune_stopped().await {
            error!("prune during shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_priority_prefers_under_represented_high_priority() {
        // §8 property 7: totals {3:5, 2:4, 1:1}, sum 10 -> freq {3:0.5, 2:0.4, 1:0.1}
        let waiting = vec![Priority::High, Priority::Medium, Priority::Low];
        let mut freq = HashMap::new();
        freq.insert(Priority::High, 0.50);
        freq.insert(Priority::Medium, 0.40);
        freq.insert(Priority::Low, 0.10);
        assert_eq!(select_priority(&waiting, &freq), Priority::Medium);
    }

    #[test]
    fn select_priority_falls_back_to_highest_when_all_saturated() {
        let waiting = vec![Priority::High, Priority::Medium];
        let mut freq = HashMap::new();
        freq.insert(Priority::High, 0.9);
        freq.insert(Priority::Medium, 0.9);
        assert_eq!(select_priority(&waiting, &freq), Priority::High);
    }

    #[test]
    fn select_priority_picks_zero_frequency_priority_first() {
        // §8 scenario S4: waiting {1,3}, history counts {3:0,1:0}, total 0.
        let waiting = vec![Priority::High, Priority::Low];
        let mut freq = HashMap::new();
        freq.insert(Priority::High, 0.0);
        freq.insert(Priority::Low, 0.0);
        assert_eq!(select_priority(&waiting, &freq), Priority::High);
    }

    #[test]
    fn parse_container_ports_appends_ssh_port() {
        let ports = Scheduler::parse_container_ports("8080,443");
        assert_eq!(ports, vec!["8080", "443", "22"]);
    }

    struct FakeRuntime {
        containers: parking_lot::Mutex<Vec<crate::runtime::RunningContainer>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self { containers: parking_lot::Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl RuntimeAdapter for FakeRuntime {
        async fn list(&self) -> Result<Vec<crate::runtime::RunningContainer>, crate::error::RuntimeError> {
            Ok(self.containers.lock().clone())
        }
        async fn inspect(&self, id: &str) -> Result<crate::runtime::RunningContainer, crate::error::RuntimeError> {
            self.containers
                .lock()
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or(crate::error::RuntimeError::NotFound)
        }
        async fn stats(&self, _id: &str) -> Result<crate::runtime::CpuSample, crate::error::RuntimeError> {
            Ok(crate::runtime::CpuSample::default())
        }
        async fn run(
            &self,
            name: &str,
            _cpu_period: i64,
            _cpu_quota: i64,
            _mem_bytes: i64,
            port_bindings: &BTreeMap<String, u16>,
        ) -> Result<String, crate::error::RuntimeError> {
            let container = crate::runtime::RunningContainer {
                id: name.to_string(),
                name: name.to_string(),
                created_at: crate::runtime::now_unix(),
                port_bindings: port_bindings.clone(),
            };
            self.containers.lock().push(container);
            Ok(name.to_string())
        }
        async fn exec(&self, _id: &str, _command: &[&str]) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn put_archive(&self, _id: &str, _path: &str, _tar_bytes: Vec<u8>) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _id: &str) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn remove(&self, id: &str) -> Result<(), crate::error::RuntimeError> {
            self.containers.lock().retain(|c| c.id != id);
            Ok(())
        }
        async fn prune_stopped(&self) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_queue: 10,
            port_lower: 40000,
            port_upper: 40100,
            max_cpu: 100,
            base_cpu: 0,
            base_mem: 0,
            cpu_unit: 10,
            mem_unit: 64,
            strategy: Strategy::Fifo,
            max_jobs: 4,
            database_path: std::path::PathBuf::from(":memory:"),
            cert_dir: std::path::PathBuf::from("/nonexistent/certs"),
            ssh_key_path: std::env::temp_dir().join("edge-scheduler-test-key.pub"),
            log_level: "info".to_string(),
            idle_scan_interval: Duration::from_millis(10),
            idle_sample_window: Duration::from_millis(10),
            termination_drain_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(50),
            key_read_timeout: Duration::from_millis(50),
            public_key_max_bytes: 16 * 1024,
        }
    }

    // §8 S1 (admit & dispatch): the waiting job is moved to history and a
    // container is launched with disjoint ports, one of which is "22", even
    // though there is no reachable callback peer in this test.
    #[tokio::test]
    async fn dispatch_one_moves_job_and_launches_container_without_a_callback_peer() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let job_id = store
            .enqueue_job("alice", "127.0.0.1", 9001, Priority::Medium, "8080", 10)
            .await
            .unwrap();
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(FakeRuntime::new());
        let scheduler = Scheduler::new(Arc::new(test_config()), store.clone(), Arc::clone(&runtime), Arc::new(HostProbe::new()));

        scheduler.dispatch_one().await.unwrap();

        assert_eq!(store.waiting_size().await.unwrap(), 0);
        let history = store.lookup_history(job_id).await.unwrap();
        assert_eq!(history.unwrap().0, "alice");

        let running = runtime.list().await.unwrap();
        assert_eq!(running.len(), 1);
        let ports: std::collections::HashSet<u16> = running[0].port_bindings.values().copied().collect();
        assert_eq!(ports.len(), running[0].port_bindings.len(), "ports must be disjoint");
        assert!(running[0].port_bindings.contains_key("22"));
        for p in running[0].port_bindings.values() {
            assert!((40000..=40100).contains(p));
        }
    }

    #[tokio::test]
    async fn tick_does_not_dispatch_when_waiting_queue_is_empty() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(FakeRuntime::new());
        let scheduler = Scheduler::new(Arc::new(test_config()), store, Arc::clone(&runtime), Arc::new(HostProbe::new()));
        assert!(!scheduler.tick().await.unwrap());
    }

    #[tokio::test]
    async fn tick_respects_max_jobs_even_with_waiting_work() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        store.enqueue_job("alice", "127.0.0.1", 9001, Priority::Low, "80", 10).await.unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        for i in 0..4 {
            runtime
                .run(&format!("existing-{i}"), 0, 0, 0, &BTreeMap::new())
                .await
                .unwrap();
        }
        let runtime: Arc<dyn RuntimeAdapter> = runtime;
        let mut config = test_config();
        config.max_jobs = 4;
        let scheduler = Scheduler::new(Arc::new(config), store, Arc::clone(&runtime), Arc::new(HostProbe::new()));
        assert!(!scheduler.tick().await.unwrap());
    }

    /// A `run()` that fails its first `fail_times` calls, recording each
    /// attempt's port map and every `reconnect()` call, for exercising the
    /// dispatch retry ladder (§4.3 step 4).
    struct FlakyRuntime {
        fail_times: u32,
        run_calls: std::sync::atomic::AtomicU32,
        reconnect_calls: std::sync::atomic::AtomicU32,
        seen_port_maps: parking_lot::Mutex<Vec<BTreeMap<String, u16>>>,
    }

    impl FlakyRuntime {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_times,
                run_calls: std::sync::atomic::AtomicU32::new(0),
                reconnect_calls: std::sync::atomic::AtomicU32::new(0),
                seen_port_maps: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl RuntimeAdapter for FlakyRuntime {
        async fn list(&self) -> Result<Vec<crate::runtime::RunningContainer>, crate::error::RuntimeError> {
            Ok(Vec::new())
        }
        async fn inspect(&self, _id: &str) -> Result<crate::runtime::RunningContainer, crate::error::RuntimeError> {
            Err(crate::error::RuntimeError::NotFound)
        }
        async fn stats(&self, _id: &str) -> Result<crate::runtime::CpuSample, crate::error::RuntimeError> {
            Ok(crate::runtime::CpuSample::default())
        }
        async fn run(
            &self,
            name: &str,
            _cpu_period: i64,
            _cpu_quota: i64,
            _mem_bytes: i64,
            port_bindings: &BTreeMap<String, u16>,
        ) -> Result<String, crate::error::RuntimeError> {
            let call = self.run_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.seen_port_maps.lock().push(port_bindings.clone());
            if call < self.fail_times {
                return Err(crate::error::RuntimeError::Api("simulated failure".to_string()));
            }
            Ok(name.to_string())
        }
        async fn exec(&self, _id: &str, _command: &[&str]) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn put_archive(&self, _id: &str, _path: &str, _tar_bytes: Vec<u8>) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _id: &str) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn remove(&self, _id: &str) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn prune_stopped(&self) -> Result<(), crate::error::RuntimeError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), crate::error::RuntimeError> {
            self.reconnect_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn flaky_job() -> JobRow {
        JobRow {
            id: 1000,
            client_name: "alice".to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 9001,
            priority: Priority::Low,
            requested_ports: "80".to_string(),
        }
    }

    // §4.3 step 4: a single failure is recovered by reconnecting the runtime
    // handle and retrying with the *same* port map, not a re-rolled one.
    #[tokio::test]
    async fn launch_with_retries_reconnects_and_reuses_ports_after_one_failure() {
        let runtime = Arc::new(FlakyRuntime::new(1));
        let dyn_runtime: Arc<dyn RuntimeAdapter> = Arc::clone(&runtime);
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let scheduler = Scheduler::new(Arc::new(test_config()), store, dyn_runtime, Arc::new(HostProbe::new()));

        let mut port_map = BTreeMap::new();
        port_map.insert("80".to_string(), 40001u16);
        port_map.insert("22".to_string(), 40002u16);
        let original = port_map.clone();

        let result = scheduler.launch_with_retries(&flaky_job(), &mut port_map).await;

        assert_eq!(result, Some("1000".to_string()));
        assert_eq!(runtime.reconnect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(runtime.run_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let seen = runtime.seen_port_maps.lock();
        assert_eq!(seen[0], original);
        assert_eq!(seen[1], original, "the retry after reconnect must reuse the same port map");
        assert_eq!(port_map, original);
    }

    // §4.3 step 4: two failures exhaust the reconnect rung, so the final
    // attempt re-allocates ports before retrying once more.
    #[tokio::test]
    async fn launch_with_retries_reallocates_ports_only_on_the_final_attempt() {
        let runtime = Arc::new(FlakyRuntime::new(2));
        let dyn_runtime: Arc<dyn RuntimeAdapter> = Arc::clone(&runtime);
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let scheduler = Scheduler::new(Arc::new(test_config()), store, dyn_runtime, Arc::new(HostProbe::new()));

        let mut port_map = BTreeMap::new();
        port_map.insert("80".to_string(), 40001u16);
        port_map.insert("22".to_string(), 40002u16);
        let original = port_map.clone();

        let result = scheduler.launch_with_retries(&flaky_job(), &mut port_map).await;

        assert_eq!(result, Some("1000".to_string()));
        assert_eq!(runtime.reconnect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(runtime.run_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        let seen = runtime.seen_port_maps.lock();
        assert_eq!(seen[0], original);
        assert_eq!(seen[1], original, "the reconnect retry must still reuse the original port map");
        assert_ne!(seen[2], original, "the final attempt must re-allocate ports");
        assert_eq!(port_map, seen[2], "the caller's port map must reflect the re-allocation");
    }

    // §4.3 step 4: exhausting all three attempts abandons the dispatch.
    #[tokio::test]
    async fn launch_with_retries_gives_up_after_three_failures() {
        let runtime = Arc::new(FlakyRuntime::new(3));
        let dyn_runtime: Arc<dyn RuntimeAdapter> = Arc::clone(&runtime);
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let scheduler = Scheduler::new(Arc::new(test_config()), store, dyn_runtime, Arc::new(HostProbe::new()));

        let mut port_map = BTreeMap::new();
        port_map.insert("80".to_string(), 40001u16);

        let result = scheduler.launch_with_retries(&flaky_job(), &mut port_map).await;

        assert_eq!(result, None);
        assert_eq!(runtime.run_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(runtime.reconnect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
