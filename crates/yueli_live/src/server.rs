//! TCP listener for the live event stream.

use crate::hub::LiveHub;
use crate::intake::pump;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts any number of connections; each one gets its own reader task.
pub struct LiveServer {
    listener: TcpListener,
    hub: Arc<LiveHub>,
    read_timeout: Duration,
    max_line_bytes: usize,
}

impl LiveServer {
    pub async fn bind(addr: &str, hub: Arc<LiveHub>, read_timeout: Duration, max_line_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind live listener on {}", addr))?;
        Ok(Self {
            listener,
            hub,
            read_timeout,
            max_line_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Live listener has no local address")
    }

    /// Accept connections until `shutdown` fires. Connection tasks are
    /// stopped with it.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Live event intake listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Live accept failed: {}", e);
                    continue;
                }
            };

            debug!(%peer, "Live source connected");
            let hub = Arc::clone(&self.hub);
            let stop = shutdown.child_token();
            let (read_timeout, max_line_bytes) = (self.read_timeout, self.max_line_bytes);
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => debug!(%peer, "Live connection closed for shutdown"),
                    end = pump(&hub, stream, read_timeout, max_line_bytes) => {
                        info!(%peer, reason = %end, "Live source disconnected");
                    }
                }
            });
        }
        info!("Live event intake stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use yueli_core::config::{ConsumerConfig, LiveConfig};
    use yueli_core::PipelineCounters;

    #[tokio::test]
    async fn test_accepts_concurrent_sources() {
        let counters = Arc::new(PipelineCounters::default());
        let hub = Arc::new(LiveHub::new(&LiveConfig::default(), counters.clone()));
        let mut rx = hub
            .subscribe("dialogue", &ConsumerConfig { capacity: 16, rate_per_sec: 0.0, burst: 1 })
            .await;

        let server = LiveServer::bind("127.0.0.1:0", hub.clone(), Duration::from_secs(5), 4096)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"{\"source\":\"a\",\"type\":\"heartbeat\",\"sequence\":1}\n").await.unwrap();
        b.write_all(b"{\"source\":\"b\",\"type\":\"heartbeat\",\"sequence\":1}\n").await.unwrap();

        let mut sources = vec![rx.recv().await.unwrap().source.clone(), rx.recv().await.unwrap().source.clone()];
        sources.sort();
        assert_eq!(sources, vec!["a", "b"]);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(counters.snapshot().live_received, 2);
    }

    #[tokio::test]
    async fn test_bind_failure_has_context() {
        let hub = Arc::new(LiveHub::new(&LiveConfig::default(), Arc::new(PipelineCounters::default())));
        let err = LiveServer::bind("not-an-address", hub, Duration::from_secs(1), 64)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not-an-address"));
    }
}
