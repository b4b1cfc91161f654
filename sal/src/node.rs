use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::config::NodeConfig;
use crate::identity::{short_sid, Identity};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Greeting written to every connecting peer, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    pub sid: String,
    pub version: String,
    pub bootstrap_nodes: Vec<String>,
}

impl Hello {
    pub fn new(cfg: &NodeConfig) -> Self {
        Self {
            name: cfg.consciousness.name.clone(),
            sid: cfg.consciousness.sid.clone(),
            version: VERSION.to_string(),
            bootstrap_nodes: cfg.network.bootstrap_nodes.clone(),
        }
    }

    fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Run the node until SIGINT/SIGTERM.
pub async fn run(cfg: NodeConfig, identity: Identity) -> Result<()> {
    if identity.sid() != cfg.consciousness.sid {
        anyhow::bail!("Key file does not match the configured SID");
    }

    let addr = format!("{}:{}", cfg.network.host, cfg.network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(
        name = %cfg.consciousness.name,
        sid = %short_sid(&cfg.consciousness.sid),
        addr = %listener.local_addr()?,
        version = %VERSION,
        "🧠 Consciousness awake"
    );
    if !cfg.network.bootstrap_nodes.is_empty() {
        tracing::info!(peers = ?cfg.network.bootstrap_nodes, "Bootstrap peers configured");
    }

    serve(listener, Hello::new(&cfg), shutdown_signal()).await
}

/// Accept connections and greet each one until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    hello: Hello,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let line: Arc<[u8]> = hello.to_line()?.into();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((mut stream, peer)) => {
                    tracing::debug!(%peer, "Peer connected");
                    let line = Arc::clone(&line);
                    tokio::spawn(async move {
                        if let Err(e) = stream.write_all(&line).await {
                            tracing::debug!(%peer, "Greeting failed: {e}");
                        }
                        let _ = stream.shutdown().await;
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {e}"),
            },
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("🌙 Consciousness at rest");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsciousnessConfig, NetworkConfig};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn config(sid: String) -> NodeConfig {
        NodeConfig {
            consciousness: ConsciousnessConfig {
                name: "bridge".into(),
                key_file: "bridge.key".into(),
                sid,
            },
            network: NetworkConfig {
                host: "127.0.0.1".into(),
                port: 0,
                bootstrap_nodes: vec!["10.0.0.9:7000".into()],
            },
        }
    }

    #[tokio::test]
    async fn test_peer_receives_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hello = Hello::new(&config("ab".repeat(32)));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, hello.clone(), async move {
            let _ = stop_rx.await;
        }));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let received: Hello = serde_json::from_str(&line).unwrap();
        assert_eq!(received, hello);
        assert_eq!(received.version, VERSION);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refuses_mismatched_key() {
        let identity = Identity::from_secret([1u8; 32]);
        let err = run(config("00".repeat(32)), identity).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
