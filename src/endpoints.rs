//! HTTP listener exposing the metrics registry

use crate::metrics::metrics;
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve `/metrics` in Prometheus text format until `cancel` fires
pub async fn metrics_server(port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Metrics endpoint listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((mut socket, _)) => {
                tokio::spawn(async move {
                    let mut buf = [0; 1024];
                    if let Err(e) = socket.read(&mut buf).await {
                        tracing::error!(error = %e, "Failed to read from socket");
                        return;
                    }
                    let response = match metrics().gather_text() {
                        Ok(body) => format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        ),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode metrics");
                            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
                        }
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
