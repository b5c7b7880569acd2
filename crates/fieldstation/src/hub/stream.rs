//! TCP line-stream server for broadcast subscribers.
//!
//! Display clients connect with a plain TCP stream and receive one rendered
//! line per decode, plus `#`-prefixed comment markers: a greeting on connect
//! and a keepalive when the stream has been idle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::Result;

use super::BroadcastHub;

/// Listener for subscriber stream connections.
#[derive(Debug)]
pub struct StreamServer {
    listener: TcpListener,
}

impl StreamServer {
    /// Bind the subscriber stream listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Subscriber stream listening on {}", addr);
        Ok(Self { listener })
    }

    /// The address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept subscriber connections until shutdown.
    ///
    /// Each connection gets its own hub subscription and delivery task;
    /// a failed write tears down only that connection.
    pub async fn run(
        self,
        hub: Arc<BroadcastHub>,
        keepalive: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!("Subscriber connected: {}", peer);
                            let hub = Arc::clone(&hub);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                serve_subscriber(stream, hub, keepalive, shutdown).await;
                            });
                        }
                        Err(e) => error!("Error accepting subscriber: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Subscriber stream stopped");
    }
}

/// Drain one subscriber's queue onto its TCP stream.
async fn serve_subscriber(
    mut stream: TcpStream,
    hub: Arc<BroadcastHub>,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscription = hub.subscribe();

    let banner = format!("# fieldstation - connected at {}\n", Utc::now().to_rfc3339());
    if stream.write_all(banner.as_bytes()).await.is_err() {
        hub.unsubscribe(subscription.id);
        return;
    }

    loop {
        tokio::select! {
            line = subscription.receiver.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = stream.write_all(format!("{line}\n").as_bytes()).await {
                    debug!("Subscriber write failed, disconnecting: {}", e);
                    break;
                }
            }
            () = tokio::time::sleep(keepalive) => {
                if stream.write_all(b"# keepalive\n").await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    hub.unsubscribe(subscription.id);
    debug!("Subscriber {} disconnected", subscription.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn start_server(
        keepalive: Duration,
    ) -> (std::net::SocketAddr, Arc<BroadcastHub>, watch::Sender<bool>) {
        let hub = Arc::new(BroadcastHub::new(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = StreamServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let hub_clone = Arc::clone(&hub);
        tokio::spawn(async move {
            server.run(hub_clone, keepalive, shutdown_rx).await;
        });

        (addr, hub, shutdown_tx)
    }

    async fn wait_for_subscribers(hub: &BroadcastHub, count: usize) {
        for _ in 0..100 {
            if hub.subscriber_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {count} subscribers");
    }

    #[tokio::test]
    async fn test_client_receives_banner_and_lines() {
        let (addr, hub, _shutdown) = start_server(Duration::from_secs(30)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut banner = String::new();
        reader.read_line(&mut banner).await.unwrap();
        assert!(banner.starts_with("# fieldstation"));

        wait_for_subscribers(&hub, 1).await;
        hub.publish("134500 -12   0.3 1234 ~ CQ K1ABC FN42");

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("K1ABC"));
    }

    #[tokio::test]
    async fn test_keepalive_marker_when_idle() {
        let (addr, _hub, _shutdown) = start_server(Duration::from_millis(50)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut banner = String::new();
        reader.read_line(&mut banner).await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "# keepalive\n");
    }

    #[tokio::test]
    async fn test_disconnect_unsubscribes() {
        let (addr, hub, _shutdown) = start_server(Duration::from_millis(20)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        drop(stream);
        // The next keepalive write fails and the subscription is removed
        for _ in 0..100 {
            if hub.subscriber_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber was not removed after disconnect");
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (addr, hub, shutdown) = start_server(Duration::from_secs(30)).await;

        let _stream = TcpStream::connect(addr).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        shutdown.send(true).unwrap();
        wait_for_subscribers(&hub, 0).await;
    }

    #[tokio::test]
    async fn test_two_clients_both_receive() {
        let (addr, hub, _shutdown) = start_server(Duration::from_secs(30)).await;

        let mut readers = Vec::new();
        for _ in 0..2 {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut banner = String::new();
            reader.read_line(&mut banner).await.unwrap();
            readers.push(reader);
        }

        wait_for_subscribers(&hub, 2).await;
        hub.publish("to everyone");

        for reader in &mut readers {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "to everyone\n");
        }
    }
}
