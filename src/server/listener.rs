use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::http::connection::Connection;
use crate::proxy::ProxyState;

pub async fn run(listen_addr: &str, proxy: ProxyState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    serve(listener, proxy).await
}

/// Accepts connections on an already bound listener, one task each.
pub async fn serve(listener: TcpListener, proxy: ProxyState) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;

        // a wildcard bind only learns the destination address per socket
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection without local address");
                continue;
            }
        };
        info!(peer = %peer, local = %local_addr, "Accepted connection");

        let proxy = proxy.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, local_addr, proxy);
            if let Err(e) = conn.run().await {
                tracing::error!(peer = %peer, error = %e, "Connection error");
            }
        });
    }
}
