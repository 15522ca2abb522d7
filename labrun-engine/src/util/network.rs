use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep};

/// Ask the kernel for a currently unused local TCP port.
pub async fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind ephemeral port")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `127.0.0.1:port` until a connect succeeds or `deadline` elapses.
/// Returns whether the port became reachable.
pub async fn wait_for_local_port(port: u16, deadline: Duration, interval: Duration) -> bool {
    let until = Instant::now() + deadline;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if Instant::now() + interval > until {
            return false;
        }
        sleep(interval).await;
    }
}
