//! TCP front door: accepts connections and spawns one
//! cooperative session task per connection. No cross-connection state is
//! shared beyond the registry itself — two clients importing the same
//! device is left to the host USB library to arbitrate.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::host::UsbHost;
use crate::registry::Registry;
use crate::session::Session;

/// Binds `addr` and serves USB/IP connections until the process is killed.
pub async fn serve<H, A>(registry: Arc<Registry<H>>, addr: A) -> std::io::Result<()>
where
    H: UsbHost + 'static,
    H::Handle: 'static,
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            info!("connection from {peer}");
            let mut session = Session::new(registry);
            if let Err(e) = session.run(&mut stream).await {
                error!("session with {peer} ended: {e}");
            } else {
                info!("connection from {peer} closed");
            }
        });
    }
}
