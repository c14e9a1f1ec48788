//! TCP front end for the in-memory servers

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use tfs_proto::{
    DataService, NameService, ProtoError, Request, Response, dispatch, read_frame, write_frame,
};

/// Services hosted on one listening socket
#[derive(Clone, Default)]
pub struct Endpoint {
    pub name: Option<Arc<dyn NameService>>,
    pub data: Option<Arc<dyn DataService>>,
}

/// Accept connections until `shutdown` flips to true.
///
/// Each connection handles one request at a time, in order.
pub async fn serve(listener: TcpListener, endpoint: Endpoint, mut shutdown: watch::Receiver<bool>) {
    let local = listener
        .local_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    info!(addr = %local, name = endpoint.name.is_some(), data = endpoint.data.is_some(), "serving");

    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let endpoint = endpoint.clone();
                        tasks.spawn(async move {
                            match handle_connection(stream, endpoint).await {
                                Ok(()) | Err(ProtoError::Closed) => {
                                    debug!(%peer, "connection closed");
                                }
                                Err(e) => debug!(%peer, "connection ended: {}", e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    tasks.shutdown().await;
    info!(addr = %local, "server stopped");
}

async fn handle_connection(mut stream: TcpStream, endpoint: Endpoint) -> Result<(), ProtoError> {
    stream.set_nodelay(true)?;
    loop {
        let request: Request = read_frame(&mut stream).await?;
        let response: Response =
            dispatch(endpoint.name.as_deref(), endpoint.data.as_deref(), request).await;
        write_frame(&mut stream, &response).await?;
    }
}
