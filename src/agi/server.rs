//! FastAGI listener

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::{AgiChannel, ScriptMapper};
use crate::{
    config::AgiServerConfig,
    error::{AgiError, AgiResult},
};

/// Accepts FastAGI connections from Asterisk and runs the mapped script for
/// each one on its own task.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), asterisk_manager_tokio::AgiError> {
/// use asterisk_manager_tokio::agi::{AgiChannel, AgiRequest, AgiScript, AgiServer, SimpleMappingStrategy};
/// use asterisk_manager_tokio::{AgiResult, AgiServerConfig};
///
/// struct Hello;
///
/// #[async_trait::async_trait]
/// impl AgiScript for Hello {
///     async fn service(&self, _req: &AgiRequest, channel: &mut AgiChannel) -> AgiResult<()> {
///         channel.answer().await?;
///         channel.stream_file("hello-world", "").await?;
///         channel.hangup().await
///     }
/// }
///
/// let mapper = SimpleMappingStrategy::new().with_script("hello", Hello);
/// let server = AgiServer::bind(AgiServerConfig::default(), mapper).await?;
/// server.run().await
/// # }
/// ```
pub struct AgiServer {
    listener: TcpListener,
    mapper: Arc<dyn ScriptMapper>,
    slots: Arc<Semaphore>,
}

impl std::fmt::Debug for AgiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgiServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("free_slots", &self.slots.available_permits())
            .finish()
    }
}

impl AgiServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(config: AgiServerConfig, mapper: impl ScriptMapper + 'static) -> AgiResult<Self> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        info!(
            "[AGI] Listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| config.bind_address.clone())
        );
        Ok(Self {
            listener,
            mapper: Arc::new(mapper),
            slots: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> AgiResult<SocketAddr> {
        Ok(self
            .listener
            .local_addr()?)
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> AgiResult<()> {
        self.run_until(std::future::pending())
            .await
    }

    /// Serve until `shutdown` resolves. Sessions already running are left to
    /// finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> AgiResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("[AGI] Connection from {}", peer);
                    let mapper = self
                        .mapper
                        .clone();
                    tokio::spawn(handle_connection(stream, peer, mapper, permit));
                }
                Err(e) => {
                    warn!("[AGI] Accept failed: {}", e);
                }
            }
        }
        info!("[AGI] Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mapper: Arc<dyn ScriptMapper>,
    _permit: OwnedSemaphorePermit,
) {
    let mut channel = AgiChannel::new(stream);
    match serve(&mut channel, mapper.as_ref()).await {
        Ok(()) => debug!("[AGI] Session from {} finished", peer),
        Err(AgiError::Hangup) => debug!("[AGI] Session from {} ended by hangup", peer),
        Err(e) => warn!("[AGI] Session from {} failed: {}", peer, e),
    }
    let _ = channel
        .close()
        .await;
}

async fn serve(channel: &mut AgiChannel, mapper: &dyn ScriptMapper) -> AgiResult<()> {
    let request = channel
        .read_request()
        .await?;
    let Some(script) = mapper.determine_script(&request) else {
        return Err(AgiError::NoScript {
            script: request
                .request_url()
                .unwrap_or("<none>")
                .to_string(),
        });
    };

    info!(
        "[AGI] Running {} for {}",
        request
            .script()
            .unwrap_or_default(),
        request
            .channel()
            .unwrap_or("unknown channel")
    );
    let run = std::panic::AssertUnwindSafe(script.service(&request, channel));
    match run
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            error!("[AGI] Script panicked");
            Err(AgiError::protocol_error("script panicked"))
        }
    }
}
