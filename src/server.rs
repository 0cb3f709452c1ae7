use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::ChannelStore;
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::lifecycle::Lifecycle;
use crate::message::{GLOBAL_CHANNEL, Message};
use crate::registry::Registry;
use crate::router::handle_client;
use crate::transfer::FileStore;
use crate::types::WorkerKind;

/// Listeners for the side connections a client opens after asking for a
/// service on its chat connection. Shared by every worker of that kind.
pub struct ServiceListeners {
    pub upload: TcpListener,
    pub download: TcpListener,
    pub directory: TcpListener,
}

/// Everything a worker needs, shared behind one `Arc`.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Registry,
    pub channels: ChannelStore,
    pub files: FileStore,
    pub services: ServiceListeners,
    pub lifecycle: Lifecycle,
}

/// Wait for the next side connection on `listener`, giving up after the
/// configured accept timeout.
///
/// Side connections carry no client identity, so a worker takes whichever
/// connection arrives next on its port. Two clients asking for the same
/// service at once are paired first come, first served. A chat worker
/// withdraws its own directory request when it asks again or leaves, which
/// keeps a stale request from taking another client's connection.
pub async fn accept_side(
    state: &ServerState,
    listener: &TcpListener,
    what: &'static str,
) -> Result<(TcpStream, SocketAddr), RelayError> {
    match tokio::time::timeout(state.config.accept_timeout, listener.accept()).await {
        Ok(accepted) => Ok(accepted?),
        Err(_) => Err(RelayError::AcceptTimeout(what)),
    }
}

/// The ports a bound server actually listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    pub chat: u16,
    pub upload: u16,
    pub download: u16,
    pub directory: u16,
}

pub struct Server {
    state: Arc<ServerState>,
    chat: TcpListener,
    stop: CancellationToken,
    reaper_stop: CancellationToken,
    reaper: JoinHandle<()>,
}

async fn listen(addr: &str, port: u16, what: &str) -> Result<TcpListener, RelayError> {
    let listener = TcpListener::bind((addr, port)).await?;
    info!(%addr, port, "{what} port listening");
    Ok(listener)
}

impl Server {
    /// Bind all four ports and open the on-disk stores. Nothing is accepted
    /// until [`Server::run`].
    pub async fn bind(config: ServerConfig) -> Result<Self, RelayError> {
        let addr = config.addr.as_str();
        let chat = listen(addr, config.port, "chat").await?;
        let services = ServiceListeners {
            upload: listen(addr, config.upload_port(), "upload").await?,
            download: listen(addr, config.download_port(), "download").await?,
            directory: listen(addr, config.directory_port(), "directory").await?,
        };

        let files = FileStore::open(&config.files_dir).await?;
        let channels = ChannelStore::open(&config.channels_dir).await?;
        info!(
            files = %files.dir().display(),
            channels = %channels.dir().display(),
            "stores open"
        );
        let registry = Registry::new(config.capacity);

        let reaper_stop = CancellationToken::new();
        let (lifecycle, reaper) = Lifecycle::start(reaper_stop.clone());

        let state = Arc::new(ServerState {
            config,
            registry,
            channels,
            files,
            services,
            lifecycle,
        });

        Ok(Self {
            state,
            chat,
            stop: CancellationToken::new(),
            reaper_stop,
            reaper,
        })
    }

    pub fn ports(&self) -> Result<Ports, RelayError> {
        let services = &self.state.services;
        Ok(Ports {
            chat: self.chat.local_addr()?.port(),
            upload: services.upload.local_addr()?.port(),
            download: services.download.local_addr()?.port(),
            directory: services.directory.local_addr()?.port(),
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Cancelling this token stops the accept loop and shuts the server
    /// down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Accept chat connections until the shutdown token is cancelled, then
    /// shut down. A connection is only accepted while a slot is free.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(capacity = self.state.config.capacity, "accepting clients");
        let outcome = self.accept_loop().await;
        if let Err(e) = &outcome {
            error!(error = %e, "accept loop failed");
        }
        self.shutdown().await;
        outcome
    }

    async fn accept_loop(&self) -> Result<(), RelayError> {
        loop {
            let permit = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                permit = self.state.registry.reserve() => permit?,
            };

            let (stream, peer) = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                accepted = self.chat.accept() => accepted?,
            };

            let Some(slot) = self.state.registry.claim_pending(peer).await else {
                warn!(%peer, "no free slot despite a capacity permit");
                continue;
            };
            info!(%slot, %peer, "client connected");

            let worker = handle_client(self.state(), stream, slot, permit);
            if !self.state.lifecycle.spawn(WorkerKind::Chat, worker) {
                return Err(RelayError::ShuttingDown);
            }
        }
    }

    /// Tell every client the server is going away, give the notice time to
    /// flush, then abort and join every worker.
    async fn shutdown(self) {
        info!("shutting down");
        self.state.registry.close();

        let notice = Message::notice("finserv", GLOBAL_CHANNEL, "the server is shutting down");
        let notified = self.state.registry.broadcast(None, &notice).await;
        info!(notified, "shutdown notice sent");
        tokio::time::sleep(self.state.config.shutdown_grace).await;

        self.reaper_stop.cancel();
        if let Err(e) = self.reaper.await {
            error!(error = %e, "reaper task failed");
        }
        info!(
            spawned = self.state.lifecycle.spawned(),
            reaped = self.state.lifecycle.reaped(),
            "all workers joined"
        );
    }
}
