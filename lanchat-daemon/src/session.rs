//! Shell-facing session API: login wires discovery, transport, dispatcher and the tick
//! loop around one ChatCore; logout tears them down and returns the session summary.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::identity::{default_device_label, validate_display_name};
use lanchat_core::{
    Announcer, ChatCore, ConfigError, Event, FileTransfer, Identity, Message, PacketFilter,
    PeerRecord, ResourceError, SessionSummary, TransferId, ValidationError,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::{self, DiscoveryEngine};
use crate::dispatch::{ActionSender, Dispatcher};
use crate::files::{self, FileStore};
use crate::now_millis;
use crate::transport::{self, Transport};

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] lanchat_core::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for SessionError {
    fn from(e: ValidationError) -> Self {
        SessionError::Core(e.into())
    }
}

impl From<ResourceError> for SessionError {
    fn from(e: ResourceError) -> Self {
        SessionError::Core(e.into())
    }
}

/// One logged-in participant.
pub struct Session {
    identity: Identity,
    core: Arc<Mutex<ChatCore>>,
    actions: ActionSender,
    events: broadcast::Sender<Event>,
    files: Arc<FileStore>,
    transport: Arc<Transport>,
    discovery: Option<DiscoveryEngine>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Validate the identity, bind the transport, start discovery (or continue without
    /// it if the discovery socket is unavailable) and start the session loops.
    pub async fn login(display_name: &str, device_label: &str, config: Config) -> Result<Self, SessionError> {
        let display_name = validate_display_name(display_name)?;
        let core_config = config.core_config()?;

        let listener = transport::bind_listener(config.transport_port).await?;
        let port = listener.local_addr()?.port();
        let ip = config
            .advertise_ip
            .or_else(discovery::local_ipv4)
            .unwrap_or(Ipv4Addr::LOCALHOST);
        let address = SocketAddr::from((ip, port));
        let default_label = default_device_label(&hostname(), std::env::consts::OS);
        let identity = Identity::login(
            &display_name,
            device_label,
            &default_label,
            address,
            &platform_tag(),
            now_millis(),
        )?;

        let core = Arc::new(Mutex::new(ChatCore::new(identity.clone(), core_config)));
        let (actions, actions_rx) = ActionSender::channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let files = Arc::new(FileStore::new(config.download_dir.clone()));
        let transport = Transport::new(address, core.clone(), actions.clone());

        let mut tasks = vec![transport.start_accepting(listener)];
        let dispatcher = Dispatcher {
            core: core.clone(),
            transport: transport.clone(),
            files: files.clone(),
            events: events.clone(),
            actions: actions.clone(),
        };
        tasks.push(tokio::spawn(dispatcher.run(actions_rx)));
        tasks.push(spawn_ticker(core.clone(), actions.clone()));

        let discovery = if config.discovery {
            match DiscoveryEngine::bind(&config).await {
                Ok(mut engine) => {
                    let (observed_tx, observed_rx) = mpsc::unbounded_channel();
                    engine.start_listening(PacketFilter::new(address), move |identity, at| {
                        let _ = observed_tx.send((identity, at));
                    });
                    engine.start_announcing(Announcer::new(identity.clone()));
                    tasks.push(spawn_observer(core.clone(), actions.clone(), observed_rx));
                    Some(engine)
                }
                Err(e) => {
                    warn!(error = %e, "Discovery unavailable, peers must be addressed manually");
                    None
                }
            }
        } else {
            None
        };

        info!(
            name = %identity.display_name,
            device = %identity.device_label,
            address = %identity.address,
            discovery = discovery.is_some(),
            "Logged in"
        );
        Ok(Self {
            identity,
            core,
            actions,
            events,
            files,
            transport,
            discovery,
            tasks,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn peer_list(&self) -> Vec<PeerRecord> {
        self.core.lock().await.peer_list()
    }

    /// Queue a text message for `target`. Returned in Pending state; the outcome arrives
    /// as MessageDelivered or MessageFailed.
    pub async fn send_message(&self, target: SocketAddr, text: &str) -> Result<Message, SessionError> {
        let (message, actions) = self.core.lock().await.send_message(target, text, now_millis())?;
        self.actions.dispatch(actions);
        Ok(message)
    }

    /// Start sending the file at `path` to `target`.
    pub async fn send_file(&self, target: SocketAddr, path: impl AsRef<Path>) -> Result<FileTransfer, SessionError> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(ValidationError::FileNameMissing)?;
        let probe = path.clone();
        let total_bytes = tokio::task::spawn_blocking(move || files::source_len(&probe))
            .await
            .map_err(|e| ResourceError::Read(e.to_string()))?
            .map_err(|e| ResourceError::Read(format!("{}: {e}", path.display())))?;

        let (transfer, actions) =
            self.core
                .lock()
                .await
                .start_transfer(target, &file_name, total_bytes, now_millis())?;
        self.files.add_source(transfer.id, path).await;
        self.actions.dispatch(actions);
        Ok(transfer)
    }

    pub async fn pause_transfer(&self, id: TransferId) -> Result<FileTransfer, SessionError> {
        Ok(self.core.lock().await.pause_transfer(id)?)
    }

    pub async fn resume_transfer(&self, id: TransferId) -> Result<FileTransfer, SessionError> {
        let (transfer, actions) = self.core.lock().await.resume_transfer(id, now_millis())?;
        self.actions.dispatch(actions);
        Ok(transfer)
    }

    pub async fn cancel_transfer(&self, id: TransferId) -> Result<FileTransfer, SessionError> {
        let (transfer, actions) = self.core.lock().await.cancel_transfer(id)?;
        self.actions.dispatch(actions);
        Ok(transfer)
    }

    pub async fn transfers(&self) -> Vec<FileTransfer> {
        self.core.lock().await.transfers()
    }

    /// Fail pending messages, cancel running transfers, stop discovery and close every
    /// connection.
    pub async fn logout(mut self) -> SessionSummary {
        let (summary, actions) = self.core.lock().await.logout(now_millis());
        self.actions.dispatch(actions);
        self.actions.shutdown().await;

        if let Some(engine) = self.discovery.take() {
            engine.stop().await;
        }
        self.transport.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(
            name = %summary.user,
            duration_ms = summary.duration_ms,
            "Logged out"
        );
        summary
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_ticker(core: Arc<Mutex<ChatCore>>, actions: ActionSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            let out = core.lock().await.tick(now_millis());
            actions.dispatch(out);
        }
    })
}

fn spawn_observer(
    core: Arc<Mutex<ChatCore>>,
    actions: ActionSender,
    mut observed: mpsc::UnboundedReceiver<(Identity, lanchat_core::Millis)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((identity, at)) = observed.recv().await {
            let out = core.lock().await.observe(identity, at);
            actions.dispatch(out);
        }
    })
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

fn platform_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
