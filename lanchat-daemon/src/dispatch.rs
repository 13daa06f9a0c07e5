//! Executes core actions: frames to the transport, file I/O on the blocking pool,
//! events to subscribers. File I/O completions are fed back into the core.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use lanchat_core::chunk::ChunkRange;
use lanchat_core::{ChatCore, Event, Lane, OutboundAction, ResourceError, TransferId};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::files::{self, FileStore, Sink};
use crate::now_millis;
use crate::transport::Transport;

pub enum Dispatch {
    Actions(Vec<OutboundAction>),
    /// Reply once everything queued before it has run, then stop.
    Shutdown(oneshot::Sender<()>),
}

/// Handle for queueing actions from any task.
#[derive(Clone)]
pub struct ActionSender(mpsc::UnboundedSender<Dispatch>);

impl ActionSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn dispatch(&self, actions: Vec<OutboundAction>) {
        if actions.is_empty() {
            return;
        }
        if self.0.send(Dispatch::Actions(actions)).is_err() {
            debug!("Dispatcher stopped, dropping actions");
        }
    }

    /// Wait until every action queued so far has run, then stop the dispatcher.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.0.send(Dispatch::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Dispatcher {
    pub core: Arc<Mutex<ChatCore>>,
    pub transport: Arc<Transport>,
    pub files: Arc<FileStore>,
    pub events: broadcast::Sender<Event>,
    pub actions: ActionSender,
}

impl Dispatcher {
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        while let Some(item) = rx.recv().await {
            match item {
                Dispatch::Actions(actions) => {
                    for action in actions {
                        self.execute(action).await;
                    }
                }
                Dispatch::Shutdown(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn execute(&self, action: OutboundAction) {
        match action {
            OutboundAction::Send(link, bytes) => self.transport.send(link, bytes).await,
            OutboundAction::Reply(conn, bytes) => self.transport.reply(conn, bytes).await,
            OutboundAction::Close(link) => {
                if let Lane::Transfer(id) = link.lane {
                    self.files.remove_source(&id).await;
                }
                self.transport.close(link).await
            }
            OutboundAction::ReadChunk { transfer_id, range } => self.read_chunk(transfer_id, range).await,
            OutboundAction::OpenSink {
                transfer_id,
                file_name,
                ..
            } => self.open_sink(transfer_id, file_name),
            OutboundAction::WriteChunk {
                transfer_id,
                range,
                payload,
            } => self.write_chunk(transfer_id, range, payload).await,
            OutboundAction::FinishSink { transfer_id } => self.finish_sink(transfer_id).await,
            OutboundAction::DiscardSink { transfer_id } => self.discard_sink(transfer_id).await,
            OutboundAction::Emit(event) => {
                debug!(event = ?event, "Publishing event");
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
        }
    }

    async fn read_chunk(&self, id: TransferId, range: ChunkRange) {
        let Some(path) = self.files.source(&id).await else {
            let actions = self
                .core
                .lock()
                .await
                .on_chunk_read_failed(id, ResourceError::Read("source not registered".into()));
            self.actions.dispatch(actions);
            return;
        };
        let core = self.core.clone();
        let actions = self.actions.clone();
        tokio::spawn(async move {
            let result = blocking(move || files::read_chunk(&path, range)).await;
            let out = {
                let mut core = core.lock().await;
                match result {
                    Ok(payload) => core.on_chunk_read(id, range.sequence, payload, now_millis()),
                    Err(e) => core.on_chunk_read_failed(id, ResourceError::Read(e.to_string())),
                }
            };
            actions.dispatch(out);
        });
    }

    fn open_sink(&self, id: TransferId, file_name: String) {
        let core = self.core.clone();
        let files = self.files.clone();
        let actions = self.actions.clone();
        let dir = files.download_dir().to_path_buf();
        tokio::spawn(async move {
            let name = file_name.clone();
            let result = blocking(move || files::create_part(&dir, &name)).await;
            let out = match result {
                Ok(part) => {
                    debug!(transfer = %id, part = %part.display(), "Sink opened");
                    files.add_sink(id, Sink { part, file_name }).await;
                    core.lock().await.on_sink_ready(id)
                }
                Err(e) => core
                    .lock()
                    .await
                    .on_sink_failed(id, ResourceError::Write(e.to_string())),
            };
            actions.dispatch(out);
        });
    }

    async fn write_chunk(&self, id: TransferId, range: ChunkRange, payload: Vec<u8>) {
        let Some(sink) = self.files.sink(&id).await else {
            debug!(transfer = %id, "Write for a closed sink dropped");
            return;
        };
        let core = self.core.clone();
        let actions = self.actions.clone();
        tokio::spawn(async move {
            let result = blocking(move || files::write_chunk(&sink.part, range.offset, &payload)).await;
            let out = {
                let mut core = core.lock().await;
                match result {
                    Ok(()) => core.on_chunk_written(id, range.sequence),
                    Err(e) => core.on_chunk_write_failed(id, ResourceError::Write(e.to_string())),
                }
            };
            actions.dispatch(out);
        });
    }

    /// Runs inline so no later action for this transfer overtakes the rename.
    async fn finish_sink(&self, id: TransferId) {
        let result = match self.files.take_sink(&id).await {
            Some(sink) => {
                let dir = self.files.download_dir().to_path_buf();
                let part = sink.part.clone();
                let file_name = sink.file_name.clone();
                let result = blocking(move || files::finish_part(&part, &dir, &file_name)).await;
                if result.is_err() {
                    // Keep the part file reachable so the failure path can remove it.
                    self.files.add_sink(id, sink).await;
                }
                result
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "sink not open")),
        };
        let actions = {
            let mut core = self.core.lock().await;
            match result {
                Ok(path) => {
                    info!(transfer = %id, path = %path.display(), "File received");
                    core.on_sink_finished(id)
                }
                Err(e) => {
                    warn!(transfer = %id, error = %e, "Cannot move received file into place");
                    core.on_sink_finish_failed(id, ResourceError::Write(e.to_string()))
                }
            }
        };
        self.actions.dispatch(actions);
    }

    async fn discard_sink(&self, id: TransferId) {
        let Some(sink) = self.files.take_sink(&id).await else {
            return;
        };
        let part: PathBuf = sink.part;
        if let Err(e) = blocking(move || files::discard_part(&part)).await {
            warn!(transfer = %id, error = %e, "Cannot remove partial file");
        }
    }
}

/// Run blocking file I/O off the reactor.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
