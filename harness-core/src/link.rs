// Debug link
//
// Framed transport standing in for the external debug protocol. One I/O
// loop task owns the socket: outgoing commands are correlated to replies by
// packet id, incoming event sets are pushed onto a bounded queue that the
// dispatch loop drains.
//
// Frame layout: 4-byte big-endian payload length + JSON payload.

use crate::error::{HarnessError, HarnessResult};
use crate::event::{EventSet, RequestId};
use crate::recorded::{RecordedEvent, WorkerIdentity};
use crate::request::EventRequestSpec;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Maximum allowed frame size. Prevents memory exhaustion from a corrupt
/// or malicious peer.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// Command sent from the debugger to the target. `FetchRecorded`,
/// `FetchWorkers` and `SetSaveFlags` stand in for the debug protocol's live
/// object/field introspection: they bypass the textual command channel and
/// read/write debuggee heap state directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    SetRequest(EventRequestSpec),
    ClearRequest(RequestId),
    SetRequestEnabled { request: RequestId, enabled: bool },
    Resume,
    FetchRecorded,
    FetchWorkers,
    SetSaveFlags(Vec<(u64, bool)>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    RequestSet(RequestId),
    Recorded(Vec<RecordedEvent>),
    Workers(Vec<WorkerIdentity>),
    Error(String),
}

/// Wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Command { id: u32, command: Command },
    Reply { id: u32, reply: Reply },
    Events(EventSet),
}

/// Request to send a command and receive the correlated reply.
struct CommandRequest {
    command: Command,
    reply_tx: oneshot::Sender<HarnessResult<Reply>>,
}

/// Handle to the link loop. Cloneable; all clones share one event queue.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EventSet>>>,
}

impl LinkHandle {
    /// Send a command and wait for its reply.
    pub async fn send_command(&self, command: Command) -> HarnessResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { command, reply_tx })
            .await
            .map_err(|_| HarnessError::Disconnected)?;

        match reply_rx.await.map_err(|_| HarnessError::Disconnected)?? {
            Reply::Error(message) => Err(HarnessError::Protocol(message)),
            reply => Ok(reply),
        }
    }

    /// Wait for the next event set.
    pub async fn recv_event_set(&self) -> Option<EventSet> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Wait for the next event set, giving up after `timeout`. `Ok(None)`
    /// means the link closed; a timeout is an error.
    pub async fn recv_event_set_timeout(
        &self,
        timeout: Duration,
    ) -> HarnessResult<Option<EventSet>> {
        let mut rx = self.event_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| HarnessError::Timeout(timeout))
    }

    pub async fn set_request(&self, spec: EventRequestSpec) -> HarnessResult<RequestId> {
        match self.send_command(Command::SetRequest(spec)).await? {
            Reply::RequestSet(id) => Ok(id),
            other => Err(unexpected_reply("SetRequest", &other)),
        }
    }

    pub async fn clear_request(&self, request: RequestId) -> HarnessResult<()> {
        expect_ok("ClearRequest", self.send_command(Command::ClearRequest(request)).await?)
    }

    pub async fn set_request_enabled(
        &self,
        request: RequestId,
        enabled: bool,
    ) -> HarnessResult<()> {
        expect_ok(
            "SetRequestEnabled",
            self.send_command(Command::SetRequestEnabled { request, enabled })
                .await?,
        )
    }

    pub async fn resume(&self) -> HarnessResult<()> {
        expect_ok("Resume", self.send_command(Command::Resume).await?)
    }

    pub async fn fetch_recorded(&self) -> HarnessResult<Vec<RecordedEvent>> {
        match self.send_command(Command::FetchRecorded).await? {
            Reply::Recorded(records) => Ok(records),
            other => Err(unexpected_reply("FetchRecorded", &other)),
        }
    }

    pub async fn fetch_workers(&self) -> HarnessResult<Vec<WorkerIdentity>> {
        match self.send_command(Command::FetchWorkers).await? {
            Reply::Workers(workers) => Ok(workers),
            other => Err(unexpected_reply("FetchWorkers", &other)),
        }
    }

    pub async fn set_save_flags(&self, flags: Vec<(u64, bool)>) -> HarnessResult<()> {
        expect_ok("SetSaveFlags", self.send_command(Command::SetSaveFlags(flags)).await?)
    }
}

fn expect_ok(context: &str, reply: Reply) -> HarnessResult<()> {
    match reply {
        Reply::Ok => Ok(()),
        other => Err(unexpected_reply(context, &other)),
    }
}

fn unexpected_reply(context: &str, reply: &Reply) -> HarnessError {
    HarnessError::Protocol(format!("unexpected reply to {}: {:?}", context, reply))
}

/// Start the link loop task over any transport.
pub fn spawn_link<R, W>(reader: R, writer: W) -> LinkHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(32);
    // Larger buffer for events: they arrive unsolicited and must not be
    // dropped while the dispatch loop is busy.
    let (event_tx, event_rx) = mpsc::channel(256);

    tokio::spawn(link_loop(reader, writer, command_rx, event_tx));

    LinkHandle {
        command_tx,
        event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
    }
}

async fn link_loop<R, W>(
    mut reader: R,
    mut writer: W,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    event_tx: mpsc::Sender<EventSet>,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    info!("debug link started");

    let mut next_id: u32 = 1;
    let mut pending_replies: HashMap<u32, oneshot::Sender<HarnessResult<Reply>>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_cmd = command_rx.recv() => {
                let Some(request) = maybe_cmd else {
                    debug!("all link handles dropped, closing link");
                    break;
                };

                let id = next_id;
                next_id = next_id.wrapping_add(1);
                debug!(id, command = ?request.command, "sending command");

                let frame = Frame::Command { id, command: request.command };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    error!("failed to write command: {}", e);
                    request.reply_tx.send(Err(e)).ok();
                    continue;
                }
                pending_replies.insert(id, request.reply_tx);
            }

            result = read_frame(&mut reader) => {
                match result {
                    Ok(Some(Frame::Reply { id, reply })) => {
                        debug!(id, "received reply");
                        if let Some(tx) = pending_replies.remove(&id) {
                            tx.send(Ok(reply)).ok();
                        } else {
                            warn!(id, "received reply for unknown command");
                        }
                    }
                    Ok(Some(Frame::Events(event_set))) => {
                        debug!(
                            events = event_set.events.len(),
                            policy = ?event_set.suspend_policy,
                            "received event set"
                        );
                        match event_tx.try_send(event_set) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(set)) => {
                                error!(
                                    dropped = set.events.len(),
                                    "event queue full, dropping event set"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                warn!("event queue receiver dropped, discarding events");
                            }
                        }
                    }
                    Ok(Some(Frame::Command { id, .. })) => {
                        warn!(id, "peer sent a command frame on the debugger side");
                    }
                    Ok(None) => {
                        info!("peer closed the link");
                        break;
                    }
                    Err(e) => {
                        error!("failed to read frame: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Fail any commands still waiting for a reply.
    for (_, tx) in pending_replies.drain() {
        tx.send(Err(HarnessError::Disconnected)).ok();
    }

    info!("debug link shut down");
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> HarnessResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let payload = serde_json::to_vec(frame)
        .map_err(|e| HarnessError::Protocol(format!("failed to encode frame: {}", e)))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(HarnessError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> HarnessResult<Option<Frame>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HarnessError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(HarnessError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let frame = serde_json::from_slice(&payload)
        .map_err(|e| HarnessError::Protocol(format!("failed to decode frame: {}", e)))?;
    Ok(Some(frame))
}
