//! Local TCP server the appliance connects to.
//!
//! The appliance streams `SkzpData` status lines; the server injects
//! `DataToSend` command lines on the same connection and keeps re-sending
//! the pending command until a status frame shows it applied, or until it
//! times out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::ApplianceConfig;

use super::codec::{self, CommandFrame};
use super::tracker::{CONFIRM_TIMEOUT, ReconcileOutcome, Tracker, overlay};
use super::{FieldMap, StatusObject};

/// Pause before every transmission so a burst of requests goes out as one frame.
pub const SEND_COALESCE_DELAY: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Longest status line accepted from the appliance, terminator included.
const MAX_LINE_LEN: u64 = 64 * 1024;

struct SessionWriter {
    session_id: u64,
    half: OwnedWriteHalf,
}

#[derive(Default)]
struct State {
    last_status: Option<StatusObject>,
    tracker: Tracker,
    writer: Option<SessionWriter>,
    transmit_scheduled: bool,
}

struct Shared {
    config: ApplianceConfig,
    confirm_timeout: Duration,
    status_tx: mpsc::Sender<StatusObject>,
    state: Mutex<State>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct EltermServer {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl EltermServer {
    /// Every published snapshot, optimistic or confirmed, goes to `status_tx`.
    pub fn new(config: ApplianceConfig, status_tx: mpsc::Sender<StatusObject>) -> Self {
        Self::with_confirm_timeout(config, status_tx, CONFIRM_TIMEOUT)
    }

    fn with_confirm_timeout(
        config: ApplianceConfig,
        status_tx: mpsc::Sender<StatusObject>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                confirm_timeout,
                status_tx,
                state: Mutex::new(State::default()),
                session_task: Mutex::new(None),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting the appliance.
    pub async fn start(&self) -> io::Result<SocketAddr> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "server is already running",
            ));
        }

        let config = &self.shared.config;
        let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        let addr = listener.local_addr()?;
        info!("Listening for the appliance on {}", addr);

        *accept_task = Some(tokio::spawn(self.shared.clone().accept_loop(listener)));
        Ok(addr)
    }

    /// Stop listening and drop the live connection. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            info!("Stopped listening for the appliance");
        }
        if let Some(task) = self.shared.session_task.lock().await.take() {
            task.abort();
        }
        self.shared.state.lock().await.writer = None;
    }

    /// Request a field change. Returns once the command is registered;
    /// confirmation shows up later as a published snapshot.
    pub async fn submit(&self, fields: FieldMap) {
        if fields.is_empty() {
            warn!("Ignoring command request without fields");
            return;
        }

        let mut state = self.shared.state.lock().await;
        let snapshot = state.last_status.as_ref().map(|last| overlay(last, &fields));
        let summary = serde_json::to_string(&fields).unwrap_or_default();
        let token = state.tracker.register(fields, Instant::now());
        info!("Command [{}] requested: {}", token, summary);

        // Nothing to overlay onto until the appliance has reported once.
        if let Some(snapshot) = snapshot {
            self.shared.publish(snapshot);
        }

        self.shared.schedule_transmit(&mut state);
    }

    /// The most recent status frame received from the appliance.
    pub async fn last_status(&self) -> Option<StatusObject> {
        self.shared.state.lock().await.last_status.clone()
    }

    #[cfg(test)]
    async fn pending_token(&self) -> Option<String> {
        let state = self.shared.state.lock().await;
        state.tracker.pending().map(|p| p.token.clone())
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut next_session_id = 0u64;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accepting appliance connection failed: {}", e);
                    sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            next_session_id += 1;
            let session_id = next_session_id;
            info!("Appliance connected from {} (session {})", peer, session_id);

            let (read_half, write_half) = stream.into_split();
            self.state.lock().await.writer = Some(SessionWriter {
                session_id,
                half: write_half,
            });

            let task = tokio::spawn(self.clone().run_session(session_id, read_half));
            if let Some(previous) = self.session_task.lock().await.replace(task) {
                if !previous.is_finished() {
                    info!("Session {} superseded the previous appliance connection", session_id);
                }
                previous.abort();
            }
        }
    }

    /// Receive loop for one connection. Pending state outlives it.
    async fn run_session(self: Arc<Self>, session_id: u64, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::with_capacity(1024);
        let mut discarding = false;

        loop {
            line.clear();
            match (&mut reader).take(MAX_LINE_LEN).read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Reading from appliance failed: {}", e);
                    break;
                }
            }

            let complete = line.ends_with(b"\n");
            if !complete && line.len() as u64 == MAX_LINE_LEN {
                if !discarding {
                    warn!("Discarding appliance line longer than {} bytes", MAX_LINE_LEN);
                }
                discarding = true;
                continue;
            }
            if discarding {
                // Tail of an overlong line.
                discarding = false;
                continue;
            }

            match codec::decode(&line) {
                Ok(Some(status)) => self.handle_status(status).await,
                Ok(None) => debug!("Ignoring non-status frame"),
                Err(e) => debug!("Skipping undecodable line: {}", e),
            }
        }

        info!("Appliance disconnected (session {})", session_id);
        let mut state = self.state.lock().await;
        if state
            .writer
            .as_ref()
            .is_some_and(|w| w.session_id == session_id)
        {
            state.writer = None;
        }
    }

    async fn handle_status(self: &Arc<Self>, status: StatusObject) {
        let mut state = self.state.lock().await;
        let outcome = state
            .tracker
            .reconcile(&status, Instant::now(), self.confirm_timeout);
        state.last_status = Some(status.clone());

        let display = match outcome {
            ReconcileOutcome::Idle => status,
            ReconcileOutcome::Confirm { token } => {
                info!("Command [{}] confirmed by appliance", token);
                status
            }
            ReconcileOutcome::Mismatch { display } => {
                debug!("Appliance has not applied the pending command yet, resending");
                self.schedule_transmit(&mut state);
                display
            }
            ReconcileOutcome::Abandon { token, display } => {
                warn!(
                    "Appliance did not apply command [{}] within {:?}, giving up",
                    token, self.confirm_timeout
                );
                display
            }
        };

        self.publish(display);
    }

    /// Hand a snapshot to the observer without waiting. Runs under the state
    /// lock, so a slow observer loses snapshots instead of stalling the server.
    fn publish(&self, obj: StatusObject) {
        match self.status_tx.try_send(obj) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Status observer is behind, snapshot dropped"),
            Err(TrySendError::Closed(_)) => debug!("No status observer, snapshot dropped"),
        }
    }

    /// Arrange for the pending command to go out after `SEND_COALESCE_DELAY`.
    /// Requests arriving while a transmission is already scheduled ride on it.
    fn schedule_transmit(self: &Arc<Self>, state: &mut State) {
        if state.transmit_scheduled {
            return;
        }
        state.transmit_scheduled = true;
        tokio::spawn(self.clone().transmit());
    }

    async fn transmit(self: Arc<Self>) {
        sleep(SEND_COALESCE_DELAY).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.transmit_scheduled = false;

        let Some(pending) = state.tracker.pending() else {
            return;
        };
        let Some(writer) = state.writer.as_mut() else {
            debug!("No appliance connection, command [{}] stays pending", pending.token);
            return;
        };

        let frame = CommandFrame::new(&self.config.device_id, &self.config.device_pin, pending);
        let bytes = match codec::encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Encoding command [{}] failed: {}", pending.token, e);
                return;
            }
        };

        let write = async {
            writer.half.write_all(&bytes).await?;
            writer.half.flush().await?;
            Ok::<_, io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                info!(
                    "Sent command [{}] to appliance (fields={:?})",
                    pending.token,
                    pending.fields.keys().collect::<Vec<_>>()
                );
                debug!("Payload [{}] -> {}", pending.token, frame.masked());
            }
            Ok(Err(e)) => error!("Sending command [{}] failed: {}", pending.token, e),
            Err(_) => error!(
                "Sending command [{}] timed out after {:?}",
                pending.token, WRITE_TIMEOUT
            ),
        }
    }
}
