//! TCP side of the bridge: telemetry ingestion on one port, the single
//! outbound command writer on the other, and the command builders the web
//! layer calls.
//!
//! ```text
//! controller ──7000──▶ LineFramer ─▶ decode ─▶ route ─┬─▶ Hub (always)
//!                                                     └─▶ Recorder (if recording)
//! dashboard ─▶ web ─▶ Bridge::set_gpio / … ─▶ encode ─▶ writer ──7001──▶ controller
//! ```

use reqwest::multipart;
use serde_json::Value;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use unitboard_protocol::{
    decode, encode, tank_id_for_unit, wire_unit_id, Command, LineFramer, Message, Power,
    GPIO_COUNT, UNIT_COUNT,
};

use crate::config;
use crate::hub::{ConnectionStatus, Hub, HubEvent};
use crate::recorder::Recorder;
use crate::state::{MotorState, SharedState};
use crate::tanks::{TankError, TankStatus, TankTable, DEFAULT_STAGE};

pub const MAX_MOTOR_SPEED: u32 = 2000;
pub const MAX_MOTOR_TIME: u32 = 60;

const READ_CHUNK: usize = 4096;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no controller connected on the command port")]
    NotConnected,
    #[error("command write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unit id {0} out of range (0..{})", UNIT_COUNT)]
    UnitOutOfRange(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),
    #[error(transparent)]
    Tank(#[from] TankError),
    #[error("firmware image not found: {0}")]
    FirmwareMissing(String),
    #[error("firmware upload failed: {0}")]
    Upload(#[from] reqwest::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommandError {
    /// The request itself was bad; nothing was sent.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnitOutOfRange(_) | Self::InvalidArgument(_) | Self::InvalidRecipe(_) | Self::Tank(_)
        )
    }
}

fn check_unit(unit_id: u32) -> Result<(), CommandError> {
    if unit_id < UNIT_COUNT {
        Ok(())
    } else {
        Err(CommandError::UnitOutOfRange(unit_id))
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

struct ActiveWriter {
    id: u64,
    peer: SocketAddr,
    half: OwnedWriteHalf,
    /// Fires when a newer connection takes over.
    displaced: oneshot::Sender<()>,
}

struct Inner {
    writer: Mutex<Option<ActiveWriter>>,
    next_conn_id: AtomicU64,
    tx_connected: AtomicBool,
    rx_connections: AtomicUsize,
    tanks: Mutex<TankTable>,
    next_idx: AtomicU64,
    selected_unit: AtomicU32,
    recording: AtomicBool,
    hub: Hub,
    recorder: Recorder,
    state: SharedState,
    config_path: String,
    write_timeout: Duration,
    http: reqwest::Client,
}

/// Cheap to clone; all clones share one writer, one tank table and one
/// command index.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(
        hub: Hub,
        recorder: Recorder,
        state: SharedState,
        config_path: String,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
                tx_connected: AtomicBool::new(false),
                rx_connections: AtomicUsize::new(0),
                tanks: Mutex::new(TankTable::new()),
                next_idx: AtomicU64::new(0),
                selected_unit: AtomicU32::new(0),
                recording: AtomicBool::new(false),
                hub,
                recorder,
                state,
                config_path,
                write_timeout,
                http: reqwest::Client::new(),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn recorder(&self) -> &Recorder {
        &self.inner.recorder
    }

    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    pub fn selected_unit(&self) -> u32 {
        self.inner.selected_unit.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus::new(
            self.inner.rx_connections.load(Ordering::SeqCst) > 0,
            self.inner.tx_connected.load(Ordering::SeqCst),
        )
    }

    fn next_idx(&self) -> u64 {
        self.inner.next_idx.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn publish_link(&self) {
        let status = self.connection_status();
        self.inner.state.write().await.set_link(status.rx, status.tx);
        self.inner
            .hub
            .broadcast(&HubEvent::SystemConnectionStatus(status));
    }

    /// Close the command connection, if any.
    pub async fn close(&self) {
        let previous = self.inner.writer.lock().await.take();
        if let Some(mut old) = previous {
            let _ = old.half.shutdown().await;
            info!(peer = %old.peer, "command connection closed");
        }
        self.inner.tx_connected.store(false, Ordering::SeqCst);
        self.publish_link().await;
    }

    // -----------------------------------------------------------------------
    // Command endpoint
    // -----------------------------------------------------------------------

    /// Accept controller connections on the command port until `shutdown`
    /// changes. The newest connection always wins.
    pub async fn serve_commands(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "command endpoint listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.attach_writer(stream, peer).await,
                    Err(e) => warn!("command accept failed: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
        self.close().await;
    }

    async fn attach_writer(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = stream.into_split();
        let (displaced_tx, displaced_rx) = oneshot::channel();

        let previous = self.inner.writer.lock().await.replace(ActiveWriter {
            id,
            peer,
            half: write_half,
            displaced: displaced_tx,
        });
        self.inner.tx_connected.store(true, Ordering::SeqCst);

        if let Some(mut old) = previous {
            warn!(old = %old.peer, new = %peer, "command connection displaced by newer one");
            let _ = old.half.shutdown().await;
            let _ = old.displaced.send(());
            self.inner
                .state
                .write()
                .await
                .record_system(format!("command connection {} replaced by {peer}", old.peer));
        } else {
            info!(%peer, "command connection established");
            self.inner
                .state
                .write()
                .await
                .record_system(format!("command connection from {peer}"));
        }
        self.publish_link().await;

        tokio::spawn(self.clone().watch_writer(id, peer, read_half, displaced_rx));
    }

    /// Drain (and ignore) whatever the controller sends on the command port
    /// until it closes or a newer connection takes over.
    async fn watch_writer(
        self,
        id: u64,
        peer: SocketAddr,
        mut read_half: OwnedReadHalf,
        mut displaced: oneshot::Receiver<()>,
    ) {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = &mut displaced => return,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => debug!(%peer, bytes = n, "ignoring bytes on command connection"),
                    Err(e) => {
                        warn!(%peer, "command connection read error: {e}");
                        break;
                    }
                },
            }
        }
        self.detach_writer(id, peer).await;
    }

    async fn detach_writer(&self, id: u64, peer: SocketAddr) {
        let mut writer = self.inner.writer.lock().await;
        if writer.as_ref().map(|w| w.id) != Some(id) {
            return;
        }
        *writer = None;
        drop(writer);

        info!(%peer, "command connection closed by peer");
        self.inner.tx_connected.store(false, Ordering::SeqCst);
        self.inner
            .state
            .write()
            .await
            .record_system(format!("command connection {peer} closed"));
        self.publish_link().await;
    }

    /// Write one command to the active controller. A failed or stalled
    /// write drops the connection so later sends fail fast with
    /// `NotConnected`.
    pub async fn send(&self, cmd: &Command) -> Result<(), CommandError> {
        let bytes = encode(cmd)?;
        let limit = self.inner.write_timeout;

        let mut writer = self.inner.writer.lock().await;
        let Some(active) = writer.as_mut() else {
            return Err(CommandError::NotConnected);
        };

        let write = async {
            active.half.write_all(&bytes).await?;
            active.half.flush().await
        };
        let written = match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("controller stopped reading for {limit:?}"),
            )),
        };

        if let Err(e) = written {
            let peer = active.peer;
            *writer = None;
            drop(writer);
            warn!(%peer, kind = cmd.kind(), "command write failed, dropping connection: {e}");
            self.inner.tx_connected.store(false, Ordering::SeqCst);
            self.publish_link().await;
            return Err(CommandError::Io(e));
        }

        debug!(kind = cmd.kind(), idx = ?cmd.index(), "command sent");
        Ok(())
    }

    /// `send` plus bookkeeping in the unit mirror.
    async fn dispatch(&self, unit_id: Option<u32>, cmd: &Command) -> Result<(), CommandError> {
        let result = self.send(cmd).await;
        let mut st = self.inner.state.write().await;
        match &result {
            Ok(()) => st.record_command(unit_id, cmd.kind(), cmd.index()),
            Err(e) => st.record_error(format!("{} not sent: {e}", cmd.kind())),
        }
        result
    }

    // -----------------------------------------------------------------------
    // Command issuance
    // -----------------------------------------------------------------------

    pub async fn set_gpio(&self, unit_id: u32, gpio: [bool; GPIO_COUNT]) -> Result<(), CommandError> {
        check_unit(unit_id)?;
        let cmd = Command::SetGpio {
            unit_id: wire_unit_id(unit_id),
            idx: self.next_idx(),
            tank_id: tank_id_for_unit(unit_id),
            gpio,
            send: false,
        };
        self.dispatch(Some(unit_id), &cmd).await?;
        self.inner.state.write().await.record_gpio(unit_id, gpio);
        Ok(())
    }

    pub async fn set_motor(
        &self,
        unit_id: u32,
        is_on: bool,
        speed: u32,
        time: u32,
    ) -> Result<(), CommandError> {
        check_unit(unit_id)?;
        if speed > MAX_MOTOR_SPEED {
            return Err(CommandError::InvalidArgument(format!(
                "speed {speed} exceeds {MAX_MOTOR_SPEED}"
            )));
        }
        if time > MAX_MOTOR_TIME {
            return Err(CommandError::InvalidArgument(format!(
                "time {time} exceeds {MAX_MOTOR_TIME}"
            )));
        }

        let running = is_on && speed > 0;
        let cmd = Command::Motor {
            unit_id: wire_unit_id(unit_id),
            idx: self.next_idx(),
            tank_id: tank_id_for_unit(unit_id),
            speed: if is_on { speed } else { 0 },
            dir: 0,
            power: if running { Power::On } else { Power::Off },
            time,
            send: false,
        };
        self.dispatch(Some(unit_id), &cmd).await?;
        self.inner.state.write().await.record_motor(
            unit_id,
            MotorState {
                on: running,
                speed: if is_on { speed } else { 0 },
                time,
            },
        );
        Ok(())
    }

    /// Mark the selected unit's tank with `status` and send the whole table.
    pub async fn send_state_command(&self, status: TankStatus) -> Result<(), CommandError> {
        let unit_id = self.selected_unit();
        let tank_id = tank_id_for_unit(unit_id);
        let (previous, state) = {
            let mut tanks = self.inner.tanks.lock().await;
            let previous = tanks.get(tank_id);
            tanks.set(tank_id, status)?;
            (previous, tanks.snapshot(DEFAULT_STAGE))
        };
        info!(unit_id, tank_id, ?previous, %status, "sending tank state");
        let cmd = Command::State {
            idx: self.next_idx(),
            state,
        };
        self.dispatch(Some(unit_id), &cmd).await
    }

    /// Send an operator recipe. The target tank is put into `Initial` first;
    /// if that fails the recipe is not sent.
    pub async fn send_recipe(&self, recipe: Value) -> Result<(), CommandError> {
        let Value::Object(mut body) = recipe else {
            return Err(CommandError::InvalidRecipe("recipe must be a JSON object".into()));
        };
        match body.get("CMD") {
            Some(Value::String(kind)) if kind == "REF" => {}
            other => {
                return Err(CommandError::InvalidRecipe(format!(
                    "CMD must be \"REF\", got {}",
                    other.map_or_else(|| "nothing".to_string(), Value::to_string)
                )))
            }
        }
        body.remove("CMD");

        self.send_state_command(TankStatus::Initial).await?;
        self.dispatch(Some(self.selected_unit()), &Command::Recipe(body))
            .await
    }

    /// Focus a unit and ask it for its firmware version. The focus moves
    /// even if the request cannot be sent.
    pub async fn select_unit(&self, unit_id: u32) -> Result<(), CommandError> {
        check_unit(unit_id)?;
        let previous = self.inner.selected_unit.swap(unit_id, Ordering::SeqCst);
        info!(previous, unit_id, "selected unit changed");

        let cmd = Command::GetVersion {
            unit_id: wire_unit_id(unit_id),
            idx: self.next_idx(),
            send: true,
        };
        self.dispatch(Some(unit_id), &cmd).await
    }

    /// Push a firmware image to the controller's upload endpoint, then tell
    /// the unit to flash it. The image is read from the configured firmware
    /// directory; directory and URL are re-read from the config file. Nothing
    /// is sent on the command port unless the upload succeeded.
    pub async fn update_firmware(&self, unit_id: u32, file: &str) -> Result<(), CommandError> {
        check_unit(unit_id)?;

        let name = Path::new(file)
            .file_name()
            .filter(|n| Path::new(n) == Path::new(file))
            .ok_or_else(|| CommandError::InvalidArgument(format!("bad firmware file name {file:?}")))?;

        let cfg = config::load(&self.inner.config_path)
            .map_err(|e| CommandError::Config(format!("{e:#}")))?;
        let image = Path::new(&cfg.firmware.dir).join(name);
        let data = match tokio::fs::read(&image).await {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %image.display(), "firmware image unreadable: {e}");
                return Err(CommandError::FirmwareMissing(image.display().to_string()));
            }
        };

        let url = cfg.firmware.upload_url.trim();
        info!(unit_id, image = %image.display(), %url, bytes = data.len(), "uploading firmware image");
        match self
            .upload_firmware(url, name.to_string_lossy().into_owned(), data)
            .await
        {
            Ok(reply) => info!(unit_id, %reply, "firmware image uploaded"),
            Err(e) => {
                warn!(unit_id, %url, "firmware upload failed: {e}");
                self.inner
                    .state
                    .write()
                    .await
                    .record_error(format!("firmware upload to {url} failed: {e}"));
                return Err(e.into());
            }
        }

        let cmd = Command::FirmwareUpdate {
            unit_id: wire_unit_id(unit_id),
            idx: self.next_idx(),
            file: cfg.firmware.remote_path,
            send: false,
        };
        self.dispatch(Some(unit_id), &cmd).await
    }

    async fn upload_firmware(
        &self,
        url: &str,
        file_name: String,
        data: Vec<u8>,
    ) -> Result<String, reqwest::Error> {
        let form = multipart::Form::new().part("file", multipart::Part::bytes(data).file_name(file_name));
        self.inner
            .http
            .post(url)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    pub async fn ping(&self) -> Result<(), CommandError> {
        let cmd = Command::Ping {
            idx: self.next_idx(),
            note: "OK".into(),
        };
        self.dispatch(None, &cmd).await
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    pub async fn start_recording(&self) -> Result<(), CommandError> {
        self.inner.recording.store(true, Ordering::SeqCst);
        info!("recording started");
        self.send_state_command(TankStatus::Run).await
    }

    pub async fn pause_recording(&self) -> Result<(), CommandError> {
        self.inner.recording.store(false, Ordering::SeqCst);
        info!("recording paused");
        self.send_state_command(TankStatus::Pause).await
    }

    pub async fn stop_recording(&self) -> Result<(), CommandError> {
        self.inner.recording.store(false, Ordering::SeqCst);
        info!("recording stopped");
        self.send_state_command(TankStatus::Stop).await
    }

    // -----------------------------------------------------------------------
    // Telemetry endpoint
    // -----------------------------------------------------------------------

    /// Accept controller connections on the telemetry port until `shutdown`
    /// changes. Each connection gets its own reader task.
    pub async fn serve_telemetry(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "telemetry endpoint listening");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(self.clone().ingest(stream, peer));
                    }
                    Err(e) => warn!("telemetry accept failed: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn ingest(self, mut stream: TcpStream, peer: SocketAddr) {
        self.inner.rx_connections.fetch_add(1, Ordering::SeqCst);
        info!(%peer, "telemetry connection established");
        self.inner
            .state
            .write()
            .await
            .record_system(format!("telemetry connection from {peer}"));
        self.publish_link().await;

        let mut framer = LineFramer::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, "telemetry read error: {e}");
                    break;
                }
            };
            framer.extend(&buf[..n]);
            while let Some(line) = framer.next_line() {
                match line {
                    Ok(line) => self.handle_line(&line).await,
                    Err(e) => warn!(%peer, "telemetry framing error: {e}"),
                }
            }
        }

        self.inner.rx_connections.fetch_sub(1, Ordering::SeqCst);
        info!(%peer, "telemetry connection closed");
        self.inner
            .state
            .write()
            .await
            .record_system(format!("telemetry connection {peer} closed"));
        self.publish_link().await;
    }

    /// Decode and route one line. Undecodable lines are logged and dropped.
    pub async fn handle_line(&self, line: &str) {
        match decode(line) {
            Ok(msg) => self.route(msg).await,
            Err(e) => warn!(error = %e, "dropping undecodable line"),
        }
    }

    pub async fn route(&self, msg: Message) {
        debug!(kind = msg.kind(), "routing message");
        self.inner.hub.broadcast(&HubEvent::for_message(&msg));

        match msg {
            Message::Sensor(packet) => {
                self.inner.state.write().await.record_telemetry(&packet);
                if self.is_recording() {
                    self.inner.recorder.submit(packet);
                }
            }
            Message::Ack(ack) => {
                self.inner.state.write().await.record_ack(ack.idx, &ack.note);
            }
            Message::AckInitialize(ack) => {
                let unit_id = self.selected_unit();
                info!(unit_id, fw_version = ack.fw_version, "firmware version reported");
                self.inner
                    .state
                    .write()
                    .await
                    .record_fw_version(unit_id, ack.idx, ack.fw_version);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
