//! Subsistema de reproducción por guild: máquina de estados de la
//! conexión de voz y worker dedicado que multiplexa las fuentes activas.
//!
//! El worker es un hilo del SO exclusivo de la guild: hace round-robin
//! sobre las fuentes registradas, una fuente por iteración, y duerme en
//! una condvar cuando el set queda vacío. Ningún lock se mantiene
//! durante el I/O bloqueante de `update()`.
//!
//! El subsistema puede multiplexar varias fuentes a la vez aunque la
//! política por defecto del manager registre una sola; esa capacidad
//! sostiene `stop_all` sobre fuentes rezagadas en pleno flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock, RwLockUpgradableReadGuard};
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{AudioSource, SourceId};
use super::transport::{ConnectionState, TransportConnection, TransportEvent, VoiceTransport};
use super::{AudioError, VoiceRoomQuery};

/// Eventos que el subsistema reporta a su dueño (el manager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemEvent {
    /// Una fuente llegó a `Closed` y fue retirada del set
    SourceStopped(SourceId),
    /// El worker terminó; el subsistema quedó desconectado
    Stopped,
}

enum ConnSlot {
    Disconnected,
    Connecting,
    Connected(Arc<dyn TransportConnection>),
}

pub struct PlaybackSubsystem {
    guild_id: GuildId,
    channel_id: ChannelId,
    transport: Arc<dyn VoiceTransport>,
    rooms: Arc<dyn VoiceRoomQuery>,
    chunk: usize,
    conn: RwLock<ConnSlot>,
    state_tx: watch::Sender<ConnectionState>,
    sources: Mutex<Vec<Arc<AudioSource>>>,
    wake: Condvar,
    pending_exit: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    count_tx: watch::Sender<usize>,
    events_tx: flume::Sender<SubsystemEvent>,
    cancel: CancellationToken,
}

impl PlaybackSubsystem {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        transport: Arc<dyn VoiceTransport>,
        rooms: Arc<dyn VoiceRoomQuery>,
        chunk: usize,
    ) -> (Arc<Self>, flume::Receiver<SubsystemEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (count_tx, _) = watch::channel(0usize);

        let subsystem = Arc::new(Self {
            guild_id,
            channel_id,
            transport,
            rooms,
            chunk,
            conn: RwLock::new(ConnSlot::Disconnected),
            state_tx,
            sources: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            pending_exit: AtomicBool::new(false),
            worker: Mutex::new(None),
            count_tx,
            events_tx,
            cancel: CancellationToken::new(),
        });

        (subsystem, events_rx)
    }

    #[allow(dead_code)]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    #[allow(dead_code)]
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Establece la conexión de voz. Idempotente: con la conexión ya
    /// establecida vuelve de inmediato, y las llamadas concurrentes
    /// mientras hay un intento en vuelo esperan ese intento en lugar de
    /// abrir una segunda conexión.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AudioError> {
        enum Claim {
            Ready,
            Wait,
            Claimed,
        }

        loop {
            let claim = {
                let slot = self.conn.upgradable_read();
                match &*slot {
                    ConnSlot::Connected(_) => Claim::Ready,
                    ConnSlot::Connecting => Claim::Wait,
                    ConnSlot::Disconnected => {
                        let mut slot = RwLockUpgradableReadGuard::upgrade(slot);
                        *slot = ConnSlot::Connecting;
                        self.state_tx.send_replace(ConnectionState::Connecting);
                        Claim::Claimed
                    }
                }
            };

            match claim {
                Claim::Ready => return Ok(()),
                Claim::Claimed => break,
                Claim::Wait => {
                    let mut rx = self.state_tx.subscribe();
                    if rx
                        .wait_for(|state| *state != ConnectionState::Connecting)
                        .await
                        .is_err()
                    {
                        return Err(AudioError::TransportDisconnected(
                            "subsistema liberado durante la conexión".to_string(),
                        ));
                    }
                }
            }
        }

        info!(
            "🔊 Conectando al canal de voz {} en guild {}",
            self.channel_id, self.guild_id
        );

        let attempt = self.transport.connect(self.guild_id, self.channel_id);
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(AudioError::TransportDisconnected(
                "intento de conexión cancelado".to_string(),
            )),
            result = attempt => result,
        };

        match connected {
            Ok(conn) => {
                if self.pending_exit.load(Ordering::SeqCst) {
                    conn.hangup();
                    *self.conn.write() = ConnSlot::Disconnected;
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return Err(AudioError::TransportDisconnected(
                        "subsistema detenido durante la conexión".to_string(),
                    ));
                }

                *self.conn.write() = ConnSlot::Connected(conn.clone());
                self.state_tx.send_replace(ConnectionState::Connected);
                self.spawn_event_listener(conn.events());
                self.start_worker();
                info!("✅ Conexión de voz establecida en guild {}", self.guild_id);
                Ok(())
            }
            Err(e) => {
                *self.conn.write() = ConnSlot::Disconnected;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                error!("❌ Falló la conexión de voz en guild {}: {}", self.guild_id, e);
                Err(e)
            }
        }
    }

    /// Crea una fuente nueva con su propio sink PCM. Requiere conexión.
    pub fn new_source(self: &Arc<Self>) -> Result<Arc<AudioSource>, AudioError> {
        let conn = match &*self.conn.read() {
            ConnSlot::Connected(conn) => conn.clone(),
            _ => {
                return Err(AudioError::TransportDisconnected(
                    "sin conexión establecida".to_string(),
                ))
            }
        };

        let sink = conn.open_sink()?;
        Ok(Arc::new(AudioSource::new(
            Arc::downgrade(self),
            sink,
            self.chunk,
        )))
    }

    /// Registra una fuente y despierta al worker
    pub fn add_source(&self, source: Arc<AudioSource>) {
        let mut sources = self.sources.lock();
        if !sources.iter().any(|s| s.id() == source.id()) {
            sources.push(source);
            self.count_tx.send_replace(sources.len());
            self.wake.notify_one();
        }
    }

    /// Retira una fuente del set; el worker la usa al retirar fuentes
    /// que terminaron limpiamente
    pub fn remove_source(&self, id: SourceId) {
        let mut sources = self.sources.lock();
        sources.retain(|s| s.id() != id);
        self.count_tx.send_replace(sources.len());
    }

    /// Pide el stop de todas las fuentes registradas
    pub fn stop_all(&self) {
        let sources = self.sources.lock();
        for source in sources.iter() {
            source.stop();
        }
    }

    /// Se resuelve cuando el set de fuentes queda vacío; inmediato si ya
    /// lo está
    pub async fn wait_drained(&self) {
        let mut rx = self.count_tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Detiene el worker y corta la conexión. No debe llamarse desde el
    /// hilo del worker con join (deadlock); si el caller es el propio
    /// worker se omite el join.
    pub fn stop(&self) {
        if self.pending_exit.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("⏹️ Deteniendo subsistema de audio de guild {}", self.guild_id);
        self.cancel.cancel();
        {
            // el lock garantiza que el worker esté antes del chequeo de
            // salida o ya dentro del wait; sin él la señal puede perderse
            let _sources = self.sources.lock();
            self.wake.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let conn = std::mem::replace(&mut *self.conn.write(), ConnSlot::Disconnected);
        if let ConnSlot::Connected(conn) = conn {
            conn.hangup();
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn start_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let subsystem = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("cue-audio-worker-{}", self.guild_id))
            .spawn(move || subsystem.worker_loop());

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => error!("No se pudo crear el hilo worker: {}", e),
        }
    }

    fn worker_loop(&self) {
        debug!("🧵 Worker de audio iniciado para guild {}", self.guild_id);
        let mut cursor: usize = 0;

        loop {
            if self.pending_exit.load(Ordering::SeqCst) {
                break;
            }

            let source = {
                let mut sources = self.sources.lock();
                while sources.is_empty() && !self.pending_exit.load(Ordering::SeqCst) {
                    debug!("😴 Worker de guild {} sin fuentes, durmiendo", self.guild_id);
                    self.wake.wait(&mut sources);
                }
                if self.pending_exit.load(Ordering::SeqCst) {
                    break;
                }
                cursor = (cursor + 1) % sources.len();
                sources[cursor].clone()
            };

            if source.stop_requested() {
                if source.closed() {
                    debug!("Fuente {} cerrada, retirando del set", source.id());
                    self.remove_source(source.id());
                    if let Err(e) = source.dispose() {
                        warn!("Error liberando la fuente {}: {}", source.id(), e);
                    }
                    let _ = self
                        .events_tx
                        .send(SubsystemEvent::SourceStopped(source.id()));
                }
            } else if source.update() == 0 {
                // fin de stream o sink inescribible: la fuente pide su
                // propio stop y el loop la finaliza en una pasada futura
                source.stop();
            }
        }

        let leftover: Vec<_> = self.sources.lock().drain(..).collect();
        for source in leftover {
            source.stop();
            if let Err(e) = source.dispose() {
                warn!("Error liberando la fuente {}: {}", source.id(), e);
            }
        }
        self.count_tx.send_replace(0);

        debug!("🧵 Worker de audio terminado para guild {}", self.guild_id);
        let _ = self.events_tx.send(SubsystemEvent::Stopped);
    }

    fn spawn_event_listener(self: &Arc<Self>, events: flume::Receiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let Some(subsystem) = weak.upgrade() else { break };
                match event {
                    TransportEvent::Disconnected => {
                        warn!(
                            "🔌 Transporte desconectado en guild {}",
                            subsystem.guild_id
                        );
                        let _ = tokio::task::spawn_blocking(move || subsystem.stop()).await;
                        break;
                    }
                    TransportEvent::ParticipantLeft => {
                        if subsystem
                            .rooms
                            .is_voice_room_empty(subsystem.guild_id, subsystem.channel_id)
                        {
                            info!(
                                "🚪 Canal de voz vacío en guild {}, deteniendo",
                                subsystem.guild_id
                            );
                            let _ = tokio::task::spawn_blocking(move || subsystem.stop()).await;
                            break;
                        }
                    }
                }
            }
        });
    }
}
