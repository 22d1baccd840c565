//! Manager de audio por guild: cola FIFO de pedidos, slot del pedido
//! activo y política del motor (preempción por prioridad, auto-avance,
//! teardown ante desconexión o canal vacío).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use super::provider::{build_provider, PcmProvider};
use super::source::{AudioSource, SourceId};
use super::subsystem::{PlaybackSubsystem, SubsystemEvent};
use super::transport::{ConnectionState, VoiceTransport};
use super::{
    AudioError, AudioSettings, NowPlaying, PlaybackNotifier, ResolvedTrack, StreamingResource,
    TrackResolver, VoiceRoomQuery,
};

/// Identificador de pedido, creciente por manager
pub type RequestId = u64;

/// Canal opcional para reportar el desenlace de un pedido
pub type CompletionSender = oneshot::Sender<Result<(), AudioError>>;

/// Fábrica de providers de PCM; inyectable para poder ejercitar el
/// manager sin procesos externos
pub type ProviderFactory =
    dyn Fn(&AudioSettings, &StreamingResource) -> Result<PcmProvider, AudioError> + Send + Sync;

/// Pedido de reproducción dirigido a un canal de voz de la guild
pub struct AudioRequest {
    pub track_id: String,
    pub requested_by: UserId,
    /// Canal de texto donde publicar el mensaje "reproduciendo ahora"
    pub source_channel: ChannelId,
    /// Canal de voz destino del audio
    pub voice_channel: ChannelId,
    pub auto_play: bool,
    pub silent: bool,
    pub high_priority: bool,
    pub completion: Option<CompletionSender>,
    #[allow(dead_code)]
    pub requested_at: DateTime<Utc>,
}

impl AudioRequest {
    pub fn new(
        track_id: impl Into<String>,
        requested_by: UserId,
        source_channel: ChannelId,
        voice_channel: ChannelId,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            requested_by,
            source_channel,
            voice_channel,
            auto_play: true,
            silent: false,
            high_priority: false,
            completion: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    #[allow(dead_code)]
    pub fn with_auto_play(mut self, auto_play: bool) -> Self {
        self.auto_play = auto_play;
        self
    }

    #[allow(dead_code)]
    pub fn with_completion(mut self, completion: CompletionSender) -> Self {
        self.completion = Some(completion);
        self
    }
}

struct QueuedRequest {
    id: RequestId,
    request: AudioRequest,
    resolved: ResolvedTrack,
}

struct ActivePlayback {
    #[allow(dead_code)]
    request_id: RequestId,
    source: Arc<AudioSource>,
    completion: Option<CompletionSender>,
    track_id: String,
}

#[derive(Default)]
struct ManagerState {
    queue: VecDeque<QueuedRequest>,
    subsystem: Option<Arc<PlaybackSubsystem>>,
    active: Option<ActivePlayback>,
    /// Slot reservado mientras una activación está en curso, para que
    /// dos activaciones concurrentes no saquen dos cabezas de la cola
    activating: bool,
    /// Id del mensaje "reproduciendo ahora"; se edita en lugar de
    /// publicar uno nuevo por activación
    player_message: Option<MessageId>,
}

pub struct AudioManager {
    guild_id: GuildId,
    transport: Arc<dyn VoiceTransport>,
    resolver: Arc<dyn TrackResolver>,
    notifier: Arc<dyn PlaybackNotifier>,
    rooms: Arc<dyn VoiceRoomQuery>,
    settings: AudioSettings,
    providers: Arc<ProviderFactory>,
    state: Mutex<ManagerState>,
    next_request_id: AtomicU64,
}

impl AudioManager {
    pub fn new(
        guild_id: GuildId,
        transport: Arc<dyn VoiceTransport>,
        resolver: Arc<dyn TrackResolver>,
        notifier: Arc<dyn PlaybackNotifier>,
        rooms: Arc<dyn VoiceRoomQuery>,
        settings: AudioSettings,
    ) -> Self {
        Self {
            guild_id,
            transport,
            resolver,
            notifier,
            rooms,
            settings,
            providers: Arc::new(build_provider),
            state: Mutex::new(ManagerState::default()),
            next_request_id: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn with_provider_factory(mut self, providers: Arc<ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    /// Encola un pedido de reproducción.
    ///
    /// La resolución del track id es eager: un id desconocido falla acá
    /// sin crear subsistema, conexión ni procesos. Un pedido con
    /// `high_priority` vacía la cola y pide el stop de la fuente activa
    /// antes de quedar como única entrada; si no hay pedido activo, la
    /// cabeza de la cola se activa de inmediato.
    pub async fn enqueue(self: &Arc<Self>, request: AudioRequest) -> Result<RequestId, AudioError> {
        let resolved = self.resolve_request(&request.track_id)?;

        self.ensure_subsystem(request.voice_channel).await?;

        if request.high_priority {
            let preempted = {
                let mut state = self.state.lock();
                let dropped = state.queue.len();
                state.queue.clear();
                if dropped > 0 {
                    debug!("🗑️ {} pedidos descartados por prioridad en guild {}", dropped, self.guild_id);
                }
                state.active.as_ref().map(|active| active.source.clone())
            };
            if let Some(source) = preempted {
                debug!("⏹️ Preempción por prioridad en guild {}", self.guild_id);
                source.stop();
            }
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let should_activate = {
            let mut state = self.state.lock();
            info!(
                "➕ Pedido de audio [track = {}  prioridad = {}  en cola = {}]",
                request.track_id,
                request.high_priority,
                state.queue.len() + 1
            );
            state.queue.push_back(QueuedRequest {
                id,
                request,
                resolved,
            });
            state.active.is_none() && !state.activating
        };

        if should_activate {
            self.activate_next();
        }

        Ok(id)
    }

    /// Detiene la fuente activa; el auto-avance sigue el mismo camino
    /// que un fin de stream natural
    pub fn skip_current(&self) {
        let source = {
            let state = self.state.lock();
            state.active.as_ref().map(|active| active.source.clone())
        };
        if let Some(source) = source {
            info!("⏭️ Saltando el audio actual de guild {}", self.guild_id);
            source.stop();
        }
    }

    /// Arranca la fuente activa creada con `auto_play = false`
    #[allow(dead_code)]
    pub fn play_current(&self) -> Result<(), AudioError> {
        let source = {
            let state = self.state.lock();
            state.active.as_ref().map(|active| active.source.clone())
        };
        match source {
            Some(source) => source.play(),
            None => Ok(()),
        }
    }

    /// Vacía la cola, pide el stop de todas las fuentes registradas y
    /// recién al observarlas cerradas desarma el subsistema. Con la cola
    /// ya vacía y sin subsistema se resuelve de inmediato.
    pub async fn cancel_all(&self) {
        info!("🛑 Cancelando todos los pedidos de guild {}", self.guild_id);

        let (subsystem, active) = {
            let mut state = self.state.lock();
            state.queue.clear();
            state.activating = false;
            (state.subsystem.take(), state.active.take())
        };

        if let Some(active) = active {
            if !active.source.playing() && !active.source.stop_requested() {
                // fuente creada sin auto-play: nunca se registró en el
                // subsistema, así que se libera acá
                active.source.stop();
                if let Err(e) = active.source.dispose() {
                    warn!("Error liberando la fuente activa: {}", e);
                }
            }
        }

        let Some(subsystem) = subsystem else { return };
        subsystem.stop_all();
        subsystem.wait_drained().await;
        let _ = tokio::task::spawn_blocking(move || subsystem.stop()).await;
    }

    /// Indica si el pedido sigue esperando en la cola
    pub fn is_enqueued(&self, id: RequestId) -> bool {
        self.state.lock().queue.iter().any(|queued| queued.id == id)
    }

    #[allow(dead_code)]
    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .subsystem
            .as_ref()
            .map(|subsystem| subsystem.connection_state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn resolve_request(&self, track_id: &str) -> Result<ResolvedTrack, AudioError> {
        if track_id.starts_with("https://") {
            let url = Url::parse(track_id)
                .map_err(|_| AudioError::UnsupportedSource(format!("URL inválida: {track_id}")))?;
            return Ok(ResolvedTrack {
                resource: StreamingResource {
                    source: url,
                    looping: false,
                    volume: 1.0,
                },
                title: track_id.to_string(),
                artist: "Desconocido".to_string(),
            });
        }
        self.resolver.resolve(track_id)
    }

    /// Devuelve el subsistema de la guild, creándolo y conectándolo en
    /// el primer uso. `connect` es idempotente ante llamadas concurrentes.
    async fn ensure_subsystem(
        self: &Arc<Self>,
        voice_channel: ChannelId,
    ) -> Result<Arc<PlaybackSubsystem>, AudioError> {
        let (subsystem, events) = {
            let mut state = self.state.lock();
            match &state.subsystem {
                Some(subsystem) => (subsystem.clone(), None),
                None => {
                    let (subsystem, events) = PlaybackSubsystem::new(
                        self.guild_id,
                        voice_channel,
                        self.transport.clone(),
                        self.rooms.clone(),
                        self.settings.stream_chunk,
                    );
                    state.subsystem = Some(subsystem.clone());
                    (subsystem, Some(events))
                }
            }
        };

        if let Some(events) = events {
            self.spawn_event_pump(&subsystem, events);
        }

        if let Err(e) = subsystem.connect().await {
            let mut state = self.state.lock();
            if state
                .subsystem
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &subsystem))
            {
                state.subsystem = None;
            }
            return Err(e);
        }

        Ok(subsystem)
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        subsystem: &Arc<PlaybackSubsystem>,
        events: flume::Receiver<SubsystemEvent>,
    ) {
        let manager = self.clone();
        let subsystem = Arc::downgrade(subsystem);
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                match event {
                    SubsystemEvent::SourceStopped(source_id) => {
                        manager.on_source_stopped(source_id);
                    }
                    SubsystemEvent::Stopped => {
                        manager.on_subsystem_stopped(&subsystem);
                        break;
                    }
                }
            }
        });
    }

    /// Auto-avance: si la fuente detenida era la activa, libera el slot
    /// y activa la nueva cabeza de la cola
    fn on_source_stopped(self: &Arc<Self>, source_id: SourceId) {
        let finished = {
            let mut state = self.state.lock();
            if state
                .active
                .as_ref()
                .map(|active| active.source.id())
                == Some(source_id)
            {
                state.active.take()
            } else {
                None
            }
        };

        let Some(mut finished) = finished else { return };
        info!("⏹️ Audio `{}` terminado en guild {}", finished.track_id, self.guild_id);
        if let Some(done) = finished.completion.take() {
            let _ = done.send(Ok(()));
        }

        self.activate_next();
    }

    /// Teardown: el subsistema terminó (desconexión del transporte o
    /// canal vacío). Se descarta la referencia para que el próximo
    /// `enqueue` levante una conexión nueva desde cero.
    fn on_subsystem_stopped(&self, stopped: &Weak<PlaybackSubsystem>) {
        let mut state = self.state.lock();
        let same = match (stopped.upgrade(), &state.subsystem) {
            (Some(stopped), Some(current)) => Arc::ptr_eq(&stopped, current),
            _ => false,
        };
        if !same {
            return;
        }

        info!("🔌 Subsistema de guild {} detenido; limpiando estado", self.guild_id);
        state.subsystem = None;
        state.queue.clear();
        state.active = None;
        state.activating = false;
    }

    /// Activa la cabeza de la cola. Un pedido cuya preparación falla
    /// solo se faultea a sí mismo; la activación continúa con el
    /// siguiente encolado.
    fn activate_next(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.active.is_some() || state.activating {
                    return;
                }
                let Some(next) = state.queue.pop_front() else {
                    debug!("📭 Cola vacía en guild {}", self.guild_id);
                    return;
                };
                state.activating = true;
                next
            };

            let QueuedRequest {
                id,
                mut request,
                resolved,
            } = next;
            info!("🎵 Activando pedido {} [track = {}]", id, request.track_id);

            let subsystem = self.state.lock().subsystem.clone();
            let Some(subsystem) = subsystem else {
                self.state.lock().activating = false;
                warn!("Subsistema ausente al activar el pedido {}", id);
                if let Some(done) = request.completion.take() {
                    let _ = done.send(Err(AudioError::TransportDisconnected(
                        "subsistema no disponible".to_string(),
                    )));
                }
                return;
            };

            let provider = match (self.providers)(&self.settings, &resolved.resource) {
                Ok(provider) => provider,
                Err(e) => {
                    self.state.lock().activating = false;
                    error!("❌ No se pudo preparar el pedido {}: {}", id, e);
                    if let Some(done) = request.completion.take() {
                        let _ = done.send(Err(e));
                    }
                    continue;
                }
            };

            let source = match subsystem.new_source() {
                Ok(source) => source,
                Err(e) => {
                    self.state.lock().activating = false;
                    error!("❌ No se pudo crear la fuente del pedido {}: {}", id, e);
                    if let Some(done) = request.completion.take() {
                        let _ = done.send(Err(e));
                    }
                    continue;
                }
            };
            source.attach_provider(provider);

            {
                let mut state = self.state.lock();
                state.activating = false;
                state.active = Some(ActivePlayback {
                    request_id: id,
                    source: source.clone(),
                    completion: request.completion.take(),
                    track_id: request.track_id.clone(),
                });
            }

            if request.auto_play {
                if let Err(e) = source.play() {
                    error!("❌ No se pudo iniciar el pedido {}: {}", id, e);
                    let completion = {
                        let mut state = self.state.lock();
                        state
                            .active
                            .take()
                            .and_then(|mut active| active.completion.take())
                    };
                    if let Some(done) = completion {
                        let _ = done.send(Err(e));
                    }
                    if let Err(e) = source.dispose() {
                        warn!("Error liberando la fuente fallida: {}", e);
                    }
                    continue;
                }
            } else {
                debug!("⏸️ Pedido {} creado sin auto-play", id);
            }

            if !request.silent {
                self.spawn_notification(
                    request.source_channel,
                    NowPlaying {
                        title: resolved.title.clone(),
                        artist: resolved.artist.clone(),
                    },
                );
            }

            return;
        }
    }

    /// Publica o edita el mensaje "reproduciendo ahora". Best-effort:
    /// cualquier error se loguea y se descarta.
    fn spawn_notification(self: &Arc<Self>, channel: ChannelId, playing: NowPlaying) {
        let manager = self.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let existing = manager.state.lock().player_message;
            match existing {
                None => match notifier.post(channel, &playing).await {
                    Ok(message_id) => {
                        manager.state.lock().player_message = Some(message_id);
                    }
                    Err(e) => warn!("No se pudo publicar el mensaje de reproducción: {:?}", e),
                },
                Some(message_id) => {
                    if let Err(e) = notifier.update(channel, message_id, &playing).await {
                        warn!("No se pudo editar el mensaje de reproducción: {:?}", e);
                    }
                }
            }
        });
    }
}
