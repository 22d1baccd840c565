//! # Audio Module
//!
//! Voice playback engine for Open Cue Bot.
//!
//! This module provides the core audio functionality including:
//! - Per-guild playback request queues with priority preemption
//! - Connection lifecycle management for voice channels
//! - PCM streaming through external decoder processes
//! - Multi-guild concurrent audio streaming
//!
//! ## Architecture
//!
//! The engine is built around four main components:
//!
//! ### [`manager`] - Audio Manager
//! - Owns the per-guild FIFO request queue and the active request slot
//! - Applies manager policy: priority preemption, auto-advance, teardown
//! - Posts/updates the single "now playing" message per guild
//!
//! ### [`subsystem`] - Playback Subsystem
//! - Owns the transport connection state machine per guild
//! - Runs one dedicated worker thread that round-robins active sources
//!
//! ### [`source`] - Audio Source
//! - Binds one decoding provider to one transport sink
//! - Cooperative two-phase stop: `StopRequested` → flush → `Closed`
//!
//! ### [`provider`] - PCM Providers
//! - `ffmpeg` for local files, `yt-dlp | ffmpeg` for remote extraction
//! - Pull-based `stream(max)` contract over a reusable byte buffer
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Bit Depth**: 16-bit signed little-endian
//! - **Channels**: Stereo (2 channels)
//!
//! External collaborators (track resolution, notifications, voice room
//! membership, the transport itself) are consumed through the traits in
//! this module so the engine never touches Discord directly.

pub mod discord;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod source;
pub mod subsystem;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use thiserror::Error;
use url::Url;

/// Frecuencia de muestreo del PCM que consume el transporte
pub const SAMPLE_RATE: u32 = 48_000;
/// Canales del PCM que consume el transporte
pub const CHANNELS: u32 = 2;
/// Bytes mínimos pedidos al provider en cada tick del worker
pub const DEFAULT_STREAM_CHUNK: usize = 256;

/// Errores del subsistema de audio
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("el track `{0}` no resuelve a ningún recurso conocido")]
    ResourceNotFound(String),

    #[error("no se pudo iniciar el proceso decodificador")]
    ProcessStartFailure(#[source] std::io::Error),

    #[error("fuente no soportada: {0}")]
    UnsupportedSource(String),

    #[error("conexión de voz perdida: {0}")]
    TransportDisconnected(String),

    #[error("el recurso ya fue liberado")]
    AlreadyDisposed,

    #[error("el decodificador ya llegó al final del stream")]
    EndOfStream,

    #[error("la fuente de audio no tiene provider asignado")]
    MissingProvider,
}

/// Recurso decodificable resuelto a partir de un track id
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingResource {
    pub source: Url,
    pub looping: bool,
    pub volume: f32,
}

/// Resultado de resolver un track id: recurso + metadatos para mostrar
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrack {
    pub resource: StreamingResource,
    pub title: String,
    pub artist: String,
}

/// Metadatos del mensaje "reproduciendo ahora"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: String,
    pub artist: String,
}

/// Configuración del motor de audio extraída de [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Ruta del binario ffmpeg
    pub ffmpeg_path: String,
    /// Ruta del binario yt-dlp, si está configurado
    pub yt_dlp_path: Option<String>,
    /// Bytes mínimos por tick del worker
    pub stream_chunk: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            yt_dlp_path: None,
            stream_chunk: DEFAULT_STREAM_CHUNK,
        }
    }
}

/// Resuelve un track id a un recurso decodificable.
///
/// Debe poder llamarse desde cualquier hilo; la resolución ocurre antes
/// de crear conexiones o procesos, así que un id desconocido falla sin
/// efectos secundarios.
pub trait TrackResolver: Send + Sync {
    fn resolve(&self, track_id: &str) -> Result<ResolvedTrack, AudioError>;
}

/// Publica o edita el mensaje "reproduciendo ahora" de una guild.
///
/// Todos los envíos son best-effort: el manager loguea y descarta los
/// errores, nunca los propaga al caller de `enqueue`.
#[async_trait]
pub trait PlaybackNotifier: Send + Sync {
    async fn post(&self, channel: ChannelId, playing: &NowPlaying) -> anyhow::Result<MessageId>;

    async fn update(
        &self,
        channel: ChannelId,
        message: MessageId,
        playing: &NowPlaying,
    ) -> anyhow::Result<()>;
}

/// Informa si queda algún participante humano en un canal de voz
#[cfg_attr(test, mockall::automock)]
pub trait VoiceRoomQuery: Send + Sync {
    fn is_voice_room_empty(&self, guild_id: GuildId, channel_id: ChannelId) -> bool;
}
