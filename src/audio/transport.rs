//! Abstracción del transporte de voz.
//!
//! El subsistema de reproducción escribe PCM crudo en sinks obtenidos de
//! una [`TransportConnection`]; la implementación de producción está en
//! [`super::discord`] y las pruebas usan un transporte en memoria.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use super::AudioError;

/// Estado de la conexión de voz de una guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Eventos que emite una conexión establecida
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// La conexión se perdió (error del driver o cierre remoto)
    Disconnected,
    /// Un participante abandonó el canal de voz
    ParticipantLeft,
}

/// Sink de escritura bloqueante de PCM (estéreo, s16le, 48 kHz).
///
/// Una escritura puede bloquear mientras el transporte consume; soltar el
/// sink cierra el stream del lado del transporte.
pub trait TransportSink: Write + Send {}

impl<T: Write + Send> TransportSink for T {}

/// Conexión viva a un canal de voz
pub trait TransportConnection: Send + Sync {
    /// Abre un sink PCM nuevo; cada fuente activa escribe en el suyo
    fn open_sink(&self) -> Result<Box<dyn TransportSink>, AudioError>;

    /// Eventos de desconexión y de participantes del canal
    fn events(&self) -> flume::Receiver<TransportEvent>;

    /// Corta la conexión; idempotente y best-effort
    fn hangup(&self);
}

/// Fábrica de conexiones de voz
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn TransportConnection>, AudioError>;
}
