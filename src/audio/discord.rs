//! Implementación del transporte de voz sobre songbird.
//!
//! Cada sink abierto alimenta un input del driver a través de un pipe
//! acotado: el worker escribe PCM s16le bloqueando por backpressure y el
//! driver lo consume como stream f32 intercalado vía `RawAdapter`.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::events::CoreEvent;
use songbird::input::core::io::MediaSource;
use songbird::input::{AudioStream, Input, LiveInput, RawAdapter};
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::transport::{TransportConnection, TransportEvent, TransportSink, VoiceTransport};
use super::{AudioError, CHANNELS, SAMPLE_RATE};

/// Chunks en vuelo entre el worker y el driver de voz
const PIPE_DEPTH: usize = 16;

pub struct DiscordVoiceTransport {
    songbird: Arc<Songbird>,
}

impl DiscordVoiceTransport {
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self { songbird }
    }
}

#[async_trait]
impl VoiceTransport for DiscordVoiceTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn TransportConnection>, AudioError> {
        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|e| AudioError::TransportDisconnected(e.to_string()))?;

        let (events_tx, events_rx) = flume::unbounded();
        {
            let mut handler = call.lock().await;
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                EventRelay {
                    tx: events_tx.clone(),
                    event: TransportEvent::Disconnected,
                },
            );
            handler.add_global_event(
                Event::Core(CoreEvent::ClientDisconnect),
                EventRelay {
                    tx: events_tx,
                    event: TransportEvent::ParticipantLeft,
                },
            );
        }

        info!(
            "🔊 Conectado al canal de voz {} en guild {}",
            channel_id, guild_id
        );

        Ok(Arc::new(DiscordConnection {
            guild_id,
            songbird: self.songbird.clone(),
            call,
            events: events_rx,
            runtime: Handle::current(),
            hung_up: AtomicBool::new(false),
        }))
    }
}

/// Reenvía eventos del driver al canal que escucha el subsistema
struct EventRelay {
    tx: flume::Sender<TransportEvent>,
    event: TransportEvent,
}

#[async_trait]
impl VoiceEventHandler for EventRelay {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let _ = self.tx.send(self.event);
        None
    }
}

struct DiscordConnection {
    guild_id: GuildId,
    songbird: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    events: flume::Receiver<TransportEvent>,
    runtime: Handle,
    hung_up: AtomicBool,
}

impl TransportConnection for DiscordConnection {
    fn open_sink(&self) -> Result<Box<dyn TransportSink>, AudioError> {
        let (tx, rx) = flume::bounded::<Vec<u8>>(PIPE_DEPTH);
        let reader = PcmPipeReader {
            rx,
            leftover: Vec::new(),
            offset: 0,
        };
        let adapter = RawAdapter::new(reader, SAMPLE_RATE, CHANNELS);
        let stream = AudioStream {
            input: Box::new(adapter) as Box<dyn MediaSource>,
            hint: None,
        };
        let input = Input::Live(LiveInput::Raw(stream), None);

        let call = self.call.clone();
        self.runtime.spawn(async move {
            let mut handler = call.lock().await;
            let _ = handler.play_input(input);
            debug!("🎶 Stream PCM registrado en el driver de voz");
        });

        Ok(Box::new(DiscordPcmSink { tx, carry: None }))
    }

    fn events(&self) -> flume::Receiver<TransportEvent> {
        self.events.clone()
    }

    fn hangup(&self) {
        if self.hung_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let songbird = self.songbird.clone();
        let guild_id = self.guild_id;
        self.runtime.spawn(async move {
            if let Err(e) = songbird.remove(guild_id).await {
                debug!("Error al salir del canal de voz de guild {}: {}", guild_id, e);
            }
        });
    }
}

/// Lado de lectura del pipe; el driver lo consume como `MediaSource`
struct PcmPipeReader {
    rx: flume::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    offset: usize,
}

impl Read for PcmPipeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.leftover.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.leftover = chunk;
                    self.offset = 0;
                }
                // sink soltado: fin del stream para el driver
                Err(_) => return Ok(0),
            }
        }

        let n = (self.leftover.len() - self.offset).min(out.len());
        out[..n].copy_from_slice(&self.leftover[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Seek for PcmPipeReader {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            ErrorKind::Unsupported,
            "el stream PCM no soporta seek",
        ))
    }
}

impl MediaSource for PcmPipeReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Lado de escritura: convierte los s16le del decodificador al f32
/// intercalado que espera `RawAdapter`
struct DiscordPcmSink {
    tx: flume::Sender<Vec<u8>>,
    carry: Option<u8>,
}

impl Write for DiscordPcmSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut joined = Vec::new();
        let data: &[u8] = match self.carry.take() {
            Some(carry) => {
                joined.reserve(buf.len() + 1);
                joined.push(carry);
                joined.extend_from_slice(buf);
                &joined
            }
            None => buf,
        };

        let mut out = Vec::with_capacity(data.len() * 2);
        let mut pairs = data.chunks_exact(2);
        for pair in &mut pairs {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            out.extend_from_slice(&(f32::from(sample) / 32_768.0).to_le_bytes());
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }

        if !out.is_empty() {
            self.tx.send(out).map_err(|_| {
                std::io::Error::new(ErrorKind::BrokenPipe, "el driver de voz cerró el stream")
            })?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
