//! Dobles de prueba del motor de audio: transporte en memoria, provider
//! guionado, resolver estático y notifier que graba lo publicado.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use url::Url;

use super::transport::{TransportConnection, TransportEvent, TransportSink, VoiceTransport};
use super::{
    AudioError, NowPlaying, PlaybackNotifier, ResolvedTrack, StreamingResource, TrackResolver,
};

/// Espera activa con timeout para condiciones asíncronas en tests
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("la condición nunca se cumplió");
}

#[derive(Debug)]
enum Script {
    Finite(VecDeque<Vec<u8>>),
    Endless(Vec<u8>),
}

/// Provider guionado: entrega los chunks dados y después marca fin de
/// stream, o repite el mismo chunk para siempre (variante endless).
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Script,
    buf: Vec<u8>,
    eof: bool,
    closed: bool,
    looping: bool,
    stream_calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn finite(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            script: Script::Finite(chunks.into()),
            buf: Vec::new(),
            eof: false,
            closed: false,
            looping: false,
            stream_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn endless(chunk: Vec<u8>) -> Self {
        Self {
            script: Script::Endless(chunk),
            buf: Vec::new(),
            eof: false,
            closed: false,
            looping: true,
            stream_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stream_calls(&self) -> Arc<AtomicUsize> {
        self.stream_calls.clone()
    }

    pub fn stream(&mut self, _want: usize) -> Result<usize, AudioError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        if self.eof {
            return Err(AudioError::EndOfStream);
        }

        match &mut self.script {
            Script::Finite(chunks) => match chunks.pop_front() {
                Some(chunk) => {
                    self.buf = chunk;
                    Ok(self.buf.len())
                }
                None => {
                    self.eof = true;
                    self.buf.clear();
                    Ok(0)
                }
            },
            Script::Endless(chunk) => {
                // ritmo artificial para que el worker no sature el sink
                std::thread::sleep(Duration::from_millis(1));
                self.buf = chunk.clone();
                Ok(self.buf.len())
            }
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn end_of_stream(&self) -> bool {
        self.eof
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn close(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        self.closed = true;
        self.buf.clear();
        Ok(())
    }
}

/// Sink que acumula lo escrito y cuenta los flushes
#[derive(Clone)]
pub struct CountingSink {
    data: Arc<Mutex<Vec<u8>>>,
    flushes: Arc<AtomicUsize>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Conexión en memoria: sinks que acumulan bytes y un canal de eventos
/// que el test dispara a mano
pub struct FakeConnection {
    events_tx: flume::Sender<TransportEvent>,
    events_rx: flume::Receiver<TransportEvent>,
    sinks: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
    hung_up: AtomicBool,
}

impl FakeConnection {
    fn new() -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            events_tx,
            events_rx,
            sinks: Mutex::new(Vec::new()),
            hung_up: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }

    /// Bytes escritos en cada sink abierto, en orden de apertura
    pub fn sink_data(&self) -> Vec<Vec<u8>> {
        self.sinks.lock().iter().map(|data| data.lock().clone()).collect()
    }
}

impl TransportConnection for FakeConnection {
    fn open_sink(&self) -> Result<Box<dyn TransportSink>, AudioError> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.sinks.lock().push(data.clone());
        Ok(Box::new(MemorySink { data }))
    }

    fn events(&self) -> flume::Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn hangup(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }
}

/// Transporte en memoria; la variante `gated` no completa la conexión
/// hasta que el test libera la compuerta (para observar `Connecting`)
pub struct FakeTransport {
    connects: AtomicUsize,
    gate: Option<Arc<tokio::sync::Notify>>,
    connection: Mutex<Option<Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            gate: None,
            connection: Mutex::new(None),
        })
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            gate: Some(Arc::new(tokio::sync::Notify::new())),
            connection: Mutex::new(None),
        })
    }

    pub fn release_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Última conexión entregada
    pub fn connection(&self) -> Arc<FakeConnection> {
        self.connection
            .lock()
            .clone()
            .expect("el transporte todavía no conectó")
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn connect(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> Result<Arc<dyn TransportConnection>, AudioError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(FakeConnection::new());
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }
}

/// Resolver con tabla fija en memoria
pub struct StaticResolver {
    tracks: HashMap<String, ResolvedTrack>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self {
            tracks: HashMap::new(),
        }
    }

    pub fn with(mut self, track_id: &str, title: &str, uri: &str) -> Self {
        self.tracks.insert(
            track_id.to_string(),
            ResolvedTrack {
                resource: StreamingResource {
                    source: Url::parse(uri).expect("URI de prueba inválida"),
                    looping: false,
                    volume: 1.0,
                },
                title: title.to_string(),
                artist: "Artista de Prueba".to_string(),
            },
        );
        self
    }
}

impl TrackResolver for StaticResolver {
    fn resolve(&self, track_id: &str) -> Result<ResolvedTrack, AudioError> {
        self.tracks
            .get(track_id)
            .cloned()
            .ok_or_else(|| AudioError::ResourceNotFound(track_id.to_string()))
    }
}

/// Notifier que graba cada publicación/edición en orden
pub struct RecordingNotifier {
    entries: Mutex<Vec<NowPlaying>>,
    posts: AtomicUsize,
    updates: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            posts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn titles(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|playing| playing.title.clone())
            .collect()
    }

    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackNotifier for RecordingNotifier {
    async fn post(&self, _channel: ChannelId, playing: &NowPlaying) -> anyhow::Result<MessageId> {
        self.entries.lock().push(playing.clone());
        self.posts.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId::new(900))
    }

    async fn update(
        &self,
        _channel: ChannelId,
        _message: MessageId,
        playing: &NowPlaying,
    ) -> anyhow::Result<()> {
        self.entries.lock().push(playing.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
