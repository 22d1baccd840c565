//! Fuente de audio activa: un provider de PCM atado a un sink del
//! transporte, con protocolo de stop cooperativo en dos fases.
//!
//! Máquina de estados: `Created` (provider asignado, sin reproducir) →
//! `Playing` (registrada en el subsistema, `update()` por tick) →
//! `StopRequested` (flush en curso) → `Closed` (flush terminado, lista
//! para liberar).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::provider::PcmProvider;
use super::subsystem::PlaybackSubsystem;
use super::transport::TransportSink;
use super::AudioError;

/// Identificador de fuente, único por proceso
pub type SourceId = u64;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub struct AudioSource {
    id: SourceId,
    subsystem: Weak<PlaybackSubsystem>,
    provider: Mutex<Option<PcmProvider>>,
    sink: Mutex<Option<Box<dyn TransportSink>>>,
    chunk: usize,
    playing: AtomicBool,
    stop_requested: AtomicBool,
    closed: AtomicBool,
    disposed: AtomicBool,
}

impl AudioSource {
    pub(super) fn new(
        subsystem: Weak<PlaybackSubsystem>,
        sink: Box<dyn TransportSink>,
        chunk: usize,
    ) -> Self {
        Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            subsystem,
            provider: Mutex::new(None),
            sink: Mutex::new(Some(sink)),
            chunk,
            playing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Asigna el provider; la fuente lo posee en exclusiva hasta liberarse
    pub fn attach_provider(&self, provider: PcmProvider) {
        *self.provider.lock() = Some(provider);
    }

    /// Registra la fuente en el subsistema y empieza a reproducir.
    ///
    /// No-op si ya está reproduciendo; error si no hay provider asignado.
    pub fn play(self: &Arc<Self>) -> Result<(), AudioError> {
        if self.provider.lock().is_none() {
            return Err(AudioError::MissingProvider);
        }
        if self.playing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let subsystem = self
            .subsystem
            .upgrade()
            .ok_or_else(|| AudioError::TransportDisconnected("subsistema liberado".to_string()))?;
        subsystem.add_source(self.clone());
        Ok(())
    }

    /// Pide el stop cooperativo. Idempotente: solo el primer caller
    /// dispara el flush asíncrono; el resto es no-op.
    pub fn stop(self: &Arc<Self>) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Stop solicitado para fuente {}", self.id);
        self.playing.store(false, Ordering::SeqCst);

        let sink = self.sink.lock().take();
        let this = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cue-flush-{}", this.id))
            .spawn(move || {
                if let Some(mut sink) = sink {
                    if let Err(e) = sink.flush() {
                        debug!("Flush del sink falló: {}", e);
                    }
                }
                this.closed.store(true, Ordering::SeqCst);
                debug!("Fuente {} cerrada", this.id);
            });

        if let Err(e) = spawned {
            warn!("No se pudo crear el hilo de flush: {}", e);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Avanzar dentro del stream no está soportado: los providers son
    /// decodificadores streaming sin capacidad de seek. No-op documentado.
    #[allow(dead_code)]
    pub fn forward(&self, _amount: Duration) {}

    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Un tick de streaming: pide hasta `chunk` bytes al provider y los
    /// escribe al sink. Devuelve 0 tras `StopRequested`/`Closed`, al
    /// llegar al fin del stream o si el sink quedó inescribible; el
    /// worker interpreta ese 0 pidiendo el stop de esta fuente.
    pub fn update(&self) -> usize {
        if self.stop_requested() || self.closed() {
            return 0;
        }

        let mut provider = self.provider.lock();
        let Some(provider) = provider.as_mut() else {
            return 0;
        };

        if provider.end_of_stream() {
            return 0;
        }

        let streamed = match provider.stream(self.chunk) {
            Ok(n) => n,
            Err(e) => {
                warn!("Provider de la fuente {} falló: {}", self.id, e);
                return 0;
            }
        };

        if streamed > 0 {
            let mut sink = self.sink.lock();
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.write_all(provider.buffered()) {
                    warn!("Sink de la fuente {} inescribible: {}", self.id, e);
                    return 0;
                }
            }
        }

        streamed
    }

    /// Libera el provider. Exactamente una vez; la segunda llamada es un
    /// error de contrato.
    pub fn dispose(&self) -> Result<(), AudioError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(AudioError::AlreadyDisposed);
        }
        if let Some(mut provider) = self.provider.lock().take() {
            provider.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{CountingSink, ScriptedProvider};
    use super::*;

    fn detached_source(sink: Box<dyn TransportSink>) -> Arc<AudioSource> {
        Arc::new(AudioSource::new(Weak::new(), sink, 4))
    }

    fn wait_closed(source: &Arc<AudioSource>) {
        for _ in 0..200 {
            if source.closed() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("la fuente nunca llegó a Closed");
    }

    #[test]
    fn test_update_returns_zero_once_at_end_of_stream() {
        let sink = CountingSink::new();
        let source = detached_source(Box::new(sink.clone()));
        let provider = ScriptedProvider::finite(vec![vec![1, 2, 3, 4]]);
        let calls = provider.stream_calls();
        source.attach_provider(PcmProvider::Scripted(provider));

        assert_eq!(source.update(), 4);
        // el provider marca EndOfStream y update devuelve 0 exactamente una vez
        assert_eq!(source.update(), 0);

        source.stop();
        wait_closed(&source);

        // después de Closed no hay más llamadas al provider
        let streams_before = calls.load(Ordering::SeqCst);
        assert_eq!(source.update(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), streams_before);
        assert_eq!(sink.written(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_twice_flushes_once() {
        let sink = CountingSink::new();
        let source = detached_source(Box::new(sink.clone()));
        source.attach_provider(PcmProvider::Scripted(ScriptedProvider::endless(vec![0; 4])));

        let a = source.clone();
        let b = source.clone();
        let t1 = std::thread::spawn(move || a.stop());
        let t2 = std::thread::spawn(move || b.stop());
        t1.join().unwrap();
        t2.join().unwrap();

        wait_closed(&source);
        assert_eq!(sink.flushes(), 1);
        assert!(source.stop_requested());
    }

    #[test]
    fn test_play_without_provider_fails() {
        let source = detached_source(Box::new(CountingSink::new()));
        assert!(matches!(source.play(), Err(AudioError::MissingProvider)));
    }

    #[test]
    fn test_dispose_twice_is_contract_violation() {
        let source = detached_source(Box::new(CountingSink::new()));
        source.attach_provider(PcmProvider::Scripted(ScriptedProvider::finite(vec![])));

        assert!(source.dispose().is_ok());
        assert!(matches!(source.dispose(), Err(AudioError::AlreadyDisposed)));
    }

    #[test]
    fn test_forward_is_a_noop() {
        let sink = CountingSink::new();
        let source = detached_source(Box::new(sink.clone()));
        let provider = ScriptedProvider::finite(vec![vec![9, 9]]);
        source.attach_provider(PcmProvider::Scripted(provider));

        source.forward(Duration::from_secs(30));
        assert_eq!(source.update(), 2);
        assert_eq!(sink.written(), vec![9, 9]);
    }
}
