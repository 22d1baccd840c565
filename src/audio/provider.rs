//! Providers de PCM que frontean procesos decodificadores externos.
//!
//! Los dos providers comparten el mismo contrato pull: `stream(want)`
//! bloquea hasta leer al menos un byte, llegar al final del stream o que
//! el proceso termine. El buffer interno se reutiliza entre llamadas para
//! no alocar por tick del worker.

use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use bytes::BytesMut;
use tracing::{debug, warn};
use url::Url;

use super::{AudioError, AudioSettings, StreamingResource};

/// Capacidad inicial del buffer reutilizable
const INITIAL_BUFFER: usize = 64 * 1024;

/// Hosts remotos que acepta el provider de extracción
const SUPPORTED_HOSTS: [&str; 4] = [
    "www.youtube.com",
    "youtube.com",
    "music.youtube.com",
    "youtu.be",
];

/// Decodificador de PCM; variante cerrada elegida al resolver el track
#[derive(Debug)]
pub enum PcmProvider {
    /// Archivo local decodificado por ffmpeg
    Ffmpeg(FfmpegPcmProvider),
    /// Extracción remota: yt-dlp piped a ffmpeg
    YtDlp(YtDlpPcmProvider),
    #[cfg(test)]
    Scripted(super::testing::ScriptedProvider),
}

impl PcmProvider {
    /// Lee al menos `want` bytes al buffer interno; devuelve cuántos entraron
    pub fn stream(&mut self, want: usize) -> Result<usize, AudioError> {
        match self {
            PcmProvider::Ffmpeg(p) => p.stream(want),
            PcmProvider::YtDlp(p) => p.stream(want),
            #[cfg(test)]
            PcmProvider::Scripted(p) => p.stream(want),
        }
    }

    /// Slice del buffer llenado por el último `stream`
    pub fn buffered(&self) -> &[u8] {
        match self {
            PcmProvider::Ffmpeg(p) => p.buffered(),
            PcmProvider::YtDlp(p) => p.buffered(),
            #[cfg(test)]
            PcmProvider::Scripted(p) => p.buffered(),
        }
    }

    pub fn end_of_stream(&self) -> bool {
        match self {
            PcmProvider::Ffmpeg(p) => p.end_of_stream(),
            PcmProvider::YtDlp(p) => p.end_of_stream(),
            #[cfg(test)]
            PcmProvider::Scripted(p) => p.end_of_stream(),
        }
    }

    #[allow(dead_code)]
    pub fn looping(&self) -> bool {
        match self {
            PcmProvider::Ffmpeg(p) => p.looping(),
            PcmProvider::YtDlp(_) => false,
            #[cfg(test)]
            PcmProvider::Scripted(p) => p.looping(),
        }
    }

    /// Libera proceso y buffer; exactamente una vez
    pub fn close(&mut self) -> Result<(), AudioError> {
        match self {
            PcmProvider::Ffmpeg(p) => p.close(),
            PcmProvider::YtDlp(p) => p.close(),
            #[cfg(test)]
            PcmProvider::Scripted(p) => p.close(),
        }
    }
}

/// Construye el provider que corresponde al recurso resuelto
pub fn build_provider(
    settings: &AudioSettings,
    resource: &StreamingResource,
) -> Result<PcmProvider, AudioError> {
    match resource.source.scheme() {
        "file" => Ok(PcmProvider::Ffmpeg(FfmpegPcmProvider::spawn(
            &settings.ffmpeg_path,
            resource,
        )?)),
        "http" | "https" => {
            if resource.looping {
                return Err(AudioError::UnsupportedSource(
                    "looping no está soportado para fuentes remotas".to_string(),
                ));
            }
            let yt_dlp = settings.yt_dlp_path.as_deref().ok_or_else(|| {
                AudioError::ProcessStartFailure(std::io::Error::new(
                    ErrorKind::NotFound,
                    "YT_DLP_PATH sin configurar",
                ))
            })?;
            Ok(PcmProvider::YtDlp(YtDlpPcmProvider::spawn(
                yt_dlp,
                &settings.ffmpeg_path,
                &resource.source,
            )?))
        }
        other => Err(AudioError::UnsupportedSource(format!(
            "esquema `{other}` no soportado"
        ))),
    }
}

pub(crate) fn is_supported_host(url: &Url) -> bool {
    url.host_str()
        .map(|host| SUPPORTED_HOSTS.contains(&host))
        .unwrap_or(false)
}

/// Argumentos de ffmpeg para el contrato de salida fijo:
/// estéreo, s16le, 48 kHz por stdout.
fn ffmpeg_file_args(input: &Path, looping: bool, volume: f32) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "panic".to_string(),
        "-stream_loop".to_string(),
        if looping { "-1" } else { "0" }.to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-af".to_string(),
        format!("volume={volume:.1}"),
        "-ac".to_string(),
        "2".to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Mismo contrato de salida, leyendo de stdin (pipe desde yt-dlp)
fn ffmpeg_stdin_args() -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "panic".to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Loop de lectura compartido: llena `buf` desde `reader` hasta juntar
/// `want` bytes o quedarse sin datos. Un error de lectura se trata como
/// fin de stream (el worker detiene esa fuente sola).
fn fill_buffer(reader: &mut impl Read, buf: &mut BytesMut, want: usize) -> (usize, bool) {
    let mut filled = 0;
    let mut eof = false;

    while filled < want && filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(e) => {
                warn!("Error leyendo salida del decodificador: {}", e);
                eof = true;
                break;
            }
        }
    }

    (filled, eof)
}

fn grow_if_needed(buf: &mut BytesMut, want: usize) {
    if want > buf.len() {
        let new_len = (buf.len() + want) * 2;
        buf.resize(new_len, 0);
    }
}

/// Provider local: ffmpeg leyendo un archivo referenciado por URI `file://`
#[derive(Debug)]
pub struct FfmpegPcmProvider {
    child: Child,
    stdout: ChildStdout,
    buf: BytesMut,
    filled: usize,
    eof: bool,
    closed: bool,
    looping: bool,
}

impl FfmpegPcmProvider {
    /// Lanza el proceso ffmpeg; falla rápido si no se puede iniciar
    pub fn spawn(ffmpeg: &str, resource: &StreamingResource) -> Result<Self, AudioError> {
        let path = resource.source.to_file_path().map_err(|_| {
            AudioError::UnsupportedSource(format!(
                "URI `{}` no es un archivo local",
                resource.source
            ))
        })?;

        let mut child = Command::new(ffmpeg)
            .args(ffmpeg_file_args(&path, resource.looping, resource.volume))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(AudioError::ProcessStartFailure)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AudioError::ProcessStartFailure(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "ffmpeg no expuso stdout",
            ))
        })?;

        debug!("🎛️ ffmpeg iniciado para {}", path.display());

        Ok(Self {
            child,
            stdout,
            buf: BytesMut::zeroed(INITIAL_BUFFER),
            filled: 0,
            eof: false,
            closed: false,
            looping: resource.looping,
        })
    }

    pub fn stream(&mut self, want: usize) -> Result<usize, AudioError> {
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        if self.eof {
            return Err(AudioError::EndOfStream);
        }
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            self.eof = true;
            self.filled = 0;
            return Ok(0);
        }

        grow_if_needed(&mut self.buf, want);
        let (filled, eof) = fill_buffer(&mut self.stdout, &mut self.buf, want);
        self.filled = filled;
        if eof {
            self.eof = true;
        }
        Ok(filled)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    pub fn end_of_stream(&self) -> bool {
        self.eof
    }

    #[allow(dead_code)]
    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn close(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        self.closed = true;
        self.filled = 0;
        let _ = self.child.kill();
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for FfmpegPcmProvider {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Provider remoto: yt-dlp extrae el audio y lo pipea al mismo contrato
/// ffmpeg de salida fija. No soporta looping.
#[derive(Debug)]
pub struct YtDlpPcmProvider {
    extractor: Child,
    decoder: Child,
    stdout: ChildStdout,
    buf: BytesMut,
    filled: usize,
    eof: bool,
    closed: bool,
}

impl YtDlpPcmProvider {
    /// Lanza `yt-dlp | ffmpeg`; valida el host antes de tocar procesos
    pub fn spawn(yt_dlp: &str, ffmpeg: &str, url: &Url) -> Result<Self, AudioError> {
        if !is_supported_host(url) {
            return Err(AudioError::UnsupportedSource(format!(
                "host remoto `{}` no reconocido",
                url.host_str().unwrap_or("?")
            )));
        }

        let mut extractor = Command::new(yt_dlp)
            .args(["--quiet", "-f", "worstaudio", "-o", "-"])
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(AudioError::ProcessStartFailure)?;

        let extracted = extractor.stdout.take().ok_or_else(|| {
            AudioError::ProcessStartFailure(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "yt-dlp no expuso stdout",
            ))
        })?;

        let decoder = Command::new(ffmpeg)
            .args(ffmpeg_stdin_args())
            .stdin(Stdio::from(extracted))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut decoder = match decoder {
            Ok(child) => child,
            Err(e) => {
                let _ = extractor.kill();
                let _ = extractor.wait();
                return Err(AudioError::ProcessStartFailure(e));
            }
        };

        let stdout = match decoder.stdout.take() {
            Some(out) => out,
            None => {
                let _ = extractor.kill();
                let _ = extractor.wait();
                let _ = decoder.kill();
                let _ = decoder.wait();
                return Err(AudioError::ProcessStartFailure(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "ffmpeg no expuso stdout",
                )));
            }
        };

        debug!("📡 yt-dlp + ffmpeg iniciados para {}", url);

        Ok(Self {
            extractor,
            decoder,
            stdout,
            buf: BytesMut::zeroed(INITIAL_BUFFER),
            filled: 0,
            eof: false,
            closed: false,
        })
    }

    pub fn stream(&mut self, want: usize) -> Result<usize, AudioError> {
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        if self.eof {
            return Err(AudioError::EndOfStream);
        }
        if matches!(self.decoder.try_wait(), Ok(Some(_))) {
            self.eof = true;
            self.filled = 0;
            return Ok(0);
        }

        grow_if_needed(&mut self.buf, want);
        let (filled, eof) = fill_buffer(&mut self.stdout, &mut self.buf, want);
        self.filled = filled;
        if eof {
            self.eof = true;
        }
        Ok(filled)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    pub fn end_of_stream(&self) -> bool {
        self.eof
    }

    pub fn close(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::AlreadyDisposed);
        }
        self.closed = true;
        self.filled = 0;
        let _ = self.decoder.kill();
        let _ = self.decoder.wait();
        let _ = self.extractor.kill();
        let _ = self.extractor.wait();
        Ok(())
    }
}

impl Drop for YtDlpPcmProvider {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.decoder.kill();
            let _ = self.decoder.wait();
            let _ = self.extractor.kill();
            let _ = self.extractor.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    fn file_resource(path: &str, looping: bool, volume: f32) -> StreamingResource {
        StreamingResource {
            source: Url::parse(&format!("file://{path}")).unwrap(),
            looping,
            volume,
        }
    }

    #[test]
    fn test_ffmpeg_args_fixed_output_format() {
        let args = ffmpeg_file_args(&PathBuf::from("/tmp/chime.mp3"), false, 1.0);
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "panic",
                "-stream_loop",
                "0",
                "-i",
                "/tmp/chime.mp3",
                "-af",
                "volume=1.0",
                "-ac",
                "2",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "pipe:1",
            ]
        );
    }

    #[test]
    fn test_ffmpeg_args_looping_and_volume() {
        let args = ffmpeg_file_args(&PathBuf::from("/tmp/loop.ogg"), true, 0.5);
        assert_eq!(args[4], "-1");
        assert!(args.contains(&"volume=0.5".to_string()));
    }

    #[test]
    fn test_supported_hosts() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=test",
        ] {
            assert!(is_supported_host(&Url::parse(url).unwrap()), "{url}");
        }
        assert!(!is_supported_host(
            &Url::parse("https://example.com/video").unwrap()
        ));
    }

    #[test]
    fn test_spawn_failure_is_process_start_failure() {
        let settings = AudioSettings {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ..AudioSettings::default()
        };
        let err = build_provider(&settings, &file_resource("/tmp/x.mp3", false, 1.0)).unwrap_err();
        assert!(matches!(err, AudioError::ProcessStartFailure(_)));
    }

    #[test]
    fn test_remote_without_ytdlp_configured() {
        let settings = AudioSettings::default();
        let resource = StreamingResource {
            source: Url::parse("https://www.youtube.com/watch?v=abc").unwrap(),
            looping: false,
            volume: 1.0,
        };
        let err = build_provider(&settings, &resource).unwrap_err();
        assert!(matches!(err, AudioError::ProcessStartFailure(_)));
    }

    #[test]
    fn test_remote_looping_is_unsupported() {
        let settings = AudioSettings {
            yt_dlp_path: Some("yt-dlp".to_string()),
            ..AudioSettings::default()
        };
        let resource = StreamingResource {
            source: Url::parse("https://www.youtube.com/watch?v=abc").unwrap(),
            looping: true,
            volume: 1.0,
        };
        let err = build_provider(&settings, &resource).unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedSource(_)));
    }

    #[test]
    fn test_unknown_remote_host_is_unsupported() {
        let err = YtDlpPcmProvider::spawn(
            "yt-dlp",
            "ffmpeg",
            &Url::parse("https://vimeo.com/12345").unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedSource(_)));
    }

    #[test]
    fn test_unsupported_scheme() {
        let settings = AudioSettings::default();
        let resource = StreamingResource {
            source: Url::parse("ftp://host/file.mp3").unwrap(),
            looping: false,
            volume: 1.0,
        };
        let err = build_provider(&settings, &resource).unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedSource(_)));
    }
}
