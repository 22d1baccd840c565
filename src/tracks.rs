//! Tabla de tracks configurada en JSON.
//!
//! Resuelve un track id a un recurso decodificable: cada entrada tiene
//! uno o más archivos (se elige uno al azar por activación) y propiedades
//! de grupo que cada archivo puede pisar. Regla de fallback: un id
//! desconocido usa la entrada llamada `default`; sin entrada y sin
//! default la resolución falla con `ResourceNotFound`, igual que una
//! ruta local inexistente.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use rand::seq::SliceRandom;
use serde::Deserialize;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use tracing::{debug, error, info};
use url::Url;

use crate::audio::{AudioError, ResolvedTrack, StreamingResource, TrackResolver};

const UNKNOWN_TITLE: &str = "Título desconocido";
const UNKNOWN_ARTIST: &str = "Artista desconocido";

#[derive(Debug, Deserialize)]
struct TrackTableFile {
    tracks: Vec<TrackEntry>,
}

#[derive(Debug, Deserialize)]
struct TrackEntry {
    name: String,
    #[serde(default)]
    properties: TrackProperties,
    files: Vec<TrackFile>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct TrackProperties {
    volume: Option<f32>,
    looping: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TrackFile {
    path: String,
    #[serde(default)]
    properties: TrackProperties,
}

pub struct TrackTable {
    entries: Vec<TrackEntry>,
}

impl TrackTable {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("No se pudo leer la tabla de tracks {path:?}"))?;
        let parsed: TrackTableFile = serde_json::from_str(&raw)
            .with_context(|| format!("Tabla de tracks inválida {path:?}"))?;

        info!("🎼 Tabla de tracks cargada: {} entradas", parsed.tracks.len());
        Ok(Self {
            entries: parsed.tracks,
        })
    }

    fn entry(&self, name: &str) -> Option<&TrackEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

impl TrackResolver for TrackTable {
    fn resolve(&self, track_id: &str) -> Result<ResolvedTrack, AudioError> {
        if track_id.is_empty() {
            return Err(AudioError::ResourceNotFound(track_id.to_string()));
        }

        let entry = self
            .entry(track_id)
            .or_else(|| self.entry("default"))
            .ok_or_else(|| {
                error!("Se pidió el track `{}` pero no existe", track_id);
                AudioError::ResourceNotFound(track_id.to_string())
            })?;

        let file = entry
            .files
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| AudioError::ResourceNotFound(track_id.to_string()))?;

        // la propiedad del archivo pisa la del grupo
        let volume = file.properties.volume.or(entry.properties.volume).unwrap_or(1.0);
        let looping = file
            .properties
            .looping
            .or(entry.properties.looping)
            .unwrap_or(false);

        let source = Url::parse(&file.path)
            .map_err(|_| AudioError::ResourceNotFound(track_id.to_string()))?;

        let (title, artist) = if source.scheme() == "file" {
            let local = source
                .to_file_path()
                .map_err(|_| AudioError::ResourceNotFound(track_id.to_string()))?;
            if !local.exists() {
                error!(
                    "El track `{}` apunta a una ruta inexistente {:?}",
                    track_id, local
                );
                return Err(AudioError::ResourceNotFound(track_id.to_string()));
            }
            read_tags(&local)
        } else {
            (entry.name.clone(), UNKNOWN_ARTIST.to_string())
        };

        debug!(
            "🎯 Track `{}` resuelto a {} [volumen = {}  loop = {}]",
            track_id, source, volume, looping
        );

        Ok(ResolvedTrack {
            resource: StreamingResource {
                source,
                looping,
                volume,
            },
            title,
            artist,
        })
    }
}

/// Lee título y artista de los tags del archivo; cualquier problema cae
/// a los valores por defecto
fn read_tags(path: &Path) -> (String, String) {
    let fallback = || (UNKNOWN_TITLE.to_string(), UNKNOWN_ARTIST.to_string());

    let Ok(file) = File::open(path) else {
        return fallback();
    };
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    );
    let Ok(mut probed) = probed else {
        return fallback();
    };

    let mut title = None;
    let mut artist = None;
    let mut scan = |revision: &MetadataRevision| {
        for tag in revision.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) if title.is_none() => {
                    title = Some(tag.value.to_string());
                }
                Some(StandardTagKey::Artist | StandardTagKey::AlbumArtist)
                    if artist.is_none() =>
                {
                    artist = Some(tag.value.to_string());
                }
                _ => {}
            }
        }
    };

    if let Some(container) = probed.metadata.get() {
        if let Some(revision) = container.current() {
            scan(revision);
        }
    }
    if let Some(revision) = probed.format.metadata().current() {
        scan(revision);
    }

    (
        title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn media_file(dir: &TempDir, name: &str) -> Url {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"not really audio").unwrap();
        Url::from_file_path(&path).unwrap()
    }

    fn table(dir: &TempDir, json: &str) -> TrackTable {
        let path = dir.path().join("tracks.json");
        std::fs::write(&path, json).unwrap();
        TrackTable::load(&path).unwrap()
    }

    #[test]
    fn test_resolves_known_track_with_group_properties() {
        let dir = TempDir::new().unwrap();
        let media = media_file(&dir, "poll.mp3");
        let table = table(
            &dir,
            &format!(
                r#"{{"tracks": [{{"name": "poll", "properties": {{"volume": 0.5, "looping": true}}, "files": [{{"path": "{media}"}}]}}]}}"#
            ),
        );

        let resolved = table.resolve("poll").unwrap();
        assert_eq!(resolved.resource.source, media);
        assert_eq!(resolved.resource.volume, 0.5);
        assert!(resolved.resource.looping);
        // el archivo no tiene tags legibles: caen los valores por defecto
        assert_eq!(resolved.title, UNKNOWN_TITLE);
        assert_eq!(resolved.artist, UNKNOWN_ARTIST);
    }

    #[test]
    fn test_file_properties_override_group() {
        let dir = TempDir::new().unwrap();
        let media = media_file(&dir, "chime.mp3");
        let table = table(
            &dir,
            &format!(
                r#"{{"tracks": [{{"name": "chime", "properties": {{"volume": 0.5}}, "files": [{{"path": "{media}", "properties": {{"volume": 0.9}}}}]}}]}}"#
            ),
        );

        let resolved = table.resolve("chime").unwrap();
        assert_eq!(resolved.resource.volume, 0.9);
        assert!(!resolved.resource.looping);
    }

    #[test]
    fn test_unknown_track_falls_back_to_default_entry() {
        let dir = TempDir::new().unwrap();
        let media = media_file(&dir, "default.mp3");
        let table = table(
            &dir,
            &format!(
                r#"{{"tracks": [{{"name": "default", "files": [{{"path": "{media}"}}]}}]}}"#
            ),
        );

        let resolved = table.resolve("algo-que-no-existe").unwrap();
        assert_eq!(resolved.resource.source, media);
    }

    #[test]
    fn test_unknown_track_without_default_fails() {
        let dir = TempDir::new().unwrap();
        let media = media_file(&dir, "poll.mp3");
        let table = table(
            &dir,
            &format!(r#"{{"tracks": [{{"name": "poll", "files": [{{"path": "{media}"}}]}}]}}"#),
        );

        let err = table.resolve("missing.mp3").unwrap_err();
        assert!(matches!(err, AudioError::ResourceNotFound(_)));
    }

    #[test]
    fn test_missing_local_file_fails_at_resolution() {
        let dir = TempDir::new().unwrap();
        let table = table(
            &dir,
            r#"{"tracks": [{"name": "roto", "files": [{"path": "file:///no/existe/roto.mp3"}]}]}"#,
        );

        let err = table.resolve("roto").unwrap_err();
        assert!(matches!(err, AudioError::ResourceNotFound(_)));
    }

    #[test]
    fn test_empty_track_id_fails() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, r#"{"tracks": []}"#);
        assert!(matches!(
            table.resolve(""),
            Err(AudioError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_remote_entry_keeps_entry_name_as_title() {
        let dir = TempDir::new().unwrap();
        let table = table(
            &dir,
            r#"{"tracks": [{"name": "radio", "files": [{"path": "https://www.youtube.com/watch?v=abc"}]}]}"#,
        );

        let resolved = table.resolve("radio").unwrap();
        assert_eq!(resolved.title, "radio");
        assert_eq!(resolved.resource.source.scheme(), "https");
    }
}
