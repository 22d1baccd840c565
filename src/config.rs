use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::{AudioSettings, DEFAULT_STREAM_CHUNK};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub ffmpeg_path: String,
    pub yt_dlp_path: Option<String>,
    pub stream_chunk_bytes: usize,

    // Paths
    pub tracks_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Audio
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            yt_dlp_path: std::env::var("YT_DLP_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty()),
            stream_chunk_bytes: std::env::var("STREAM_CHUNK_BYTES")
                .unwrap_or_else(|_| DEFAULT_STREAM_CHUNK.to_string())
                .parse()?,

            // Paths
            tracks_file: std::env::var("TRACKS_FILE")
                .unwrap_or_else(|_| "tracks.json".to_string())
                .into(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Chequeos de sanidad sobre la configuración cargada
    pub fn validate(&self) -> Result<()> {
        if self.ffmpeg_path.trim().is_empty() {
            anyhow::bail!("FFMPEG_PATH no puede estar vacío");
        }

        if self.stream_chunk_bytes == 0 {
            anyhow::bail!("STREAM_CHUNK_BYTES debe ser mayor a 0");
        }

        // chunks gigantes solo agregan latencia entre ticks del worker
        if self.stream_chunk_bytes > 1024 * 1024 {
            anyhow::bail!(
                "STREAM_CHUNK_BYTES demasiado grande: {}",
                self.stream_chunk_bytes
            );
        }

        Ok(())
    }

    /// Subconjunto de configuración que consume el motor de audio
    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            yt_dlp_path: self.yt_dlp_path.clone(),
            stream_chunk: self.stream_chunk_bytes,
        }
    }

    /// Resumen apto para loguear (sin token)
    pub fn summary(&self) -> String {
        format!(
            "Config: app {} (guild: {}), ffmpeg: {}, yt-dlp: {}, chunk: {} bytes, tracks: {}",
            self.application_id,
            self.guild_id
                .map_or("global".to_string(), |id| id.to_string()),
            self.ffmpeg_path,
            self.yt_dlp_path.as_deref().unwrap_or("sin configurar"),
            self.stream_chunk_bytes,
            self.tracks_file.display(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin defaults: deben proveerse)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            // Audio
            ffmpeg_path: "ffmpeg".to_string(),
            yt_dlp_path: None,
            stream_chunk_bytes: DEFAULT_STREAM_CHUNK,

            // Paths
            tracks_file: "tracks.json".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_is_rejected() {
        let config = Config {
            stream_chunk_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_ffmpeg_path_is_rejected() {
        let config = Config {
            ffmpeg_path: "  ".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audio_settings_mapping() {
        let config = Config {
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            yt_dlp_path: Some("/usr/bin/yt-dlp".to_string()),
            stream_chunk_bytes: 512,
            ..Config::default()
        };

        let settings = config.audio_settings();
        assert_eq!(settings.ffmpeg_path, "/usr/bin/ffmpeg");
        assert_eq!(settings.yt_dlp_path.as_deref(), Some("/usr/bin/yt-dlp"));
        assert_eq!(settings.stream_chunk, 512);
    }
}
