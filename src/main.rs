use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod tracks;
mod ui;

use crate::bot::OpenCueBot;
use crate::config::Config;
use crate::tracks::TrackTable;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_cue=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Cue Bot v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Cargar la tabla de tracks; sin ella no hay nada que reproducir
    let tracks = Arc::new(TrackTable::load(&config.tracks_file)?);

    // Configurar intents mínimos necesarios
    let intents =
        GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES | GatewayIntents::GUILD_MESSAGES;

    // Crear handler del bot
    let songbird = Songbird::serenity();
    let handler = OpenCueBot::new(config.clone(), tracks, songbird.clone());

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    // yt-dlp es opcional: sin él solo se pierden las fuentes remotas
    let yt_dlp_ok = match &config.yt_dlp_path {
        Some(path) => async_process::Command::new(path)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false),
        None => true,
    };

    if ffmpeg.status.success() && yt_dlp_ok {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
