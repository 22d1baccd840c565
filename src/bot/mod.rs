//! # Bot Module
//!
//! Cáscara Discord de Open Cue Bot: registro de comandos, eventos de
//! gateway y el cableado entre serenity/songbird y el motor de audio.
//!
//! El registro de managers de audio se construye recién en `ready`,
//! cuando la caché y el cliente HTTP del contexto están disponibles.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use songbird::Songbird;
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;
pub mod notify;
pub mod rooms;

use crate::{
    audio::{discord::DiscordVoiceTransport, registry::GuildAudioRegistry},
    config::Config,
    tracks::TrackTable,
};
use notify::DiscordNotifier;
use rooms::CacheRoomQuery;

pub struct OpenCueBot {
    config: Arc<Config>,
    tracks: Arc<TrackTable>,
    songbird: Arc<Songbird>,
    registry: OnceLock<Arc<GuildAudioRegistry>>,
}

impl OpenCueBot {
    pub fn new(config: Config, tracks: Arc<TrackTable>, songbird: Arc<Songbird>) -> Self {
        Self {
            config: Arc::new(config),
            tracks,
            songbird,
            registry: OnceLock::new(),
        }
    }

    /// Registro de audio por guild; disponible después de `ready`
    pub fn registry(&self) -> Result<Arc<GuildAudioRegistry>> {
        self.registry
            .get()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("El bot todavía no terminó de inicializar"))
    }

    fn init_registry(&self, ctx: &Context) {
        self.registry.get_or_init(|| {
            Arc::new(GuildAudioRegistry::new(
                Arc::new(DiscordVoiceTransport::new(self.songbird.clone())),
                self.tracks.clone(),
                Arc::new(DiscordNotifier::new(ctx.http.clone())),
                Arc::new(CacheRoomQuery::new(ctx.cache.clone())),
                self.config.audio_settings(),
            ))
        });
    }

    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::from(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for OpenCueBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        self.init_registry(&ctx);

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// El motor escucha los eventos del driver de voz; acá solo se cubre
    /// el caso de una desconexión externa del bot (kick o move manual)
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        if old.is_some() && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Bot desconectado del canal de voz en guild {}", guild_id);
                if let Ok(registry) = self.registry() {
                    registry.get_or_create(guild_id).cancel_all().await;
                }
            }
        }
    }
}
