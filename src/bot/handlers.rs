use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{audio::manager::AudioRequest, bot::OpenCueBot, ui::embeds};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &OpenCueBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "cue" => handle_cue(ctx, command, bot).await?,
        "skip" => handle_skip(ctx, command, bot).await?,
        "stopall" => handle_stopall(ctx, command, bot).await?,
        _ => {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content("❌ Comando no reconocido")
                            .ephemeral(true),
                    ),
                )
                .await?;
        }
    }

    Ok(())
}

async fn handle_cue(ctx: &Context, command: CommandInteraction, bot: &OpenCueBot) -> Result<()> {
    let guild_id = command.guild_id.unwrap();

    let track = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "track")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Track no proporcionado"))?
        .to_string();

    let priority = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "priority")
        .and_then(|opt| opt.value.as_bool())
        .unwrap_or(false);

    // Defer: conectar al canal de voz puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let voice_channel = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel) => channel,
        Err(_) => {
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().embed(embeds::create_error_embed(
                        "Audio",
                        "Tenés que estar en un canal de voz",
                    )),
                )
                .await?;
            return Ok(());
        }
    };

    let manager = bot.registry()?.get_or_create(guild_id);
    let request = AudioRequest::new(
        track.clone(),
        command.user.id,
        command.channel_id,
        voice_channel,
    )
    .with_high_priority(priority);

    match manager.enqueue(request).await {
        Ok(id) => {
            let detail = if manager.is_enqueued(id) {
                format!("⏳ `{track}` agregado a la cola")
            } else {
                format!("▶️ Reproduciendo `{track}`")
            };
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new()
                        .embed(embeds::create_response_embed("Audio", &detail)),
                )
                .await?;
        }
        Err(e) => {
            warn!("No se pudo encolar `{}` en guild {}: {}", track, guild_id, e);
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().embed(embeds::create_error_embed(
                        "Audio",
                        &format!("No se pudo reproducir `{track}`: {e}"),
                    )),
                )
                .await?;
        }
    }

    Ok(())
}

async fn handle_skip(ctx: &Context, command: CommandInteraction, bot: &OpenCueBot) -> Result<()> {
    let guild_id = command.guild_id.unwrap();

    bot.registry()?.get_or_create(guild_id).skip_current();

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content("⏭️ Audio saltado"),
            ),
        )
        .await?;

    Ok(())
}

async fn handle_stopall(
    ctx: &Context,
    command: CommandInteraction,
    bot: &OpenCueBot,
) -> Result<()> {
    let guild_id = command.guild_id.unwrap();

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    bot.registry()?.get_or_create(guild_id).cancel_all().await;

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .content("🛑 Pedidos cancelados y bot desconectado"),
        )
        .await?;

    Ok(())
}

// Funciones auxiliares

fn get_user_voice_channel(
    ctx: &Context,
    guild_id: GuildId,
    user_id: UserId,
) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}
