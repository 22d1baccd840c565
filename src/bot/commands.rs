use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![cue_command(), skip_command(), stopall_command()]
}

fn cue_command() -> CreateCommand {
    CreateCommand::new("cue")
        .description("Reproduce un track en tu canal de voz")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "track",
                "Nombre del track configurado o URL",
            )
            .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "priority",
            "Vaciar la cola y reproducir ya",
        ))
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta el audio actual")
}

fn stopall_command() -> CreateCommand {
    CreateCommand::new("stopall").description("Cancela todos los pedidos y desconecta el bot")
}
