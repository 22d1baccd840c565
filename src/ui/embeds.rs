use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};

use crate::audio::NowPlaying;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Open Cue Bot";

/// Crea el embed del mensaje "reproduciendo ahora"
pub fn create_now_playing_embed(playing: &NowPlaying) -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", playing.title))
        .color(colors::MUSIC_PURPLE)
        .field("🎤 Artista", playing.artist.clone(), true)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed de confirmación para respuestas de comandos
pub fn create_response_embed(title: &str, detail: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title.to_string())
        .description(detail.to_string())
        .color(colors::SUCCESS_GREEN)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed de error para respuestas de comandos
pub fn create_error_embed(title: &str, detail: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {title}"))
        .description(detail.to_string())
        .color(colors::ERROR_RED)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}
