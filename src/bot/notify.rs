//! Implementación del notifier sobre la API de mensajes de Discord.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::builder::{CreateMessage, EditMessage};
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};

use crate::audio::{NowPlaying, PlaybackNotifier};
use crate::ui::embeds;

pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PlaybackNotifier for DiscordNotifier {
    async fn post(&self, channel: ChannelId, playing: &NowPlaying) -> anyhow::Result<MessageId> {
        let message = channel
            .send_message(
                &self.http,
                CreateMessage::new().embed(embeds::create_now_playing_embed(playing)),
            )
            .await?;
        Ok(message.id)
    }

    async fn update(
        &self,
        channel: ChannelId,
        message: MessageId,
        playing: &NowPlaying,
    ) -> anyhow::Result<()> {
        channel
            .edit_message(
                &self.http,
                message,
                EditMessage::new().embed(embeds::create_now_playing_embed(playing)),
            )
            .await?;
        Ok(())
    }
}
