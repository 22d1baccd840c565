//! Consulta de ocupación de canales de voz sobre la caché de serenity.

use std::sync::Arc;

use serenity::cache::Cache;
use serenity::model::id::{ChannelId, GuildId};

use crate::audio::VoiceRoomQuery;

pub struct CacheRoomQuery {
    cache: Arc<Cache>,
}

impl CacheRoomQuery {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

impl VoiceRoomQuery for CacheRoomQuery {
    fn is_voice_room_empty(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        let Some(guild) = self.cache.guild(guild_id) else {
            return true;
        };
        let Some(channel) = guild.channels.get(&channel_id) else {
            return true;
        };

        match channel.members(&self.cache) {
            Ok(members) => members.iter().filter(|member| !member.user.bot).count() == 0,
            // sin datos de membresía no se desarma la sesión
            Err(_) => false,
        }
    }
}
