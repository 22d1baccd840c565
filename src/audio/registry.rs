//! Registro de managers de audio por guild: get-or-create thread-safe
//! con construcción perezosa. Crear un manager es barato; conexiones y
//! procesos quedan diferidos al primer uso.

use std::sync::Arc;

use dashmap::DashMap;
use serenity::model::id::GuildId;
use tracing::info;

use super::manager::AudioManager;
use super::{AudioSettings, PlaybackNotifier, TrackResolver, VoiceRoomQuery};
use super::transport::VoiceTransport;

pub struct GuildAudioRegistry {
    managers: DashMap<GuildId, Arc<AudioManager>>,
    transport: Arc<dyn VoiceTransport>,
    resolver: Arc<dyn TrackResolver>,
    notifier: Arc<dyn PlaybackNotifier>,
    rooms: Arc<dyn VoiceRoomQuery>,
    settings: AudioSettings,
}

impl GuildAudioRegistry {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        resolver: Arc<dyn TrackResolver>,
        notifier: Arc<dyn PlaybackNotifier>,
        rooms: Arc<dyn VoiceRoomQuery>,
        settings: AudioSettings,
    ) -> Self {
        Self {
            managers: DashMap::new(),
            transport,
            resolver,
            notifier,
            rooms,
            settings,
        }
    }

    /// Devuelve el manager de la guild, creándolo exactamente una vez
    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<AudioManager> {
        self.managers
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🎚️ Creando manager de audio para guild {}", guild_id);
                Arc::new(AudioManager::new(
                    guild_id,
                    self.transport.clone(),
                    self.resolver.clone(),
                    self.notifier.clone(),
                    self.rooms.clone(),
                    self.settings.clone(),
                ))
            })
            .clone()
    }
}

impl std::fmt::Debug for GuildAudioRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildAudioRegistry")
            .field("active_guilds", &self.managers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeTransport, RecordingNotifier, StaticResolver};
    use super::super::MockVoiceRoomQuery;
    use super::*;

    fn registry() -> GuildAudioRegistry {
        let mut rooms = MockVoiceRoomQuery::new();
        rooms.expect_is_voice_room_empty().returning(|_, _| false);
        GuildAudioRegistry::new(
            FakeTransport::new(),
            Arc::new(StaticResolver::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(rooms),
            AudioSettings::default(),
        )
    }

    #[test]
    fn test_same_guild_returns_same_manager() {
        let registry = registry();
        let a = registry.get_or_create(GuildId::new(1));
        let b = registry.get_or_create(GuildId::new(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_guilds_are_independent() {
        let registry = registry();
        let a = registry.get_or_create(GuildId::new(1));
        let b = registry.get_or_create(GuildId::new(2));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
