use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::framework::standard::CommandError;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::audio::ffmpeg_source;
use crate::messages::check_msg;
use crate::models::{QueueRegistry, Track};
use crate::ytdl::{self, Extractor};

pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Idle,
}

pub async fn playback_status(track_handle: &TrackHandle) -> PlaybackStatus {
    match track_handle.get_info().await {
        Ok(info) if info.playing == PlayMode::Play => PlaybackStatus::Playing,
        Ok(info) if info.playing == PlayMode::Pause => PlaybackStatus::Paused,
        _ => PlaybackStatus::Idle,
    }
}

pub async fn active_track(
    registry: &Mutex<QueueRegistry>,
    guild_id: GuildId,
) -> Option<TrackHandle> {
    let registry = registry.lock().await;

    registry.get(guild_id)?.track_handle.clone()
}

/// Detaches the guild's active track so that its end event no longer advances the queue.
pub async fn forget_track(
    registry: &Mutex<QueueRegistry>,
    guild_id: GuildId,
) -> Option<TrackHandle> {
    let mut registry = registry.lock().await;

    registry.get_mut(guild_id)?.track_handle.take()
}

/// A track that ran to its end without ever producing audio.
fn ended_without_audio(mode: PlayMode, position: Duration) -> bool {
    mode == PlayMode::End && position.is_zero()
}

/// The voice side of playback: connection state, the audio sink and the text channel.
#[async_trait]
pub trait Speaker: Send + Sync {
    fn is_connected(&self, guild_id: GuildId) -> bool;

    async fn status(&self, guild_id: GuildId) -> PlaybackStatus;

    /// Starts streaming `url` in the guild's voice call.
    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        url: &str,
    ) -> Result<TrackHandle, CommandError>;

    async fn say(&self, channel_id: ChannelId, text: String);
}

/// Plays through songbird calls and reports to Discord text channels.
pub struct VoiceSpeaker {
    registry: Arc<Mutex<QueueRegistry>>,
    songbird: Arc<Songbird>,
    http: Arc<Http>,
    ffmpeg_path: String,
}

#[async_trait]
impl Speaker for VoiceSpeaker {
    fn is_connected(&self, guild_id: GuildId) -> bool {
        self.songbird.get(guild_id).is_some()
    }

    async fn status(&self, guild_id: GuildId) -> PlaybackStatus {
        match active_track(&self.registry, guild_id).await {
            Some(track_handle) => playback_status(&track_handle).await,
            None => PlaybackStatus::Idle,
        }
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        url: &str,
    ) -> Result<TrackHandle, CommandError> {
        let call = self
            .songbird
            .get(guild_id)
            .ok_or(CommandError::from("Not in a voice channel"))?;

        let source = ffmpeg_source(&self.ffmpeg_path, url, track)?;
        let track_handle = call.lock().await.play_source(source);

        Ok(track_handle)
    }

    async fn say(&self, channel_id: ChannelId, text: String) {
        check_msg(channel_id.say(&self.http, text).await);
    }
}

pub enum PlayerEvent {
    StartIfIdle {
        guild_id: GuildId,
        channel_id: ChannelId,
    },
    TrackEnded {
        guild_id: GuildId,
        channel_id: ChannelId,
        track_handle: TrackHandle,
    },
}

impl PlayerEvent {
    fn guild_id(&self) -> GuildId {
        match self {
            PlayerEvent::StartIfIdle { guild_id, .. } => *guild_id,
            PlayerEvent::TrackEnded { guild_id, .. } => *guild_id,
        }
    }
}

/// Posts events to the player task.
#[derive(Clone)]
pub struct PlayerHandle {
    sender: UnboundedSender<PlayerEvent>,
}

impl PlayerHandle {
    pub fn start_if_idle(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.post(PlayerEvent::StartIfIdle { guild_id, channel_id });
    }

    fn track_ended(&self, guild_id: GuildId, channel_id: ChannelId, track_handle: TrackHandle) {
        self.post(PlayerEvent::TrackEnded {
            guild_id,
            channel_id,
            track_handle,
        });
    }

    fn post(&self, event: PlayerEvent) {
        if self.sender.send(event).is_err() {
            warn!("Player task is gone, dropping event");
        }
    }
}

/// Owns queue advancement. Each guild gets its own task, so events for one guild are
/// handled one at a time, in order, while other guilds advance independently.
pub struct Player {
    registry: Arc<Mutex<QueueRegistry>>,
    extractor: Arc<dyn Extractor>,
    speaker: Arc<dyn Speaker>,
    handle: PlayerHandle,
}

enum Started {
    Playing,
    LeftVoice,
}

impl Player {
    pub fn spawn(
        registry: Arc<Mutex<QueueRegistry>>,
        songbird: Arc<Songbird>,
        http: Arc<Http>,
        extractor: Arc<dyn Extractor>,
        ffmpeg_path: String,
    ) -> PlayerHandle {
        let speaker = Arc::new(VoiceSpeaker {
            registry: registry.clone(),
            songbird,
            http,
            ffmpeg_path,
        });

        Self::launch(registry, extractor, speaker)
    }

    fn launch(
        registry: Arc<Mutex<QueueRegistry>>,
        extractor: Arc<dyn Extractor>,
        speaker: Arc<dyn Speaker>,
    ) -> PlayerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = PlayerHandle { sender };

        let player = Arc::new(Player {
            registry,
            extractor,
            speaker,
            handle: handle.clone(),
        });

        tokio::spawn(player.dispatch(receiver).instrument(info_span!("player")));

        handle
    }

    async fn dispatch(self: Arc<Self>, mut receiver: UnboundedReceiver<PlayerEvent>) {
        let mut guilds: HashMap<GuildId, UnboundedSender<PlayerEvent>> = HashMap::new();

        while let Some(event) = receiver.recv().await {
            let guild_id = event.guild_id();
            let worker = guilds
                .entry(guild_id)
                .or_insert_with(|| self.clone().spawn_worker(guild_id));

            if worker.send(event).is_err() {
                warn!("Player for guild {} is gone, dropping event", guild_id.0);
            }
        }

        info!("Player task stopped");
    }

    fn spawn_worker(self: Arc<Self>, guild_id: GuildId) -> UnboundedSender<PlayerEvent> {
        debug!("Starting player for guild {}", guild_id.0);

        let (sender, mut receiver) = mpsc::unbounded_channel();

        let task = async move {
            while let Some(event) = receiver.recv().await {
                self.handle_event(event).await;
            }
        };

        tokio::spawn(task.instrument(info_span!("advance", guild = guild_id.0)));

        sender
    }

    async fn handle_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::StartIfIdle { guild_id, channel_id } => {
                if self.speaker.status(guild_id).await != PlaybackStatus::Idle {
                    debug!("Guild {} is already playing", guild_id.0);
                    return;
                }

                self.play_next(guild_id, channel_id).await;
            }
            PlayerEvent::TrackEnded {
                guild_id,
                channel_id,
                track_handle,
            } => {
                let advance = self
                    .registry
                    .lock()
                    .await
                    .get_mut(guild_id)
                    .map_or(false, |server| server.end_track(&track_handle));

                if !advance {
                    debug!("Ignoring end of a detached track in guild {}", guild_id.0);
                    return;
                }

                self.play_next(guild_id, channel_id).await;
            }
        }
    }

    /// Plays the next queued track, skipping over tracks that cannot be played.
    async fn play_next(&self, guild_id: GuildId, channel_id: ChannelId) {
        loop {
            if !self.speaker.is_connected(guild_id) {
                debug!("Not in a voice channel, nothing to advance");
                return;
            }

            let next = {
                let mut registry = self.registry.lock().await;
                registry.get_or_create(guild_id).queue.get_next()
            };

            let track = match next {
                Some(track) => track,
                None => {
                    info!("Queue is empty");
                    self.speaker
                        .say(channel_id, "🎶 Queue is empty!".to_string())
                        .await;
                    return;
                }
            };

            info!("Next song is {} - {}", track.title, track.url);

            match self.start(guild_id, channel_id, &track).await {
                Ok(Started::Playing) => {
                    let text = format!("🎶 Now playing: **{}**", track.title);
                    self.speaker.say(channel_id, text).await;
                    return;
                }
                Ok(Started::LeftVoice) => {
                    info!("Left voice while resolving {}, not playing it", track.title);
                    return;
                }
                Err(why) => {
                    warn!("Could not play {}: {why}", track.title);
                    let text = "❌ Couldn't process this song (skipping)".to_string();
                    self.speaker.say(channel_id, text).await;
                }
            }
        }
    }

    async fn start(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        track: &Track,
    ) -> Result<Started, CommandError> {
        let url = ytdl::stream_url(&self.extractor, track).await?;

        // Resolving can take seconds; the bot may have left voice in the meantime.
        if !self.speaker.is_connected(guild_id) {
            return Ok(Started::LeftVoice);
        }

        let track_handle = self.speaker.play(guild_id, track, &url).await?;

        track_handle.add_event(
            Event::Track(TrackEvent::End),
            TrackEndNotifier {
                guild_id,
                channel_id,
                track_handle: track_handle.clone(),
                player: self.handle.clone(),
            },
        )?;

        self.registry.lock().await.get_or_create(guild_id).track_handle = Some(track_handle);

        Ok(Started::Playing)
    }
}

struct TrackEndNotifier {
    guild_id: GuildId,
    channel_id: ChannelId,
    track_handle: TrackHandle,
    player: PlayerHandle,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered for guild {}", self.guild_id.0);

        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                if ended_without_audio(state.playing, state.position) {
                    warn!(
                        "Track in guild {} ended without playing any audio",
                        self.guild_id.0
                    );
                } else {
                    debug!("Track ended in mode {:?} after {:?}", state.playing, state.position);
                }
            }
        }

        self.player
            .track_ended(self.guild_id, self.channel_id, self.track_handle.clone());

        None
    }
}

/// Leaves every voice channel where nothing is playing. Queues are left untouched.
pub fn spawn_idle_disconnect(registry: Arc<Mutex<QueueRegistry>>, songbird: Arc<Songbird>) {
    let task = async move {
        let mut interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
        interval.tick().await;

        loop {
            interval.tick().await;
            disconnect_idle(&registry, &songbird).await;
        }
    };

    tokio::spawn(task.instrument(info_span!("idle_disconnect")));
}

async fn disconnect_idle(registry: &Mutex<QueueRegistry>, songbird: &Songbird) {
    let guild_ids = registry.lock().await.guild_ids();

    for guild_id in guild_ids {
        if songbird.get(guild_id).is_none() {
            continue;
        }

        let is_playing = match active_track(registry, guild_id).await {
            Some(track_handle) => playback_status(&track_handle).await == PlaybackStatus::Playing,
            None => false,
        };

        if is_playing {
            continue;
        }

        info!("Leaving idle voice channel in guild {}", guild_id.0);

        // Detach first so that the resulting voice state update keeps the queue.
        if let Some(track_handle) = forget_track(registry, guild_id).await {
            if let Err(why) = track_handle.stop() {
                debug!("Stopping idle track failed: {why:?}");
            }
        }

        if let Err(why) = songbird.remove(guild_id).await {
            warn!("Failed to leave guild {}: {why:?}", guild_id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;
    use songbird::input::{Input, Reader};
    use songbird::tracks::{create_player, Track as QueuedAudio};
    use tokio::time::Instant;

    use super::*;
    use crate::ytdl::{VideoInfo, RETRY_DELAY};

    const GUILD: GuildId = GuildId(1);
    const CHANNEL: ChannelId = ChannelId(10);
    const SKIPPING: &str = "❌ Couldn't process this song (skipping)";

    fn silent_player() -> (QueuedAudio, TrackHandle) {
        create_player(Input::float_pcm(true, Reader::from_memory(Vec::new())))
    }

    /// Records what would have been played and said.
    struct Recorder {
        connected: AtomicBool,
        status: StdMutex<PlaybackStatus>,
        played: StdMutex<Vec<String>>,
        said: StdMutex<Vec<String>>,
        // Keeps the audio side of every handle alive so events can be attached.
        audio: StdMutex<Vec<QueuedAudio>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                status: StdMutex::new(PlaybackStatus::Idle),
                played: StdMutex::new(Vec::new()),
                said: StdMutex::new(Vec::new()),
                audio: StdMutex::new(Vec::new()),
            })
        }

        fn played(&self) -> Vec<String> {
            self.played.lock().unwrap().clone()
        }

        fn said(&self) -> Vec<String> {
            self.said.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Speaker for Recorder {
        fn is_connected(&self, _guild_id: GuildId) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn status(&self, _guild_id: GuildId) -> PlaybackStatus {
            *self.status.lock().unwrap()
        }

        async fn play(
            &self,
            guild_id: GuildId,
            track: &Track,
            url: &str,
        ) -> Result<TrackHandle, CommandError> {
            assert_eq!(url, format!("{}/stream", track.url));

            let (audio, track_handle) = silent_player();
            self.audio.lock().unwrap().push(audio);
            self.played
                .lock()
                .unwrap()
                .push(format!("{}:{}", guild_id.0, track.title));

            Ok(track_handle)
        }

        async fn say(&self, _channel_id: ChannelId, text: String) {
            self.said.lock().unwrap().push(text);
        }
    }

    /// Resolves every page URL to a stream, except the broken ones.
    struct Streams {
        broken: Vec<String>,
        calls: AtomicUsize,
        disconnects: Option<Arc<Recorder>>,
    }

    impl Streams {
        fn new(broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|url| url.to_string()).collect(),
                calls: AtomicUsize::new(0),
                disconnects: None,
            }
        }
    }

    impl Extractor for Streams {
        fn video_info(
            &self,
            target: &str,
            _format: &str,
        ) -> Result<Option<VideoInfo>, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(speaker) = &self.disconnects {
                speaker.connected.store(false, Ordering::SeqCst);
            }

            if self.broken.iter().any(|url| url == target) {
                return Err(CommandError::from("HTTP Error 403: Forbidden"));
            }

            Ok(Some(VideoInfo {
                url: Some(format!("{target}/stream")),
                ..VideoInfo::default()
            }))
        }

        fn playlist(&self, _url: &str) -> Result<Vec<Track>, CommandError> {
            Ok(Vec::new())
        }
    }

    fn track(title: &str) -> Track {
        Track::new(
            Some(title.to_string()),
            Some(format!("https://example.com/{title}")),
            None,
        )
    }

    fn registry_with(guild_id: GuildId, titles: &[&str]) -> Arc<Mutex<QueueRegistry>> {
        let mut registry = QueueRegistry::new();
        for title in titles {
            registry.get_or_create(guild_id).queue.add(track(title), None);
        }

        Arc::new(Mutex::new(registry))
    }

    fn player(
        registry: Arc<Mutex<QueueRegistry>>,
        extractor: Streams,
        speaker: Arc<Recorder>,
    ) -> (Player, UnboundedReceiver<PlayerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let player = Player {
            registry,
            extractor: Arc::new(extractor),
            speaker,
            handle: PlayerHandle { sender },
        };

        (player, receiver)
    }

    #[tokio::test(start_paused = true)]
    async fn unplayable_tracks_are_skipped() {
        let registry = registry_with(GUILD, &["A", "B"]);
        let speaker = Recorder::new();
        let extractor = Streams::new(&["https://example.com/A"]);
        let (player, _events) = player(registry.clone(), extractor, speaker.clone());

        player.play_next(GUILD, CHANNEL).await;

        assert_eq!(speaker.played(), vec!["1:B"]);
        assert_eq!(speaker.said(), vec![SKIPPING, "🎶 Now playing: **B**"]);

        let registry = registry.lock().await;
        let server = registry.get(GUILD).unwrap();
        assert!(server.track_handle.is_some());
        assert_eq!(server.queue.now_playing(), Some(&track("B")));
        assert_eq!(server.queue.last_played(), Some(&track("A")));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_queue_is_announced() {
        let registry = registry_with(GUILD, &["A"]);
        let speaker = Recorder::new();
        let extractor = Streams::new(&["https://example.com/A"]);
        let (player, _events) = player(registry.clone(), extractor, speaker.clone());

        player.play_next(GUILD, CHANNEL).await;

        assert!(speaker.played().is_empty());
        assert_eq!(speaker.said(), vec![SKIPPING, "🎶 Queue is empty!"]);
    }

    #[tokio::test]
    async fn only_the_active_track_end_advances() {
        let registry = registry_with(GUILD, &["C"]);
        let (_stale_audio, stale) = silent_player();
        let (_active_audio, active) = silent_player();
        registry.lock().await.get_or_create(GUILD).track_handle = Some(active.clone());

        let speaker = Recorder::new();
        let (player, _events) = player(registry.clone(), Streams::new(&[]), speaker.clone());

        player
            .handle_event(PlayerEvent::TrackEnded {
                guild_id: GUILD,
                channel_id: CHANNEL,
                track_handle: stale,
            })
            .await;

        assert!(speaker.played().is_empty());
        assert_eq!(registry.lock().await.get(GUILD).map(|server| server.queue.len()), Some(1));

        for _ in 0..2 {
            player
                .handle_event(PlayerEvent::TrackEnded {
                    guild_id: GUILD,
                    channel_id: CHANNEL,
                    track_handle: active.clone(),
                })
                .await;
        }

        assert_eq!(speaker.played(), vec!["1:C"]);
    }

    #[tokio::test]
    async fn start_request_is_ignored_while_paused() {
        let registry = registry_with(GUILD, &["A"]);
        let speaker = Recorder::new();
        *speaker.status.lock().unwrap() = PlaybackStatus::Paused;
        let (player, _events) = player(registry.clone(), Streams::new(&[]), speaker.clone());

        player
            .handle_event(PlayerEvent::StartIfIdle {
                guild_id: GUILD,
                channel_id: CHANNEL,
            })
            .await;

        assert!(speaker.played().is_empty());
        assert!(speaker.said().is_empty());
        assert_eq!(registry.lock().await.get(GUILD).map(|server| server.queue.len()), Some(1));
    }

    #[tokio::test]
    async fn leaving_voice_during_lookup_plays_nothing() {
        let registry = registry_with(GUILD, &["A"]);
        let speaker = Recorder::new();
        let mut extractor = Streams::new(&[]);
        extractor.disconnects = Some(speaker.clone());
        let (player, _events) = player(registry.clone(), extractor, speaker.clone());

        player.play_next(GUILD, CHANNEL).await;

        assert!(speaker.played().is_empty());
        assert!(speaker.said().is_empty());
        assert!(registry.lock().await.get(GUILD).unwrap().track_handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_guild_does_not_hold_up_others() {
        let slow = GuildId(1);
        let fast = GuildId(2);
        let registry = registry_with(slow, &["A"]);
        registry.lock().await.get_or_create(fast).queue.add(track("B"), None);

        let speaker = Recorder::new();
        let extractor = Arc::new(Streams::new(&["https://example.com/A"]));
        let handle = Player::launch(registry, extractor.clone(), speaker.clone());
        let started = Instant::now();

        handle.start_if_idle(slow, CHANNEL);
        handle.start_if_idle(fast, CHANNEL);

        while speaker.played().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(speaker.played(), vec!["2:B"]);
        assert!(started.elapsed() < RETRY_DELAY);
        assert!(!speaker.said().iter().any(|text| text == SKIPPING));
        assert!(extractor.calls.load(Ordering::SeqCst) < 4);
    }

    #[test]
    fn silent_natural_end_is_flagged() {
        assert!(ended_without_audio(PlayMode::End, Duration::ZERO));
        assert!(!ended_without_audio(PlayMode::End, Duration::from_secs(3)));
        assert!(!ended_without_audio(PlayMode::Stop, Duration::ZERO));
    }
}
