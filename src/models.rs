use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use serenity::model::id::{ChannelId, GuildId};
use songbird::tracks::TrackHandle;

pub const HISTORY_CAPACITY: usize = 10;

pub const UNKNOWN_TRACK_TITLE: &str = "Unknown Title";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
}

impl Track {
    pub fn new(title: Option<String>, url: Option<String>, thumbnail: Option<String>) -> Self {
        Self {
            title: title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
            url: url.unwrap_or_default(),
            thumbnail,
        }
    }
}

/// Pending tracks, the track currently playing and the last few that played.
#[derive(Default, Debug)]
pub struct GuildQueue {
    pending: VecDeque<Track>,
    now_playing: Option<Track>,
    history: VecDeque<Track>,
    voice_channel: Option<ChannelId>,
}

impl GuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, track: Track, voice_channel: Option<ChannelId>) {
        self.pending.push_back(track);

        if let Some(channel) = voice_channel {
            self.voice_channel = Some(channel);
        }
    }

    /// Moves the head of the queue into the now playing slot.
    ///
    /// Returns `None` without touching anything when nothing is pending.
    pub fn get_next(&mut self) -> Option<Track> {
        let next = self.pending.pop_front()?;

        if let Some(previous) = self.now_playing.replace(next.clone()) {
            if self.history.len() == HISTORY_CAPACITY {
                self.history.pop_front();
            }
            self.history.push_back(previous);
        }

        Some(next)
    }

    /// Drops every pending track. The current track and the history are kept.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Track> {
        self.pending.iter()
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.now_playing.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.history.iter()
    }

    pub fn last_played(&self) -> Option<&Track> {
        self.history.back()
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.voice_channel
    }
}

pub struct ServerData {
    pub track_handle: Option<TrackHandle>,
    pub queue: GuildQueue,
}

impl ServerData {
    fn new() -> Self {
        Self {
            track_handle: None,
            queue: GuildQueue::new(),
        }
    }

    /// Detaches `ended` if it is still the active track. Returns whether the queue should advance.
    pub fn end_track(&mut self, ended: &TrackHandle) -> bool {
        match &self.track_handle {
            Some(active) if active.uuid() == ended.uuid() => {
                self.track_handle = None;
                true
            }
            _ => false,
        }
    }

    /// The bot lost its voice connection without going through `leave` or the idle check.
    ///
    /// Both of those detach the track before disconnecting, so pending tracks are only
    /// dropped when a track was still attached.
    pub fn voice_lost(&mut self) -> Option<TrackHandle> {
        let track_handle = self.track_handle.take();

        if track_handle.is_some() {
            self.queue.clear();
        }

        track_handle
    }
}

/// Every guild the bot has seen, keyed by guild id. Entries live until the process exits.
#[derive(Default)]
pub struct QueueRegistry {
    servers: HashMap<GuildId, ServerData>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, guild_id: GuildId) -> &mut ServerData {
        match self.servers.entry(guild_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!("Creating queue for guild {}", guild_id.0);
                entry.insert(ServerData::new())
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<&ServerData> {
        self.servers.get(&guild_id)
    }

    pub fn get_mut(&mut self, guild_id: GuildId) -> Option<&mut ServerData> {
        self.servers.get_mut(&guild_id)
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.servers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use songbird::input::{Input, Reader};
    use songbird::tracks::create_player;

    use super::*;

    fn track(title: &str) -> Track {
        Track::new(Some(title.to_string()), Some(format!("https://example.com/{title}")), None)
    }

    fn silent_track() -> TrackHandle {
        let source = Input::float_pcm(true, Reader::from_memory(Vec::new()));
        let (_, track_handle) = create_player(source);
        track_handle
    }

    fn titles<'a>(tracks: impl Iterator<Item = &'a Track>) -> Vec<&'a str> {
        tracks.map(|track| track.title.as_str()).collect()
    }

    #[test]
    fn missing_metadata_falls_back_to_defaults() {
        let track = Track::new(None, None, None);

        assert_eq!(track.title, "Unknown Title");
        assert_eq!(track.url, "");
        assert_eq!(track.thumbnail, None);
    }

    #[test]
    fn tracks_come_out_in_insertion_order() {
        let mut queue = GuildQueue::new();
        let names = ["a", "b", "c", "d", "e"];

        for name in names {
            queue.add(track(name), None);
        }

        let played: Vec<String> = std::iter::from_fn(|| queue.get_next())
            .map(|t| t.title)
            .collect();

        assert_eq!(played, names);
    }

    #[test]
    fn three_tracks_leave_two_in_history() {
        let mut queue = GuildQueue::new();
        queue.add(track("A"), None);
        queue.add(track("B"), None);
        queue.add(track("C"), None);

        assert_eq!(queue.get_next(), Some(track("A")));
        assert_eq!(queue.get_next(), Some(track("B")));
        assert_eq!(queue.get_next(), Some(track("C")));

        assert_eq!(titles(queue.history()), vec!["A", "B"]);
        assert_eq!(queue.now_playing(), Some(&track("C")));
        assert_eq!(queue.last_played(), Some(&track("B")));
        assert!(queue.is_empty());
    }

    #[test]
    fn exhausted_queue_keeps_current_track() {
        let mut queue = GuildQueue::new();
        for title in ["V", "W", "X"] {
            queue.add(track(title), None);
        }
        for _ in 0..3 {
            queue.get_next();
        }
        let history: Vec<Track> = queue.history().cloned().collect();

        assert_eq!(queue.get_next(), None);
        assert_eq!(queue.get_next(), None);
        assert_eq!(queue.now_playing(), Some(&track("X")));
        assert_eq!(queue.history().cloned().collect::<Vec<_>>(), history);
        assert_eq!(titles(queue.history()), vec!["V", "W"]);
    }

    #[test]
    fn empty_queue_returns_none() {
        let mut queue = GuildQueue::new();

        assert_eq!(queue.get_next(), None);
        assert_eq!(queue.now_playing(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn history_keeps_only_the_most_recent_ten() {
        let mut queue = GuildQueue::new();

        for index in 0..15 {
            queue.add(track(&index.to_string()), None);
        }
        while queue.get_next().is_some() {}

        let expected: Vec<String> = (4..14).map(|index| index.to_string()).collect();

        assert_eq!(titles(queue.history()), expected);
        assert_eq!(queue.now_playing().map(|t| t.title.as_str()), Some("14"));
    }

    #[test]
    fn clear_only_drops_pending_tracks() {
        let mut queue = GuildQueue::new();
        queue.add(track("A"), None);
        queue.add(track("B"), None);
        queue.add(track("C"), None);
        queue.add(track("D"), None);
        queue.get_next();
        queue.get_next();

        queue.clear();

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.now_playing(), Some(&track("B")));
        assert_eq!(titles(queue.history()), vec!["A"]);
    }

    #[test]
    fn voice_channel_is_only_overwritten_when_given() {
        let mut queue = GuildQueue::new();

        queue.add(track("A"), Some(ChannelId(1)));
        queue.add(track("B"), None);
        assert_eq!(queue.voice_channel(), Some(ChannelId(1)));

        queue.add(track("C"), Some(ChannelId(2)));
        assert_eq!(queue.voice_channel(), Some(ChannelId(2)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn registry_creates_one_queue_per_guild() {
        let mut registry = QueueRegistry::new();

        registry.get_or_create(GuildId(1)).queue.add(track("A"), None);
        registry.get_or_create(GuildId(1)).queue.add(track("B"), None);
        registry.get_or_create(GuildId(2));

        assert_eq!(registry.get(GuildId(1)).map(|server| server.queue.len()), Some(2));
        assert_eq!(registry.get(GuildId(2)).map(|server| server.queue.len()), Some(0));
        assert!(registry.get(GuildId(3)).is_none());

        let mut ids = registry.guild_ids();
        ids.sort();
        assert_eq!(ids, vec![GuildId(1), GuildId(2)]);
    }

    #[test]
    fn only_the_active_track_advances_the_queue() {
        let mut server = ServerData::new();
        let first = silent_track();
        let second = silent_track();
        server.track_handle = Some(second.clone());

        assert!(!server.end_track(&first));
        assert!(server.track_handle.is_some());

        assert!(server.end_track(&second));
        assert!(server.track_handle.is_none());
        assert!(!server.end_track(&second));
    }

    #[test]
    fn losing_voice_while_idle_keeps_the_queue() {
        let mut server = ServerData::new();
        server.queue.add(track("A"), None);
        server.queue.add(track("B"), None);

        assert!(server.voice_lost().is_none());
        assert_eq!(server.queue.len(), 2);
    }

    #[test]
    fn losing_voice_mid_track_clears_pending() {
        let mut server = ServerData::new();
        server.queue.add(track("A"), None);
        server.queue.add(track("B"), None);
        server.queue.get_next();
        server.track_handle = Some(silent_track());

        assert!(server.voice_lost().is_some());
        assert!(server.queue.is_empty());
        assert!(server.track_handle.is_none());
        assert_eq!(server.queue.now_playing(), Some(&track("A")));
    }
}
