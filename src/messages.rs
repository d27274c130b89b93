use serenity::model::channel::Message;
use serenity::Result as SerenityResult;
use tracing::info;

use crate::models::GuildQueue;

pub const QUEUE_COLOUR: u32 = 0x1DB954;

const NOW_PLAYING_TITLE_LIMIT: usize = 256;
const UP_NEXT_SHOWN: usize = 15;
const UP_NEXT_TITLE_LIMIT: usize = 64;
// Discord rejects embed field values longer than this.
const FIELD_VALUE_LIMIT: usize = 1024;
const TRAILER_RESERVE: usize = 32;
const ERROR_LIMIT: usize = 200;

#[derive(Debug, PartialEq, Eq)]
pub struct QueueOverview {
    pub now_playing: Option<String>,
    pub up_next: Option<(String, String)>,
    pub recently_played: usize,
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// The fields of the queue embed, or `None` when there is nothing to show.
pub fn queue_overview(queue: &GuildQueue) -> Option<QueueOverview> {
    if queue.now_playing().is_none() && queue.is_empty() {
        return None;
    }

    let now_playing = queue
        .now_playing()
        .map(|track| truncate(&track.title, NOW_PLAYING_TITLE_LIMIT));

    let up_next = if queue.is_empty() {
        None
    } else {
        let total = queue.len();
        let mut lines = Vec::with_capacity(UP_NEXT_SHOWN);
        let mut used = 0;

        for (index, track) in queue.pending().take(UP_NEXT_SHOWN).enumerate() {
            let line = format!("`{}.` {}", index + 1, truncate(&track.title, UP_NEXT_TITLE_LIMIT));
            let length = line.chars().count() + 1;

            if used + length > FIELD_VALUE_LIMIT - TRAILER_RESERVE {
                break;
            }

            used += length;
            lines.push(line);
        }

        let remaining = total - lines.len();
        if remaining > 0 {
            lines.push(format!("...and {remaining} more songs"));
        }

        Some((format!("🔜 Up Next ({total} total)"), lines.join("\n")))
    };

    Some(QueueOverview {
        now_playing,
        up_next,
        recently_played: queue.history().count(),
    })
}

/// Checks that a message successfully sent; if not, then logs why.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

pub fn error_message(error: &str) -> String {
    format!("❌ Error: {}", truncate(error, ERROR_LIMIT))
}

pub fn help_text(prefix: &str) -> String {
    format!(
        r#"**Commands:**
    **{prefix}join** (`connect`, `j`) - Joins your voice channel.
    **{prefix}leave** - Leaves the voice channel and clears the queue.
    **{prefix}play [URL|Title]** (`p`) - Plays (or adds to the queue) a track or a whole playlist.
    **{prefix}pause** - Pauses the current track.
    **{prefix}resume** (`continue`) - Resumes the paused track.
    **{prefix}skip** - Skips the current track.
    **{prefix}previous** (`back`, `last`) - Queues the last played track again.
    **{prefix}queue** (`q`, `playlist`) - Shows the queue.
    **{prefix}nowplaying** (`np`, `current`) - Shows the current track.
    "#
    )
}
