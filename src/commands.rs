use std::sync::Arc;

use serenity::client::Context;
use serenity::framework::standard::macros::{command, group, hook};
use serenity::framework::standard::{Args, CommandError, CommandResult};
use serenity::model::channel::Message;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId};
use serenity::model::mention::Mentionable;
use songbird::Songbird;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::messages::{check_msg, error_message, help_text, queue_overview, QUEUE_COLOUR};
use crate::models::QueueRegistry;
use crate::player::{active_track, forget_track, playback_status, PlaybackStatus, PlayerHandle};
use crate::playlists::is_playlist;
use crate::ytdl::{lookup_track, playlist_tracks, Extractor};
use crate::{BotSettings, ExtractorKey, PlayerKey, ServersManager};

#[group]
#[commands(join, leave, play, pause, resume, previous, skip, queue, nowplaying, help)]
pub struct General;

#[hook]
pub async fn after(
    ctx: &Context,
    msg: &Message,
    command_name: &str,
    command_result: CommandResult,
) {
    if let Err(why) = command_result {
        warn!("Command '{command_name}' returned error {why:?}");
        check_msg(msg.channel_id.say(&ctx.http, error_message(&why.to_string())).await);
    }
}

#[command]
#[aliases("connect", "j")]
#[description = "Make the bot join your voice channel"]
#[only_in(guilds)]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let guild = get_guild(ctx, msg)?;

    let connect_to = match author_voice_channel(&guild, msg) {
        Some(channel) => channel,
        None => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "🚫 You need to be in a voice channel first!")
                    .await,
            );

            return Ok(());
        }
    };

    let manager = songbird_manager(ctx).await?;

    let current_channel = match manager.get(guild.id) {
        Some(handler_lock) => handler_lock.lock().await.current_channel(),
        None => None,
    };

    match current_channel {
        Some(current) if current == songbird::id::ChannelId::from(connect_to) => {
            check_msg(msg.channel_id.say(&ctx.http, "🤖 I'm already in your voice channel!").await);
        }
        Some(_) => {
            connect(&manager, guild.id, connect_to).await?;
            let text = format!("🚚 Moved to {}", connect_to.mention());
            check_msg(msg.channel_id.say(&ctx.http, text).await);
        }
        None => {
            connect(&manager, guild.id, connect_to).await?;
            let text = format!("🎶 Joined {}", connect_to.mention());
            check_msg(msg.channel_id.say(&ctx.http, text).await);

            registry(ctx).await?.lock().await.get_or_create(guild.id);
        }
    }

    Ok(())
}

#[command]
#[description = "Leave the voice channel"]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let manager = songbird_manager(ctx).await?;

    if manager.get(guild_id).is_none() {
        check_msg(msg.channel_id.say(&ctx.http, "I'm not in a voice channel!").await);

        return Ok(());
    }

    let registry = registry(ctx).await?;
    registry.lock().await.get_or_create(guild_id).queue.clear();

    if let Some(track_handle) = forget_track(&registry, guild_id).await {
        if let Err(why) = track_handle.stop() {
            info!("Stopping track on leave failed: {why:?}");
        }
    }

    if let Err(e) = manager.remove(guild_id).await {
        check_msg(msg.channel_id.say(&ctx.http, format!("Failed: {e:?}")).await);
    }

    check_msg(msg.channel_id.say(&ctx.http, "Left the voice channel.").await);

    Ok(())
}

#[command]
#[aliases("p")]
#[description = "Play a song or a playlist from a URL or a search query"]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let guild = get_guild(ctx, msg)?;
    let query = args.message().trim().to_string();

    info!("User input is {query}");

    let voice_channel = match author_voice_channel(&guild, msg) {
        Some(channel) => channel,
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "🔇 You need to be in a voice channel!").await);

            return Ok(());
        }
    };

    if query.is_empty() {
        let prefix = settings(ctx).await?.prefix;
        let usage = format!("Usage: `{prefix}play [URL|Title]`");
        check_msg(msg.channel_id.say(&ctx.http, usage).await);

        return Ok(());
    }

    let manager = songbird_manager(ctx).await?;
    let connected = match manager.get(guild.id) {
        Some(handler_lock) => handler_lock.lock().await.current_channel().is_some(),
        None => false,
    };

    if !connected {
        connect(&manager, guild.id, voice_channel).await?;
    }

    let typing = msg.channel_id.start_typing(&ctx.http);

    let result = if is_playlist(&query) {
        info!("Detected playlist in {query}");
        process_playlist(ctx, msg, guild.id, voice_channel, &query).await
    } else {
        process_single(ctx, msg, guild.id, voice_channel, &query).await
    };

    if let Ok(typing) = typing {
        typing.stop();
    }

    result
}

async fn process_single(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    voice_channel: ChannelId,
    query: &str,
) -> CommandResult {
    let extractor = extractor(ctx).await?;

    let track = match lookup_track(&extractor, query).await {
        Ok(track) => track,
        Err(why) => {
            info!("Could not load song for input {query}: {why}");
            check_msg(msg.channel_id.say(&ctx.http, "❌ Couldn't find that song").await);

            return Ok(());
        }
    };

    let title = track.title.clone();

    registry(ctx).await?.lock().await.get_or_create(guild_id).queue.add(track, Some(voice_channel));

    check_msg(msg.channel_id.say(&ctx.http, format!("🎵 Added to queue: **{title}**")).await);

    player(ctx).await?.start_if_idle(guild_id, msg.channel_id);

    Ok(())
}

async fn process_playlist(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    voice_channel: ChannelId,
    url: &str,
) -> CommandResult {
    let mut loading = msg.channel_id.say(&ctx.http, "⏳ Loading playlist...").await?;
    let extractor = extractor(ctx).await?;

    let songs = match playlist_tracks(&extractor, url).await {
        Ok(songs) => songs,
        Err(why) => {
            info!("Could not load playlist {url}: {why}");
            Vec::new()
        }
    };

    if songs.is_empty() {
        if let Err(why) = loading.edit(ctx, |m| m.content("❌ Couldn't load playlist")).await {
            info!("Error editing message: {why:?}");
        }

        return Ok(());
    }

    let added = songs.len();

    {
        let registry = registry(ctx).await?;
        let mut registry = registry.lock().await;
        let queue = &mut registry.get_or_create(guild_id).queue;

        for song in songs {
            queue.add(song, Some(voice_channel));
        }
    }

    player(ctx).await?.start_if_idle(guild_id, msg.channel_id);

    if let Err(why) = loading
        .edit(ctx, |m| m.content(format!("🎵 Added {added} songs from playlist to queue")))
        .await
    {
        info!("Error editing message: {why:?}");
    }

    Ok(())
}

#[command]
#[description = "Pause the current song"]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let registry = registry(ctx).await?;

    let track_handle = match active_track(&registry, guild_id).await {
        Some(track_handle) => track_handle,
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "⚠️ Nothing is currently playing!").await);

            return Ok(());
        }
    };

    match playback_status(&track_handle).await {
        PlaybackStatus::Playing => {
            track_handle.pause()?;
            check_msg(msg.channel_id.say(&ctx.http, "⏸️ Paused playback").await);
        }
        PlaybackStatus::Paused => {
            check_msg(msg.channel_id.say(&ctx.http, "⚠️ Already paused!").await);
        }
        PlaybackStatus::Idle => {
            check_msg(msg.channel_id.say(&ctx.http, "⚠️ Nothing is currently playing!").await);
        }
    }

    Ok(())
}

#[command]
#[aliases("continue")]
#[description = "Resume the paused song"]
#[only_in(guilds)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if songbird_manager(ctx).await?.get(guild_id).is_none() {
        check_msg(msg.channel_id.say(&ctx.http, "⚠️ Not connected to a voice channel!").await);

        return Ok(());
    }

    let registry = registry(ctx).await?;

    match active_track(&registry, guild_id).await {
        Some(track_handle) if playback_status(&track_handle).await == PlaybackStatus::Paused => {
            track_handle.play()?;
            check_msg(msg.channel_id.say(&ctx.http, "▶️ Resumed playback").await);
        }
        _ => {
            check_msg(msg.channel_id.say(&ctx.http, "⚠️ Playback is not paused!").await);
        }
    }

    Ok(())
}

#[command]
#[aliases("back", "last")]
#[description = "Replay the last played song"]
#[only_in(guilds)]
async fn previous(ctx: &Context, msg: &Message) -> CommandResult {
    let guild = get_guild(ctx, msg)?;

    if songbird_manager(ctx).await?.get(guild.id).is_none() {
        check_msg(msg.channel_id.say(&ctx.http, "❌ Not connected to voice channel!").await);

        return Ok(());
    }

    let author_channel = author_voice_channel(&guild, msg);

    let last_song = {
        let registry = registry(ctx).await?;
        let mut registry = registry.lock().await;
        let queue = &mut registry.get_or_create(guild.id).queue;

        let last_song = queue.last_played().cloned();
        if let Some(song) = &last_song {
            queue.add(song.clone(), author_channel);
        }

        last_song
    };

    match last_song {
        Some(song) => {
            player(ctx).await?.start_if_idle(guild.id, msg.channel_id);
            let text = format!("🔁 Replaying: **{}**", song.title);
            check_msg(msg.channel_id.say(&ctx.http, text).await);
        }
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "❌ No history available!").await);
        }
    }

    Ok(())
}

#[command]
#[description = "Skip the current song"]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let registry = registry(ctx).await?;

    match active_track(&registry, guild_id).await {
        Some(track_handle) if playback_status(&track_handle).await == PlaybackStatus::Playing => {
            info!("Skipping current song in guild {}", guild_id.0);
            // The end notifier starts the next song
            track_handle.stop()?;
            check_msg(msg.channel_id.say(&ctx.http, "⏭ Skipped current song.").await);
        }
        _ => {
            check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing!").await);
        }
    }

    Ok(())
}

#[command]
#[aliases("q", "playlist")]
#[description = "Display the current queue"]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let (overview, thumbnail, voice_channel) = {
        let registry = registry(ctx).await?;
        let mut registry = registry.lock().await;
        let queue = &registry.get_or_create(guild_id).queue;

        let thumbnail = queue.now_playing().and_then(|track| track.thumbnail.clone());

        (queue_overview(queue), thumbnail, queue.voice_channel())
    };

    let overview = match overview {
        Some(overview) => overview,
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "🎵 The queue is currently empty!").await);

            return Ok(());
        }
    };

    check_msg(
        msg.channel_id
            .send_message(&ctx.http, |m| {
                m.embed(|e| {
                    e.title("🎶 Music Queue").colour(QUEUE_COLOUR);

                    if let Some(channel) = voice_channel {
                        e.description(format!("Playing in {}", channel.mention()));
                    }

                    if let Some(now_playing) = &overview.now_playing {
                        e.field("▶️ Now Playing", now_playing, false);
                    }
                    if let Some((name, value)) = &overview.up_next {
                        e.field(name, value, false);
                    }
                    if let Some(thumbnail) = &thumbnail {
                        e.thumbnail(thumbnail);
                    }
                    if overview.recently_played > 0 {
                        let footer = format!("{} recently played", overview.recently_played);
                        e.footer(|f| f.text(footer));
                    }

                    e
                })
            })
            .await,
    );

    Ok(())
}

#[command]
#[aliases("np", "current")]
#[description = "Show the currently playing song"]
#[only_in(guilds)]
async fn nowplaying(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let registry = registry(ctx).await?;

    let is_active = match active_track(&registry, guild_id).await {
        Some(track_handle) => playback_status(&track_handle).await != PlaybackStatus::Idle,
        None => false,
    };

    if !is_active {
        check_msg(msg.channel_id.say(&ctx.http, "❌ Nothing is currently playing!").await);

        return Ok(());
    }

    let title = {
        let mut registry = registry.lock().await;
        registry.get_or_create(guild_id).queue.now_playing().map(|song| song.title.clone())
    };

    match title {
        Some(title) => {
            let text = format!("🎵 Now Playing: **{title}**");
            check_msg(msg.channel_id.say(&ctx.http, text).await);
        }
        None => check_msg(
            msg.channel_id
                .say(&ctx.http, "❌ No track information available!")
                .await,
        ),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let prefix = settings(ctx).await?.prefix;

    check_msg(msg.channel_id.say(&ctx.http, help_text(&prefix)).await);

    Ok(())
}

async fn connect(manager: &Songbird, guild_id: GuildId, channel_id: ChannelId) -> CommandResult {
    let (handler_lock, result) = manager.join(guild_id, channel_id).await;

    result.map_err(|why| CommandError::from(format!("Could not join voice channel: {why}")))?;

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        info!("Already deafen!")
    } else if let Err(e) = handler.deafen(true).await {
        info!("Deafen failed due to {e:?}")
    }

    Ok(())
}

fn author_voice_channel(guild: &Guild, msg: &Message) -> Option<ChannelId> {
    guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}

async fn songbird_manager(ctx: &Context) -> CommandResult<Arc<Songbird>> {
    songbird::get(ctx)
        .await
        .ok_or(CommandError::from("Songbird Voice client placed in at initialisation."))
}

async fn registry(ctx: &Context) -> CommandResult<Arc<Mutex<QueueRegistry>>> {
    let data = ctx.data.read().await;

    data.get::<ServersManager>().cloned().ok_or(CommandError::from("Queue registry not found"))
}

async fn player(ctx: &Context) -> CommandResult<PlayerHandle> {
    let data = ctx.data.read().await;

    data.get::<PlayerKey>().cloned().ok_or(CommandError::from("Player not found"))
}

async fn extractor(ctx: &Context) -> CommandResult<Arc<dyn Extractor>> {
    let data = ctx.data.read().await;

    data.get::<ExtractorKey>().cloned().ok_or(CommandError::from("Extractor not found"))
}

async fn settings(ctx: &Context) -> CommandResult<BotSettings> {
    let data = ctx.data.read().await;

    data.get::<BotSettings>().cloned().ok_or(CommandError::from("Settings not found"))
}
