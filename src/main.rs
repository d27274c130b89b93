use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::{
        gateway::{Activity, Ready},
        prelude::VoiceState,
    },
    prelude::{GatewayIntents, TypeMapKey},
};
use songbird::{SerenityInit, Songbird};
use tokio::sync::Mutex;
use tracing::{info, warn, Level};

use crate::commands::{after, GENERAL_GROUP};
use crate::config::Config;
use crate::models::{QueueRegistry, ServerData};
use crate::player::{spawn_idle_disconnect, Player, PlayerHandle};
use crate::ytdl::{Extractor, YtDlp};

mod audio;
mod commands;
mod config;
mod messages;
mod models;
mod player;
mod playlists;
mod ytdl;

struct Handler {
    prefix: String,
}

pub struct ServersManager;

impl TypeMapKey for ServersManager {
    type Value = Arc<Mutex<QueueRegistry>>;
}

pub struct PlayerKey;

impl TypeMapKey for PlayerKey {
    type Value = PlayerHandle;
}

pub struct ExtractorKey;

impl TypeMapKey for ExtractorKey {
    type Value = Arc<dyn Extractor>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl TypeMapKey for BotDataMap {
    type Value = BotData;
}

#[derive(Clone)]
pub struct BotSettings {
    pub prefix: String,
}

impl TypeMapKey for BotSettings {
    type Value = BotSettings;
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected! ({})", ready.user.name, ready.user.id.0);

        ctx.set_activity(Activity::listening(format!("{}help", self.prefix))).await;

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() {
            return;
        }

        let (bot_id, registry) = {
            let data = ctx.data.read().await;
            (
                data.get::<BotDataMap>().map(|data| data.id),
                data.get::<ServersManager>().cloned(),
            )
        };

        if let (Some(bot_id), Some(registry), Some(guild_id)) = (bot_id, registry, new.guild_id) {
            if bot_id != new.user_id.0 {
                return;
            }

            info!("Bot was disconnected from voice in guild {}", guild_id.0);

            let track_handle = registry
                .lock()
                .await
                .get_mut(guild_id)
                .and_then(ServerData::voice_lost);

            if let Some(track_handle) = track_handle {
                if let Err(error) = track_handle.stop() {
                    info!("{:#?}", error)
                }
            }
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let builder = tracing_subscriber::fmt().with_max_level(Level::DEBUG);

    match log_file.map(File::create) {
        Some(Ok(file)) => builder.with_ansi(false).with_writer(StdMutex::new(file)).init(),
        Some(Err(why)) => {
            builder.init();
            warn!("Could not open log file, logging to stdout: {why}");
        }
        None => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("Invalid configuration");

    init_logging(config.log_file.as_deref());

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.prefix.as_str()))
        .after(after)
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler { prefix: config.prefix.clone() })
        .framework(framework)
        .register_songbird_with(songbird.clone())
        .await
        .expect("Err creating client");

    let registry = Arc::new(Mutex::new(QueueRegistry::new()));
    let extractor: Arc<dyn Extractor> = Arc::new(YtDlp::new(config.ytdlp_path.clone()));

    let player = Player::spawn(
        registry.clone(),
        songbird.clone(),
        client.cache_and_http.http.clone(),
        extractor.clone(),
        config.ffmpeg_path.clone(),
    );

    spawn_idle_disconnect(registry.clone(), songbird);

    {
        let mut w = client.data.write().await;

        w.insert::<ServersManager>(registry);
        w.insert::<PlayerKey>(player);
        w.insert::<ExtractorKey>(extractor);
        w.insert::<BotSettings>(BotSettings { prefix: config.prefix.clone() });
    }

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| warn!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
}
