use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serenity::framework::standard::CommandError;
use tokio::task;
use tracing::{debug, warn};

use crate::models::Track;
use crate::playlists::parse_playlist;

pub const BEST_AUDIO: &str = "bestaudio/best";
pub const WORST_AUDIO: &str = "worstaudio/worst";

pub const MAX_ATTEMPTS: usize = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

const SOCKET_TIMEOUT: &str = "3";
const PLAYLIST_END: &str = "50";

/// The subset of a yt-dlp info dict the bot reads.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub entries: Option<Vec<Option<VideoInfo>>>,
}

impl VideoInfo {
    /// Search results and playlists wrap the video we want in `entries`.
    pub fn into_first_entry(self) -> Option<VideoInfo> {
        match self.entries {
            Some(entries) => entries.into_iter().flatten().next(),
            None => Some(self),
        }
    }

    pub fn into_track(self) -> Track {
        let url = self.webpage_url.or(self.url);

        Track::new(self.title, url, self.thumbnail)
    }
}

/// Blocking access to the media extraction tool.
pub trait Extractor: Send + Sync {
    fn video_info(&self, target: &str, format: &str) -> Result<Option<VideoInfo>, CommandError>;

    fn playlist(&self, url: &str) -> Result<Vec<Track>, CommandError>;
}

pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|why| CommandError::from(format!("{} failed to start: {why}", self.program)))?;

        let result = String::from_utf8(output.stdout)
            .map_err(|_| CommandError::from("Error reading stdout"))?;

        if !output.status.success() && result.trim().is_empty() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError::from(error.trim().to_string()));
        }

        Ok(result)
    }
}

impl Extractor for YtDlp {
    fn video_info(&self, target: &str, format: &str) -> Result<Option<VideoInfo>, CommandError> {
        let result = self.run(&[
            "-j",
            "-f",
            format,
            "--no-playlist",
            "--default-search",
            "auto",
            "--socket-timeout",
            SOCKET_TIMEOUT,
            "--no-warnings",
            "--no-check-certificates",
            "--geo-bypass",
            "--",
            target,
        ])?;

        Ok(parse_video_info(&result))
    }

    fn playlist(&self, url: &str) -> Result<Vec<Track>, CommandError> {
        debug!("Getting songs from playlist {url}");

        let result = self.run(&[
            "-j",
            "--flat-playlist",
            "--playlist-end",
            PLAYLIST_END,
            "--socket-timeout",
            SOCKET_TIMEOUT,
            "--",
            url,
        ])?;

        Ok(parse_playlist(&result, url))
    }
}

/// yt-dlp prints one JSON document per line; the first one describes the match.
pub fn parse_video_info(output: &str) -> Option<VideoInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| serde_json::from_str::<VideoInfo>(line).ok())
}

async fn run_blocking<T, F>(extractor: &Arc<dyn Extractor>, job: F) -> Result<T, CommandError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Extractor) -> Result<T, CommandError> + Send + 'static,
{
    let extractor = extractor.clone();

    task::spawn_blocking(move || job(extractor.as_ref()))
        .await
        .map_err(|why| CommandError::from(format!("Extraction task failed: {why}")))?
}

/// Extracts `target`, retrying failed attempts after a short pause.
///
/// A result without a stream URL retries right away with a lower quality format.
pub async fn resolve(
    extractor: &Arc<dyn Extractor>,
    target: &str,
) -> Result<VideoInfo, CommandError> {
    let mut format = BEST_AUDIO;
    let mut last_error = format!("Nothing found for {target}");

    for attempt in 1..=MAX_ATTEMPTS {
        let query = target.to_string();
        let requested = format;

        match run_blocking(extractor, move |ytdl| ytdl.video_info(&query, requested)).await {
            Ok(Some(info)) => match info.into_first_entry() {
                Some(info) if info.url.is_some() => return Ok(info),
                _ => {
                    debug!("No stream for {target} with {format}, falling back to {WORST_AUDIO}");
                    format = WORST_AUDIO;
                    last_error = format!("No playable stream for {target}");
                }
            },
            Ok(None) => {
                debug!("Extraction attempt {attempt} returned nothing for {target}");
            }
            Err(why) => {
                warn!("Extraction attempt {attempt}/{MAX_ATTEMPTS} for {target} failed: {why}");
                last_error = why.to_string();

                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    Err(CommandError::from(last_error))
}

pub async fn lookup_track(
    extractor: &Arc<dyn Extractor>,
    query: &str,
) -> Result<Track, CommandError> {
    resolve(extractor, query).await.map(VideoInfo::into_track)
}

/// Resolves a queued track to a URL the audio transport can open.
pub async fn stream_url(
    extractor: &Arc<dyn Extractor>,
    track: &Track,
) -> Result<String, CommandError> {
    let info = resolve(extractor, &track.url).await?;

    info.url.ok_or_else(|| CommandError::from(format!("No playable stream for {}", track.title)))
}

pub async fn playlist_tracks(
    extractor: &Arc<dyn Extractor>,
    url: &str,
) -> Result<Vec<Track>, CommandError> {
    let url = url.to_string();

    run_blocking(extractor, move |ytdl| ytdl.playlist(&url)).await
}
