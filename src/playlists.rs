use serde::Deserialize;
use tracing::{debug, info};

use crate::models::Track;

const PLAYLIST_MARKERS: [&str; 3] = ["list=", "playlist", "&index="];

const UNKNOWN_ENTRY_TITLE: &str = "Unknown";

/// One line of `yt-dlp -j --flat-playlist`.
#[derive(Deserialize)]
pub struct PlaylistSong {
    pub title: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub thumbnails: Option<Vec<Thumbnail>>,
}

#[derive(Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

pub fn is_playlist(query: &str) -> bool {
    PLAYLIST_MARKERS.iter().any(|marker| query.contains(marker))
}

/// Turns flat playlist output into tracks. Entries without a URL point back at the playlist.
pub fn parse_playlist(output: &str, playlist_url: &str) -> Vec<Track> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let songs = lines
        .iter()
        .filter_map(|line| {
            let song: PlaylistSong = serde_json::from_str(line).ok()?;

            let url = song.url.or(song.webpage_url).unwrap_or_else(|| playlist_url.to_string());
            let title = song.title.unwrap_or_else(|| UNKNOWN_ENTRY_TITLE.to_string());
            let thumbnail = song
                .thumbnails
                .and_then(|thumbnails| thumbnails.into_iter().last())
                .map(|thumbnail| thumbnail.url);

            Some(Track::new(Some(title), Some(url), thumbnail))
        })
        .collect::<Vec<Track>>();

    if songs.len() < lines.len() {
        let skipped = lines.len() - songs.len();
        info!("{skipped} playlist entries skipped due to errors during parsing");
    }

    debug!("Parsed {} songs from playlist {playlist_url}", songs.len());

    songs
}
