use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::thread;

use serenity::framework::standard::CommandError;
use songbird::input::{children_to_reader, Codec, Container, Input, Metadata};
use tracing::{debug, warn};

use crate::models::Track;

const SAMPLE_RATE: u32 = 48_000;

const BEFORE_OPTIONS: [&str; 9] = [
    "-reconnect",
    "1",
    "-reconnect_streamed",
    "1",
    "-reconnect_delay_max",
    "2",
    "-nostdin",
    "-loglevel",
    "error",
];

const FILTERS: &str = "volume=1.0,dynaudnorm=f=150:g=15,aresample=48000:async=1,atempo=1.0";

/// Arguments for an ffmpeg process decoding `url` into raw stereo f32 PCM on stdout.
pub fn ffmpeg_args(url: &str) -> Vec<&str> {
    let mut args: Vec<&str> = BEFORE_OPTIONS.to_vec();
    args.extend(["-i", url, "-vn", "-af", FILTERS]);
    args.extend([
        "-f",
        "f32le",
        "-ac",
        "2",
        "-ar",
        "48000",
        "-acodec",
        "pcm_f32le",
        "-",
    ]);
    args
}

/// Logs every line ffmpeg writes to stderr. Returns how many lines were logged.
fn log_errors(title: &str, stderr: impl BufRead) -> usize {
    let mut logged = 0;

    for line in stderr.lines().map_while(Result::ok) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        warn!("ffmpeg failed on {title}: {line}");
        logged += 1;
    }

    logged
}

pub fn ffmpeg_source(program: &str, url: &str, track: &Track) -> Result<Input, CommandError> {
    let mut child = Command::new(program)
        .args(ffmpeg_args(url))
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|why| CommandError::from(format!("{program} failed to start: {why}")))?;

    if let Some(stderr) = child.stderr.take() {
        let title = track.title.clone();

        thread::spawn(move || {
            let logged = log_errors(&title, BufReader::new(stderr));
            debug!("ffmpeg for {title} exited after {logged} error lines");
        });
    }

    let metadata = Metadata {
        title: Some(track.title.clone()),
        source_url: Some(track.url.clone()),
        thumbnail: track.thumbnail.clone(),
        channels: Some(2),
        sample_rate: Some(SAMPLE_RATE),
        ..Default::default()
    };

    Ok(Input::new(
        true,
        children_to_reader::<f32>(vec![child]),
        Codec::FloatPcm,
        Container::Raw,
        Some(metadata),
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reconnect_options_come_before_the_input() {
        let args = ffmpeg_args("https://cdn.example.com/stream");
        let input = args.iter().position(|arg| *arg == "-i").unwrap();

        assert_eq!(&args[..input], &BEFORE_OPTIONS);
        assert_eq!(args[input + 1], "https://cdn.example.com/stream");
    }

    #[test]
    fn output_is_normalised_stereo_pcm() {
        let args = ffmpeg_args("https://cdn.example.com/stream");

        assert!(args.windows(2).any(|pair| pair == ["-af", FILTERS]));
        assert!(args.windows(2).any(|pair| pair == ["-ar", "48000"]));
        assert!(args.windows(2).any(|pair| pair == ["-ac", "2"]));
        assert_eq!(args.last(), Some(&"-"));
    }

    #[test]
    fn quiet_by_default() {
        let args = ffmpeg_args("https://cdn.example.com/stream");

        assert!(args.windows(2).any(|pair| pair == ["-loglevel", "error"]));
    }

    #[test]
    fn every_error_line_is_logged() {
        let stderr = Cursor::new(
            "\nhttps://cdn.example.com/stream: Server returned 403 Forbidden\nConversion failed!\n",
        );

        assert_eq!(log_errors("Song", stderr), 2);
    }
}
