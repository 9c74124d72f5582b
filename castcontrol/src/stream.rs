//! Reading and rewriting the host's stream URLs.
//!
//! A stream URL carries the whole playback plan in its query string:
//! whether the file goes out untouched (`Static=true`) or transcoded,
//! which streams were selected, and where the transcode starts. The
//! session engine needs to read those fields back from URLs a renderer
//! reports, and to rewrite the start position when a seek forces a new
//! transcode.

use url::Url;
use uuid::Uuid;

/// Query parameters of a stream URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub live_stream_id: Option<String>,
    /// `Static=true` means direct stream: seeks run on the renderer.
    pub is_direct_stream: bool,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub start_position_ticks: i64,
}

impl StreamParams {
    /// Parse the recognised query keys from a stream URL.
    pub fn from_url(raw: &str) -> Option<StreamParams> {
        let url = Url::parse(raw).ok()?;
        let mut params = StreamParams {
            item_id: item_id_from_url(raw),
            ..Default::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "MediaSourceId" => params.media_source_id = Some(value.into_owned()),
                "LiveStreamId" => params.live_stream_id = Some(value.into_owned()),
                "Static" => params.is_direct_stream = value.eq_ignore_ascii_case("true"),
                "AudioStreamIndex" => params.audio_stream_index = value.parse().ok(),
                "SubtitleStreamIndex" => params.subtitle_stream_index = value.parse().ok(),
                "StartTimeTicks" | "StartPositionTicks" => {
                    params.start_position_ticks = value.parse().unwrap_or(0);
                }
                _ => {}
            }
        }
        Some(params)
    }
}

/// Extract the item GUID from a `/Items/{id}/...` style path.
pub fn item_id_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let segments: Vec<&str> = url.path_segments()?.collect();
    for window in segments.windows(2) {
        if window[0].eq_ignore_ascii_case("items") {
            if let Ok(parsed) = Uuid::parse_str(window[1]) {
                return Some(parsed.as_simple().to_string());
            }
        }
    }
    None
}

/// Remove any `StartTimeTicks=NNN` from a URL, for "same item" comparison:
/// two URLs that differ only in start position address the same stream.
pub fn strip_start_ticks(raw: &str) -> String {
    rewrite_query(raw, "StartTimeTicks", None)
}

/// Return `raw` with `StartTimeTicks` set to `ticks`.
pub fn with_start_ticks(raw: &str, ticks: i64) -> String {
    rewrite_query(raw, "StartTimeTicks", Some(ticks.to_string()))
}

fn rewrite_query(raw: &str, key: &str, replacement: Option<String>) -> String {
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut rewritten = url.clone();
    rewritten.set_query(None);
    {
        let mut qp = rewritten.query_pairs_mut();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
        if let Some(value) = &replacement {
            qp.append_pair(key, value);
        }
    }
    if rewritten.query() == Some("") {
        rewritten.set_query(None);
    }
    rewritten.to_string()
}

/// How a seek must be carried out for the currently loaded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStrategy {
    /// Direct stream: ask the renderer to seek (`AVTransport#Seek`).
    OnRenderer,
    /// Transcoded stream: rebuild the URL at the new start position and
    /// replace the transport URI.
    RebuildStream,
}

/// Decide the seek strategy from the currently playing URL.
///
/// Only URLs that are recognisably server stream URLs (they name an item
/// or a media source) and are not direct streams force a rebuild; for
/// anything else the renderer seek is the only option left.
pub fn seek_strategy(current_url: &str) -> SeekStrategy {
    match StreamParams::from_url(current_url) {
        Some(params)
            if !params.is_direct_stream
                && (params.item_id.is_some() || params.media_source_id.is_some()) =>
        {
            SeekStrategy::RebuildStream
        }
        _ => SeekStrategy::OnRenderer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCODE_URL: &str = "http://server:8096/Videos/Items/7c3ab1fe-07e0-4a83-aa66-db4a2cbbf9a4/stream.ts?MediaSourceId=abc123&Static=false&AudioStreamIndex=1&SubtitleStreamIndex=3&StartTimeTicks=0&dlna=true";
    const DIRECT_URL: &str = "http://server:8096/Items/7c3ab1fe07e04a83aa66db4a2cbbf9a4/Download?Static=true&MediaSourceId=abc123";

    #[test]
    fn params_round_trip_from_transcode_url() {
        let params = StreamParams::from_url(TRANSCODE_URL).unwrap();
        assert_eq!(params.media_source_id.as_deref(), Some("abc123"));
        assert!(!params.is_direct_stream);
        assert_eq!(params.audio_stream_index, Some(1));
        assert_eq!(params.subtitle_stream_index, Some(3));
        assert_eq!(params.start_position_ticks, 0);
        assert_eq!(
            params.item_id.as_deref(),
            Some("7c3ab1fe07e04a83aa66db4a2cbbf9a4")
        );
    }

    #[test]
    fn static_true_means_direct_stream() {
        let params = StreamParams::from_url(DIRECT_URL).unwrap();
        assert!(params.is_direct_stream);
    }

    #[test]
    fn item_id_accepts_both_guid_spellings() {
        assert_eq!(
            item_id_from_url(TRANSCODE_URL).as_deref(),
            Some("7c3ab1fe07e04a83aa66db4a2cbbf9a4")
        );
        assert_eq!(
            item_id_from_url(DIRECT_URL).as_deref(),
            Some("7c3ab1fe07e04a83aa66db4a2cbbf9a4")
        );
        assert_eq!(item_id_from_url("http://server/NoItems/here"), None);
    }

    #[test]
    fn strip_start_ticks_ignores_position_only_differences() {
        let a = with_start_ticks(TRANSCODE_URL, 5_000_000_000);
        assert!(a.contains("StartTimeTicks=5000000000"));
        assert_eq!(strip_start_ticks(&a), strip_start_ticks(TRANSCODE_URL));
        assert_ne!(a, TRANSCODE_URL);
    }

    #[test]
    fn rewriting_preserves_other_params() {
        let rewritten = with_start_ticks(TRANSCODE_URL, 123);
        let params = StreamParams::from_url(&rewritten).unwrap();
        assert_eq!(params.start_position_ticks, 123);
        assert_eq!(params.audio_stream_index, Some(1));
        assert_eq!(params.media_source_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn seek_strategy_follows_static_flag() {
        assert_eq!(seek_strategy(TRANSCODE_URL), SeekStrategy::RebuildStream);
        assert_eq!(seek_strategy(DIRECT_URL), SeekStrategy::OnRenderer);
        assert_eq!(
            seek_strategy("http://radio.example/live.mp3"),
            SeekStrategy::OnRenderer
        );
    }
}
