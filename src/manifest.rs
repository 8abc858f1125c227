//! HLS playlist rewriting.
//!
//! Every media reference and every `URI="..."` attribute in a playlist is
//! resolved against the URL the playlist was actually served from and turned
//! into a `/proxy?url=...` link, so the player never talks to the origin
//! directly.

use url::Url;

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const PROXY_PATH: &str = "/proxy";

const URI_ATTRIBUTE: &str = "URI=\"";

/// Rewrite `playlist` so every reference points back at the proxy.
///
/// `base` must be the final (post-redirect) URL of the playlist.
pub fn rewrite_playlist(playlist: &str, base: &Url) -> String {
    let mut output = String::with_capacity(playlist.len() * 2);

    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            if line.contains(URI_ATTRIBUTE) {
                output.push_str(&rewrite_uri_attributes(line, base));
            } else {
                output.push_str(line);
            }
        } else {
            output.push_str(&proxy_url(trimmed, base));
        }
        output.push('\n');
    }

    output
}

/// Proxy link for a media reference. Nested playlists are left unflagged so
/// they come back through the rewriter instead of the segment relay.
fn proxy_url(reference: &str, base: &Url) -> String {
    let absolute = resolve(reference, base);
    if is_playlist(&absolute) {
        format!("{}?url={}", PROXY_PATH, urlencoding::encode(&absolute))
    } else {
        segment_proxy_url(&absolute)
    }
}

pub fn segment_proxy_url(absolute: &str) -> String {
    format!(
        "{}?url={}&segment=true",
        PROXY_PATH,
        urlencoding::encode(absolute)
    )
}

fn resolve(reference: &str, base: &Url) -> String {
    match base.join(reference) {
        Ok(url) => url.to_string(),
        Err(_) => reference.to_string(),
    }
}

fn is_playlist(absolute: &str) -> bool {
    Url::parse(absolute)
        .map(|u| u.path().to_ascii_lowercase().ends_with(".m3u8"))
        .unwrap_or(false)
}

fn rewrite_uri_attributes(line: &str, base: &Url) -> String {
    let mut result = String::with_capacity(line.len() * 2);
    let mut remaining = line;

    while let Some(start) = remaining.find(URI_ATTRIBUTE) {
        let value_start = start + URI_ATTRIBUTE.len();
        result.push_str(&remaining[..value_start]);
        remaining = &remaining[value_start..];

        match remaining.find('"') {
            Some(end) => {
                let uri = &remaining[..end];
                result.push_str(&segment_proxy_url(&resolve(uri, base)));
                result.push('"');
                remaining = &remaining[end + 1..];
            }
            None => {
                // Unterminated attribute: leave the rest untouched.
                result.push_str(remaining);
                remaining = "";
            }
        }
    }

    result.push_str(remaining);
    result
}
