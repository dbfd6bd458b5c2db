//! Demo endpoints: a synthetic live origin, channel config, and decision
//! service, all served by this process.
//!
//! With `DEV_MODE=true` the default configuration points the config and
//! decision URLs back at these endpoints, so the full rewrite pipeline can
//! be exercised against `/demo/sports/v_800k.m3u8` with no external
//! dependencies. Integration tests lean on the same property.
//!
//! The demo origin emits a rolling live window with PDTs and one SCTE-35
//! DATERANGE cue per minute (8-second break at each minute boundary).

use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::info;

const SEGMENT_SECS: i64 = 4;
const WINDOW_SEGMENTS: i64 = 8;
const BREAK_DURATION: f64 = 8.0;

/// Synthetic live variant playlist with PDTs and SCTE-35 cues.
pub async fn serve_demo_playlist(Path(variant): Path<String>) -> Response {
    let playlist = build_live_window(Utc::now(), &variant);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        playlist,
    )
        .into_response()
}

/// Build the rolling window at `now`, deterministically.
///
/// Segment N covers `[N*4, N*4+4)` seconds of wall time. Any segment whose
/// PDT lands exactly on a minute boundary opens an 8-second ad break,
/// signalled by a DATERANGE cue ahead of its PDT.
pub fn build_live_window(now: DateTime<Utc>, variant: &str) -> String {
    let head_seq = now.timestamp() / SEGMENT_SECS;
    let first_seq = head_seq - WINDOW_SEGMENTS + 1;
    let variant_stem = variant.trim_end_matches(".m3u8");

    let mut out = String::new();
    out.push_str("#EXTM3U\n#EXT-X-VERSION:6\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{SEGMENT_SECS}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_seq}\n"));

    for seq in first_seq..=head_seq {
        let pdt = DateTime::from_timestamp(seq * SEGMENT_SECS, 0).expect("valid epoch");
        let iso = pdt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();

        if pdt.timestamp() % 60 == 0 {
            out.push_str(&format!(
                "#EXT-X-DATERANGE:ID=\"demo-{}\",START-DATE=\"{}\",DURATION={:.1},SCTE35-OUT=YES\n",
                pdt.timestamp() / 60,
                iso,
                BREAK_DURATION,
            ));
        }

        out.push_str(&format!("#EXT-X-PROGRAM-DATE-TIME:{iso}\n"));
        out.push_str(&format!("#EXTINF:{SEGMENT_SECS}.000,\n"));
        out.push_str(&format!("{variant_stem}_{seq}.ts\n"));
    }
    out
}

/// Demo channel configuration, org/channel slugs echoed back.
pub async fn serve_demo_config(
    Path((org, channel)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    info!("Serving demo channel config for {org}/{channel}");
    demo_config_json(&org, &channel, &state.config.base_url)
}

/// Demo channel configuration by id (`demo-<org>-<channel>`).
pub async fn serve_demo_config_by_id(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let mut parts = id.splitn(3, '-');
    let (Some("demo"), Some(org), Some(channel)) = (parts.next(), parts.next(), parts.next())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    demo_config_json(org, channel, &state.config.base_url)
}

fn demo_config_json(org: &str, channel: &str, base_url: &str) -> Response {
    Json(serde_json::json!({
        "id": format!("demo-{org}-{channel}"),
        "org_id": org,
        "slug": channel,
        "origin_url": format!("{base_url}/demo"),
        "ad_pod_base_url": "https://ads.demo.localhost/pods",
        "sign_host": "ads.demo.localhost",
        "scte35": {"enabled": true, "auto_insert": false},
        "vast": {"enabled": false},
        "default_ad_duration": 8.0,
        "slate_id": "demo-slate",
        "mode": "ssai",
        "status": "active",
        "bitrate_ladder": [800, 1600, 2500],
        "segment_cache_ttl": 4,
        "manifest_cache_ttl": 2
    }))
    .into_response()
}

/// Demo decision service: a fixed two-ad pod across the demo ladder.
pub async fn serve_demo_decision(
    Json(request): Json<serde_json::Value>,
) -> Response {
    let duration = request
        .get("duration_sec")
        .and_then(|d| d.as_f64())
        .unwrap_or(BREAK_DURATION);
    info!("Serving demo decision for a {duration}s break");

    let mut items = Vec::new();
    for ad in ["ad_1", "ad_2"] {
        for kbps in [800u64, 1600, 2500] {
            items.push(serde_json::json!({
                "ad_id": ad,
                "bitrate_bps": kbps * 1000,
                "playlist_url": format!("/pods/demo/{ad}_{kbps}k.m4s"),
                "duration_sec": duration / 2.0,
            }));
        }
    }

    Json(serde_json::json!({
        "pod_id": "demo-pod",
        "duration_sec": duration,
        "items": items,
        "tracking": {
            "impressions": ["https://trk.demo.localhost/imp"],
            "quartiles": {
                "start": [],
                "firstQuartile": ["https://trk.demo.localhost/q1"],
                "midpoint": ["https://trk.demo.localhost/mid"],
                "thirdQuartile": ["https://trk.demo.localhost/q3"],
                "complete": ["https://trk.demo.localhost/complete"]
            },
            "clicks": [],
            "errors": []
        }
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_window_shape() {
        // 12:00:10 → head segment covers 12:00:08; window reaches back 32 s
        let now = DateTime::parse_from_rfc3339("2025-10-31T12:00:10.000Z")
            .unwrap()
            .to_utc();
        let playlist = build_live_window(now, "v_800k.m3u8");

        assert!(playlist.starts_with("#EXTM3U"));
        assert_eq!(playlist.matches("#EXTINF:").count(), 8);
        assert_eq!(playlist.matches("#EXT-X-PROGRAM-DATE-TIME:").count(), 8);
        assert!(playlist.contains("v_800k_"));
        assert!(!playlist.contains("ENDLIST"), "live window must stay open");
    }

    #[test]
    fn minute_boundary_carries_cue() {
        let now = DateTime::parse_from_rfc3339("2025-10-31T12:00:10.000Z")
            .unwrap()
            .to_utc();
        let playlist = build_live_window(now, "v_800k.m3u8");

        // The 12:00:00 segment is inside the window
        assert!(playlist.contains("START-DATE=\"2025-10-31T12:00:00.000Z\""));
        assert!(playlist.contains("SCTE35-OUT=YES"));

        // Mid-minute window carries no cue
        let now = DateTime::parse_from_rfc3339("2025-10-31T12:00:50.000Z")
            .unwrap()
            .to_utc();
        let playlist = build_live_window(now, "v_800k.m3u8");
        assert!(!playlist.contains("EXT-X-DATERANGE"));
    }

    #[test]
    fn window_is_deterministic() {
        let now = DateTime::parse_from_rfc3339("2025-10-31T12:00:10.000Z")
            .unwrap()
            .to_utc();
        assert_eq!(
            build_live_window(now, "v_800k.m3u8"),
            build_live_window(now, "v_800k.m3u8")
        );
    }
}
