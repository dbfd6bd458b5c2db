//! Playlist ingress: the master and variant rewrite endpoints.

use crate::{
    auth::Claims,
    channel::{ChannelConfig, ChannelStatus, InsertionMode},
    decision::Viewer,
    error::{MidrollError, Result},
    hls::parser,
    metrics,
    rewrite::{RewriteOutcome, RewriteRequest},
    server::state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Serve the master playlist: origin variants re-pointed at this proxy.
pub async fn serve_master(
    Path((org, channel)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let channel_config = authorise(&state, &headers, &org, &channel).await?.0;

    let origin_url = origin_variant_url(&channel_config, "master");
    let master_text = fetch_origin(&state, &origin_url).await.inspect_err(|_| {
        metrics::record_request("master", 502);
        metrics::record_duration("master", start);
    })?;

    let session_suffix = params
        .get("session")
        .map(|s| format!("?session={s}"))
        .unwrap_or_default();
    let base = state.config.base_url.trim_end_matches('/').to_string();
    let rewritten = parser::rewrite_master_uris(&master_text, |uri| {
        // Variants are re-addressed by filename under this proxy's namespace
        let file = uri.rsplit('/').next().unwrap_or(uri);
        format!("{base}/{org}/{channel}/{file}{session_suffix}")
    })?;

    metrics::record_request("master", 200);
    metrics::record_duration("master", start);
    Ok(playlist_response(rewritten, channel_config.manifest_cache_ttl))
}

/// Serve a variant playlist through the rewrite pipeline.
pub async fn serve_variant(
    Path((org, channel, variant_file)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();

    let Some(variant) = variant_file.strip_suffix(".m3u8") else {
        return Err(MidrollError::InvalidInput(format!(
            "expected an .m3u8 variant, got '{variant_file}'"
        )));
    };

    let (channel_config, claims) = authorise(&state, &headers, &org, &channel).await?;

    let origin_url = origin_variant_url(&channel_config, variant);
    let origin_text = fetch_origin(&state, &origin_url).await.inspect_err(|_| {
        metrics::record_request("variant", 502);
        metrics::record_duration("variant", start);
    })?;

    // Paused channels proxy untouched; ads stay off until resumed
    if channel_config.status == ChannelStatus::Paused {
        metrics::record_request("variant", 200);
        metrics::record_duration("variant", start);
        return Ok(playlist_response(
            origin_text,
            channel_config.manifest_cache_ttl,
        ));
    }

    let force_mode = match params.get("force").map(|s| s.as_str()) {
        Some("csi") => Some(InsertionMode::Csi),
        Some("ssai") => Some(InsertionMode::Ssai),
        Some(other) => {
            warn!("Unknown force mode '{other}' ignored");
            None
        }
        None => None,
    };

    let viewer = Viewer {
        geo: claims.as_ref().and_then(|c| c.geo.clone()),
        consent: None,
        bucket: claims.as_ref().and_then(|c| c.bucket.clone()),
    };

    let request = RewriteRequest {
        channel: &channel_config,
        variant,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
        force_mode,
        viewer,
        session: params.get("session").map(|s| s.as_str()),
        now: Utc::now(),
    };

    // The overall deadline bounds the whole pipeline; blowing it degrades
    // to the legacy discontinuity marker rather than stalling the player
    let result = match tokio::time::timeout(
        state.config.rewrite_deadline,
        state.rewriter.rewrite(&request, &origin_text),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Rewrite deadline ({:?}) exceeded for {}/{}/{}; legacy fallback",
                state.config.rewrite_deadline, org, channel, variant
            );
            let mut playlist = parser::parse_media(&origin_text);
            playlist.insert_discontinuity();
            metrics::record_rewrite("none", "deadline");
            metrics::record_request("variant", 200);
            metrics::record_duration("variant", start);
            return Ok(playlist_response(
                playlist.render(),
                channel_config.manifest_cache_ttl,
            ));
        }
    };

    match &result.outcome {
        RewriteOutcome::Rewritten { mode } => {
            metrics::record_rewrite(mode, "ok");
            info!("Rewrote {}/{}/{} in {} mode", org, channel, variant, mode);
        }
        RewriteOutcome::Passthrough { reason } => {
            metrics::record_rewrite("none", reason);
        }
        RewriteOutcome::Fallback { reason } => {
            metrics::record_rewrite("none", reason);
            warn!(
                "Fallback rewrite for {}/{}/{}: {}",
                org, channel, variant, reason
            );
        }
    }

    metrics::record_request("variant", 200);
    metrics::record_duration("variant", start);
    Ok(playlist_response(
        result.body,
        channel_config.manifest_cache_ttl,
    ))
}

/// Validate the bearer token (when auth is configured) and load the channel.
async fn authorise(
    state: &AppState,
    headers: &HeaderMap,
    org: &str,
    channel: &str,
) -> Result<(Arc<ChannelConfig>, Option<Claims>)> {
    let claims = match &state.jwt {
        Some(validator) => {
            let token = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| MidrollError::AuthFailure("missing_token".to_string()))?;
            Some(validator.validate(token)?)
        }
        None => None,
    };

    let channel_config = state
        .channels
        .get_by_slugs(org, channel)
        .await?
        .ok_or_else(|| MidrollError::ChannelNotFound(format!("{org}/{channel}")))?;

    if channel_config.status == ChannelStatus::Archived {
        return Err(MidrollError::ChannelNotFound(format!("{org}/{channel}")));
    }

    Ok((channel_config, claims))
}

fn origin_variant_url(channel: &ChannelConfig, variant: &str) -> String {
    format!(
        "{}/{}.m3u8",
        channel.origin_url.trim_end_matches('/'),
        variant
    )
}

async fn fetch_origin(state: &AppState, url: &str) -> Result<String> {
    let response = state
        .http_client
        .get(url)
        .timeout(state.config.origin_timeout)
        .send()
        .await
        .map_err(|e| {
            metrics::record_origin_error();
            MidrollError::OriginUnavailable(e)
        })?;

    if !response.status().is_success() {
        metrics::record_origin_error();
        return Err(MidrollError::OriginStatus(response.status().as_u16()));
    }

    Ok(response.text().await?)
}

fn playlist_response(body: String, manifest_cache_ttl: u64) -> Response {
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.apple.mpegurl".to_string(),
            ),
            (
                header::CACHE_CONTROL,
                format!("max-age={manifest_cache_ttl}"),
            ),
        ],
        body,
    )
        .into_response()
}
