//! Rewriter orchestration: one manifest request in, one rewritten (or
//! deliberately untouched) manifest out.
//!
//! Per break the pipeline is: detect the signal (text layer first, binary
//! enrichment second), pin the decision in the break-state store so every
//! concurrent variant request rewrites identically, compute the skip plan
//! with the pinned count, then hand off to the CSI or SSAI writer. Every
//! failure degrades locally — slate, then a legacy discontinuity, then the
//! origin playlist verbatim — and never surfaces to the player as a 5xx.

pub mod csi;
pub mod ssai;

use crate::adbreak::skip::{SkipPlan, SkipTarget, compute_skip_plan};
use crate::adbreak::store::{AdBreakState, BreakStateStore};
use crate::beacon::{self, HttpBeaconSink, QuartileTracker};
use crate::channel::{ChannelConfig, InsertionMode};
use crate::decision::{DecisionClient, Pod, Viewer};
use crate::hls::daterange::{Scte35Signal, parse_attribute_list, signal_from_daterange};
use crate::hls::parser::{Line, MediaPlaylist, format_pdt, parse_media, parse_pdt};
use crate::metrics;
use crate::scte35::{self, SpliceInfoSection};
use crate::signing::UrlSigner;
use crate::timing::TimingRegistry;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use url::Url;

/// How a rewrite ended, for logs and metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteOutcome {
    /// A break was written in the named mode
    Rewritten { mode: &'static str },
    /// Origin returned verbatim
    Passthrough { reason: &'static str },
    /// Legacy discontinuity fallback
    Fallback { reason: &'static str },
}

#[derive(Debug)]
pub struct RewriteResult {
    pub body: String,
    pub outcome: RewriteOutcome,
}

/// Per-request rewrite inputs.
pub struct RewriteRequest<'a> {
    pub channel: &'a ChannelConfig,
    pub variant: &'a str,
    pub user_agent: Option<&'a str>,
    /// `force=csi|ssai` override; honoured in dev only
    pub force_mode: Option<InsertionMode>,
    pub viewer: Viewer,
    pub session: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// A splice signal located in the playlist, with optional binary enrichment.
#[derive(Debug)]
pub struct SignalAtLine {
    pub line_index: usize,
    pub signal: Scte35Signal,
    pub section: Option<SpliceInfoSection>,
}

/// Long-lived rewrite dependencies, shared across requests.
#[derive(Clone)]
pub struct Rewriter {
    pub store: BreakStateStore,
    pub decisions: DecisionClient,
    pub signer: UrlSigner,
    pub beacons: HttpBeaconSink,
    pub quartiles: QuartileTracker,
    pub timing: TimingRegistry,
    pub sign_ttl_secs: u64,
    /// Used when a channel names no sign host of its own
    pub default_sign_host: String,
    pub is_dev: bool,
}

impl Rewriter {
    /// Rewrite one variant playlist.
    pub async fn rewrite(&self, req: &RewriteRequest<'_>, origin_text: &str) -> RewriteResult {
        let playlist = parse_media(origin_text);

        // A discontinuity invalidates the PTS↔PDT calibration
        if playlist
            .lines
            .iter()
            .any(|l| matches!(l, Line::Discontinuity))
        {
            let timing = self.timing.channel(&req.channel.id);
            timing.lock().await.mapper.reset();
        }

        // Channels with SCTE-35 handling off proxy untouched
        if !req.channel.scte35.enabled {
            return passthrough(origin_text, "scte35_disabled");
        }

        let signals = extract_signals(&playlist);
        let start_signal = signals.iter().find(|s| s.signal.is_ad_break_start());
        let active = self.store.find_active(&req.channel.id, req.now).await;

        let break_info = match BreakInfo::from_sources(req, start_signal, active.as_ref())
            .or_else(|| scheduled_break(req))
        {
            Some(info) => info,
            None => return passthrough(origin_text, "no_break"),
        };

        let Some(marker) = find_marker(&playlist, &break_info.start_pdt) else {
            warn!(
                "Break {} on channel {}: no usable PDT marker, returning origin",
                break_info.event_id, req.channel.id
            );
            metrics::record_skip_plan_failure("marker_not_found");
            return passthrough(origin_text, "marker_not_found");
        };

        let mode = self.select_mode(req);

        // Resolve the pod; the client degrades to slate internally
        let (fingerprint, mut pod) = self
            .decisions
            .decide(req.channel, break_info.duration_sec, &req.viewer, req.session)
            .await;

        if pod.is_empty() {
            // Slate failure: last-resort legacy discontinuity
            warn!(
                "No pod and no slate for break {} on channel {}; legacy fallback",
                break_info.event_id, req.channel.id
            );
            return self.legacy_fallback(playlist, "empty_pod");
        }

        // Pin the first observer's plan so every request rewrites identically
        let candidate_plan = compute_skip_plan(
            &playlist,
            marker,
            SkipTarget::Duration(break_info.duration_sec),
            None,
        );

        let state = self
            .store
            .pin(&req.channel.id, &break_info.event_id, || {
                let (skip_count, resume_pdt) = match &candidate_plan {
                    Ok(plan) => (plan.segments_skipped, Some(plan.resume_pdt.clone())),
                    Err(_) => (0, None),
                };
                AdBreakState {
                    event_id: break_info.event_id.clone(),
                    start_pdt: break_info.start_pdt.clone(),
                    end_pdt: break_info.end_pdt(),
                    duration_sec: break_info.duration_sec,
                    pinned_skip_count: skip_count,
                    pinned_pod_fingerprint: fingerprint.clone(),
                    pinned_resume_pdt: resume_pdt,
                }
            })
            .await;

        // A concurrent request may have pinned a different fingerprint first
        if state.pinned_pod_fingerprint != fingerprint
            && let Some(pinned_pod) = self.decisions.resolved_pod(&state.pinned_pod_fingerprint)
        {
            debug!(
                "Using pinned pod {} for break {}",
                pinned_pod.pod_id, state.event_id
            );
            pod = pinned_pod;
        }

        let result = match mode {
            InsertionMode::Csi => {
                self.rewrite_csi(req, playlist, marker, &state, &pod, start_signal, origin_text)
            }
            InsertionMode::Ssai | InsertionMode::Auto => {
                self.rewrite_ssai(req, playlist, marker, &state, &pod, start_signal, origin_text)
                    .await
            }
        };

        if let RewriteOutcome::Rewritten { .. } = result.outcome {
            self.emit_beacons(req, &state, &pod);
        }
        result
    }

    /// CSI: annotate, never splice.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_csi(
        &self,
        req: &RewriteRequest<'_>,
        mut playlist: MediaPlaylist,
        marker: usize,
        state: &AdBreakState,
        pod: &Pod,
        signal: Option<&SignalAtLine>,
        origin_text: &str,
    ) -> RewriteResult {
        let asset_uri = match self.sign_pod_master(req.channel, pod) {
            Ok(uri) => uri,
            Err(reason) => {
                warn!("CSI asset signing failed ({reason}); legacy fallback");
                return self.legacy_fallback(playlist, "sign_failed");
            }
        };

        let scte35_out = signal
            .and_then(|s| s.signal.out_payload.as_deref())
            .map(csi::normalise_scte35_payload);
        let scte35_in = signal
            .and_then(|s| s.signal.in_payload.as_deref())
            .map(csi::normalise_scte35_payload);

        let cue = csi::CsiCue {
            id: &state.event_id,
            start_date: &state.start_pdt,
            duration_sec: state.duration_sec,
            asset_uri: &asset_uri,
            playout_controls: None,
            scte35_out,
            scte35_in,
        };
        csi::inject_interstitial(&mut playlist, Some(marker), &cue);

        if !playlist.well_formed() {
            warn!("CSI rewrite broke the segment invariant; returning origin");
            return passthrough(origin_text, "invariant_violation");
        }

        info!(
            "CSI: injected interstitial {} ({}s) on channel {}",
            state.event_id, state.duration_sec, req.channel.id
        );
        RewriteResult {
            body: playlist.render(),
            outcome: RewriteOutcome::Rewritten { mode: "csi" },
        }
    }

    /// SSAI: splice pod items over the skipped window.
    #[allow(clippy::too_many_arguments)]
    async fn rewrite_ssai(
        &self,
        req: &RewriteRequest<'_>,
        playlist: MediaPlaylist,
        marker: usize,
        state: &AdBreakState,
        pod: &Pod,
        signal: Option<&SignalAtLine>,
        origin_text: &str,
    ) -> RewriteResult {
        let skip_target = if state.pinned_skip_count > 0 {
            SkipTarget::StableCount(state.pinned_skip_count)
        } else {
            SkipTarget::Duration(state.duration_sec)
        };

        let mut plan = match compute_skip_plan(&playlist, marker, skip_target, None) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    "Skip plan failed for break {} on channel {}: {} — returning origin",
                    state.event_id,
                    req.channel.id,
                    e.reason()
                );
                metrics::record_skip_plan_failure(e.reason());
                return passthrough(origin_text, "skip_plan_infeasible");
            }
        };

        // Stability across requests: when this window no longer shows the
        // origin PDT, reuse the one pinned by the first observer
        if plan.resume_pdt_synthesised {
            if let Some(pinned) = &state.pinned_resume_pdt {
                plan.resume_pdt = pinned.clone();
            } else {
                info!(
                    "Resume PDT synthesised for break {} ({})",
                    state.event_id, plan.resume_pdt
                );
            }
        }

        let bandwidth = bandwidth_for_variant(req.variant, &req.channel.bitrate_ladder);
        let items = pod.items_for_bitrate(bandwidth);
        if items.is_empty() {
            return self.legacy_fallback(playlist, "no_items_for_bitrate");
        }

        let mut ads = Vec::with_capacity(items.len());
        for item in &items {
            match self.sign_ad_url(req.channel, &item.playlist_url) {
                Ok(uri) => ads.push(ssai::AdEntry {
                    uri,
                    duration_sec: item.duration_sec,
                }),
                Err(reason) => {
                    warn!("Ad URL signing failed ({reason}); legacy fallback");
                    return self.legacy_fallback(playlist, "sign_failed");
                }
            }
        }

        let telemetry = self
            .ssai_telemetry(req, state, &plan, signal)
            .await;
        let out = ssai::splice_pod(&playlist, &plan, &ads, &state.event_id, &telemetry);

        if !out.well_formed() {
            warn!("SSAI rewrite broke the segment invariant; returning origin");
            metrics::record_skip_plan_failure("invariant_violation");
            return passthrough(origin_text, "invariant_violation");
        }

        info!(
            "SSAI: spliced {} ad(s) over {} segment(s) for {}/{} (resume {})",
            ads.len(),
            plan.segments_skipped,
            req.channel.id,
            req.variant,
            plan.resume_pdt
        );
        RewriteResult {
            body: out.render(),
            outcome: RewriteOutcome::Rewritten { mode: "ssai" },
        }
    }

    /// Snap/validation telemetry for the return DATERANGE.
    async fn ssai_telemetry(
        &self,
        req: &RewriteRequest<'_>,
        state: &AdBreakState,
        _plan: &SkipPlan,
        signal: Option<&SignalAtLine>,
    ) -> ssai::ReturnTelemetry {
        use crate::timing::idr::{DEFAULT_LOOK_AHEAD_PTS, DEFAULT_TOLERANCE_PTS, IdrTimeline};

        let mut telemetry = ssai::ReturnTelemetry {
            planned_duration_sec: state.duration_sec,
            ..Default::default()
        };

        let cue_status = match signal.and_then(|s| s.section.as_ref()) {
            Some(section) if section.encrypted_packet => "encrypted",
            Some(section) if !section.crc_valid => "crc-invalid",
            Some(_) => "ok",
            None => "text-only",
        };
        telemetry.cue_status = Some(cue_status.to_string());

        // The snapped PTS informs telemetry only; skipping stays PDT-driven
        if let Some(pts) = signal.and_then(|s| s.signal.pts) {
            let timing = self.timing.channel(&req.channel.id);
            let guard = timing.lock().await;
            let decision = guard.idr.snap(pts, DEFAULT_LOOK_AHEAD_PTS, true);
            let validation = IdrTimeline::validate(&decision, DEFAULT_TOLERANCE_PTS);
            telemetry.boundary_snap = Some(format!(
                "{}:{:+.3}s",
                snap_reason_str(decision.reason),
                validation.error_seconds
            ));
        }

        telemetry
    }

    /// Last resort: a single discontinuity before the tail.
    fn legacy_fallback(&self, mut playlist: MediaPlaylist, reason: &'static str) -> RewriteResult {
        playlist.insert_discontinuity();
        RewriteResult {
            body: playlist.render(),
            outcome: RewriteOutcome::Fallback { reason },
        }
    }

    /// Channel mode wins; `auto` sniffs the client; query override is
    /// honoured in dev only.
    fn select_mode(&self, req: &RewriteRequest<'_>) -> InsertionMode {
        if let Some(forced) = req.force_mode {
            if self.is_dev {
                return forced;
            }
            warn!("Ignoring force-mode override outside dev mode");
        }
        match req.channel.mode {
            InsertionMode::Csi => InsertionMode::Csi,
            InsertionMode::Ssai => InsertionMode::Ssai,
            InsertionMode::Auto => {
                if is_apple_hls_client(req.user_agent) {
                    InsertionMode::Csi
                } else {
                    InsertionMode::Ssai
                }
            }
        }
    }

    /// Sign the pod's master playlist for CSI X-ASSET-URI.
    fn sign_pod_master(&self, channel: &ChannelConfig, pod: &Pod) -> Result<String, String> {
        let base = Url::parse(&channel.ad_pod_base_url)
            .map_err(|e| format!("bad ad_pod_base_url: {e}"))?;
        let path = format!(
            "{}/{}/master.m3u8",
            base.path().trim_end_matches('/'),
            pod.pod_id
        );
        let host = self.sign_host_for(channel);
        self.signer
            .sign(host, &path, self.sign_ttl_secs, None)
            .map_err(|e| e.to_string())
    }

    fn sign_host_for<'a>(&'a self, channel: &'a ChannelConfig) -> &'a str {
        if channel.sign_host.is_empty() {
            &self.default_sign_host
        } else {
            &channel.sign_host
        }
    }

    /// Sign one ad item URL. Absolute URLs are re-signed on their own host;
    /// absolute paths go to the channel's sign host.
    fn sign_ad_url(&self, channel: &ChannelConfig, item_url: &str) -> Result<String, String> {
        if item_url.starts_with('/') {
            return self
                .signer
                .sign(self.sign_host_for(channel), item_url, self.sign_ttl_secs, None)
                .map_err(|e| e.to_string());
        }
        let url = Url::parse(item_url).map_err(|e| format!("bad ad url: {e}"))?;
        let host = url.host_str().ok_or("ad url has no host")?;
        self.signer
            .sign(host, url.path(), self.sign_ttl_secs, None)
            .map_err(|e| e.to_string())
    }

    /// Impression on first observation, quartiles as the break progresses.
    fn emit_beacons(&self, req: &RewriteRequest<'_>, state: &AdBreakState, pod: &Pod) {
        let break_key = format!("{}:{}", req.channel.id, state.event_id);
        let ts_ms = req.now.timestamp_millis();
        let bandwidth = bandwidth_for_variant(req.variant, &req.channel.bitrate_ladder);

        let progress = parse_pdt(&state.start_pdt)
            .ok()
            .map(|start| {
                let elapsed = (req.now - start.to_utc()).num_milliseconds() as f64 / 1000.0;
                (elapsed / state.duration_sec.max(0.001)).clamp(0.0, 1.0)
            })
            .unwrap_or(0.0);

        if self.quartiles.begin(&break_key) {
            for item in pod.items_for_bitrate(bandwidth) {
                let msg = beacon::impression_for(
                    pod,
                    &item.ad_id,
                    &req.channel.id,
                    req.variant,
                    bandwidth,
                    ts_ms,
                );
                self.beacons.deliver(&msg);
            }
        }

        for event in self.quartiles.advance(&break_key, progress) {
            let msg = beacon::BeaconMessage {
                event,
                ad_id: pod
                    .items
                    .first()
                    .map(|i| i.ad_id.clone())
                    .unwrap_or_else(|| "slate".to_string()),
                pod_id: Some(pod.pod_id.clone()),
                channel: req.channel.id.clone(),
                ts_ms,
                tracker_urls: beacon::tracker_urls(pod.tracking.as_ref(), event),
                metadata: None,
            };
            self.beacons.deliver(&msg);
        }
    }
}

/// The break the rewriter is acting on this request.
struct BreakInfo {
    event_id: String,
    start_pdt: String,
    duration_sec: f64,
}

impl BreakInfo {
    fn from_sources(
        req: &RewriteRequest<'_>,
        signal: Option<&SignalAtLine>,
        active: Option<&AdBreakState>,
    ) -> Option<Self> {
        // A signal without a START-DATE cannot anchor a break; fall back to
        // any active pinned state
        if let Some(found) = signal
            && let Some(start_pdt) = found.signal.start_date.clone()
        {
            let duration = found
                .signal
                .duration_sec
                .or_else(|| {
                    found
                        .section
                        .as_ref()
                        .filter(|s| s.crc_valid && !s.encrypted_packet)
                        .and_then(|s| s.break_duration_secs())
                })
                .unwrap_or(req.channel.default_ad_duration);
            return Some(BreakInfo {
                event_id: found.signal.id.clone(),
                start_pdt,
                duration_sec: duration,
            });
        }
        active.map(|state| BreakInfo {
            event_id: state.event_id.clone(),
            start_pdt: state.start_pdt.clone(),
            duration_sec: state.duration_sec,
        })
    }

    fn end_pdt(&self) -> String {
        parse_pdt(&self.start_pdt)
            .map(|start| {
                format_pdt(
                    start + Duration::milliseconds((self.duration_sec * 1000.0).round() as i64),
                )
            })
            .unwrap_or_else(|_| self.start_pdt.clone())
    }
}

/// Schedule-driven break for channels whose origin sends no cues.
///
/// With `auto_insert` on and a fallback schedule configured, a break opens
/// at every interval boundary for the scheduled duration. The event id is
/// derived from the boundary, so all requests inside one window pin the
/// same break.
fn scheduled_break(req: &RewriteRequest<'_>) -> Option<BreakInfo> {
    if !req.channel.scte35.auto_insert {
        return None;
    }
    let schedule = req.channel.scte35.fallback_schedule.as_ref()?;
    let interval_secs = (schedule.interval_min * 60) as i64;
    if interval_secs == 0 || schedule.duration_sec <= 0.0 {
        return None;
    }

    let now_ts = req.now.timestamp();
    let boundary = now_ts - now_ts.rem_euclid(interval_secs);
    if (now_ts - boundary) as f64 >= schedule.duration_sec {
        return None;
    }

    let start = DateTime::from_timestamp(boundary, 0)?;
    Some(BreakInfo {
        event_id: format!("sched-{boundary}"),
        start_pdt: format_pdt(start.fixed_offset()),
        duration_sec: schedule.duration_sec,
    })
}

/// Collect SCTE-35 signals from DATERANGE lines, enriched from binary
/// payloads where they decode cleanly.
pub fn extract_signals(playlist: &MediaPlaylist) -> Vec<SignalAtLine> {
    let mut signals = Vec::new();
    for (line_index, line) in playlist.lines.iter().enumerate() {
        let Line::DateRange(attrs_raw) = line else {
            continue;
        };
        let attrs = parse_attribute_list(attrs_raw);
        let Some(mut signal) = signal_from_daterange(&attrs) else {
            continue;
        };

        let payload = signal
            .out_payload
            .as_deref()
            .or(signal.in_payload.as_deref());
        let section = payload
            .filter(|p| p.starts_with("0x") || p.starts_with("0X"))
            .and_then(|p| match scte35::decode_hex(p) {
                Ok(section) => Some(section),
                Err(e) => {
                    debug!("SCTE-35 binary decode failed at line {line_index}: {e}");
                    None
                }
            });

        if let Some(section) = &section {
            if section.crc_valid && !section.encrypted_packet {
                // Binary enrichment of the text-derived fields
                signal.pts = section.primary_pts();
                if signal.duration_sec.is_none() {
                    signal.duration_sec = section.break_duration_secs();
                }
                if let Some(seg) = section.segmentation_descriptors().next() {
                    if signal.segmentation_type_id.is_none() {
                        signal.segmentation_type_id = Some(seg.type_id);
                    }
                    if signal.upid.is_none() && !seg.upid.text.is_empty() {
                        signal.upid = Some(seg.upid.text.clone());
                    }
                    if signal.segment_num.is_none() {
                        signal.segment_num = Some(seg.segment_num);
                        signal.segments_expected = Some(seg.segments_expected);
                    }
                }
                if signal.auto_return.is_none()
                    && let crate::scte35::SpliceCommand::SpliceInsert(si) = &section.command
                {
                    signal.auto_return = si.break_duration.as_ref().map(|bd| bd.auto_return);
                }
            } else {
                // Corrupt or encrypted: text fields survive, binary ones don't
                if !section.crc_valid {
                    metrics::record_scte35_crc_failure();
                }
            }
        }

        signals.push(SignalAtLine {
            line_index,
            signal,
            section,
        });
    }
    signals
}

/// Find the PDT marker line for a break start.
///
/// Exact millisecond match wins; otherwise the first PDT at or past the
/// start date is used.
pub fn find_marker(playlist: &MediaPlaylist, start_pdt: &str) -> Option<usize> {
    let target = parse_pdt(start_pdt).ok()?;

    let mut first_after = None;
    for (i, line) in playlist.lines.iter().enumerate() {
        let Line::ProgramDateTime(iso) = line else {
            continue;
        };
        let Ok(t) = parse_pdt(iso) else { continue };
        if t.timestamp_millis() == target.timestamp_millis() {
            return Some(i);
        }
        if t >= target && first_after.is_none() {
            first_after = Some(i);
        }
    }
    first_after
}

/// Resolve a variant name to a bandwidth, snapped to the channel ladder.
///
/// Variant names carry their kbps (`v_800k`, `video-1600`); the digits are
/// matched to the nearest ladder entry when a ladder is configured.
pub fn bandwidth_for_variant(variant: &str, ladder_kbps: &[u64]) -> u64 {
    let digits: String = {
        // Longest run of digits in the name
        let mut best = String::new();
        let mut current = String::new();
        for c in variant.chars() {
            if c.is_ascii_digit() {
                current.push(c);
            } else {
                if current.len() > best.len() {
                    best = current.clone();
                }
                current.clear();
            }
        }
        if current.len() > best.len() {
            best = current;
        }
        best
    };

    let kbps = digits.parse::<u64>().ok();
    match (kbps, ladder_kbps.is_empty()) {
        (Some(k), false) => {
            let nearest = ladder_kbps
                .iter()
                .min_by_key(|&&l| l.abs_diff(k))
                .copied()
                .unwrap_or(k);
            nearest * 1000
        }
        (Some(k), true) => k * 1000,
        (None, false) => ladder_kbps[0] * 1000,
        (None, true) => 800_000,
    }
}

fn is_apple_hls_client(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else { return false };
    if ua.contains("AppleCoreMedia") || ua.contains("AVPlayer") {
        return true;
    }
    ua.contains("Safari") && !ua.contains("Chrome") && !ua.contains("Chromium")
}

fn snap_reason_str(reason: crate::timing::idr::SnapReason) -> &'static str {
    use crate::timing::idr::SnapReason;
    match reason {
        SnapReason::Exact => "exact",
        SnapReason::Future => "future",
        SnapReason::Previous => "previous",
        SnapReason::None => "none",
    }
}

fn passthrough(origin_text: &str, reason: &'static str) -> RewriteResult {
    RewriteResult {
        body: origin_text.to_string(),
        outcome: RewriteOutcome::Passthrough { reason },
    }
}
