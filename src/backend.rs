//! The per-(media, preset) state machine: segment status map, encoder
//! heads, client playheads, debounced recalculation and segment delivery
//! (spec.md §4.3).
use crate::debounce::Debounce;
use crate::quality::QualityPreset;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::process::ManagedProcess;

type RecalcFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RecalcFn = Box<dyn Fn() -> RecalcFuture + Send + Sync>;

const EMPTY: u8 = 0;
const DONE: u8 = 255;
const MIN_ENCODER_ID: u8 = 2;
const MAX_ENCODER_ID: u8 = 253;
const ENCODER_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);
/// ffmpeg is asked to never emit more than this many segments per head
/// before yielding to whatever encoder already covers ahead (spec.md
/// §4.3.2).
const MAX_SEGMENTS_PER_HEAD: usize = 512;

struct EncoderMeta {
    head: usize,
    cancel: CancellationToken,
}

struct ClientState {
    /// -1 until the client has requested a segment.
    head: i64,
    transcoder: Option<u8>,
    deleted: bool,
}

struct State {
    segment_status: Vec<u8>,
    encoder_heads: HashMap<u8, EncoderMeta>,
    clients: HashMap<String, ClientState>,
    last_assigned_id: u8,
    waiters: HashMap<usize, Vec<oneshot::Sender<Result<(), String>>>>,
    destructed: bool,
}

/// Configuration fixed for the lifetime of one backend.
pub struct BackendConfig {
    pub ffmpeg_bin: String,
    pub source_path: String,
    pub out_dir: PathBuf,
    pub breakpoints: Arc<Vec<f64>>,
    pub preset: QualityPreset,
    pub min_buffer_length: f64,
    pub max_buffer_length: f64,
}

pub struct QualityBackend {
    config: BackendConfig,
    n: usize,
    state: Mutex<State>,
    recalc: Debounce<RecalcFn>,
}

impl QualityBackend {
    /// `Arc::new_cyclic` lets the debounced recalculation closure hold a
    /// `Weak<Self>` back-reference to the backend it belongs to, without a
    /// chicken-and-egg construction order.
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let n = config.breakpoints.len() - 1;
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let recalc: RecalcFn = Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        if let Err(e) = this.recalculate().await {
                            warn!("recalculate failed: {e}");
                        }
                    }
                }) as RecalcFuture
            });
            Self {
                n,
                state: Mutex::new(State {
                    segment_status: vec![EMPTY; n],
                    encoder_heads: HashMap::new(),
                    clients: HashMap::new(),
                    last_assigned_id: 0,
                    waiters: HashMap::new(),
                    destructed: false,
                }),
                recalc: Debounce::new(recalc),
                config,
            }
        })
    }

    pub fn segment_count(&self) -> usize {
        self.n
    }

    fn segment_filename(&self, idx: usize) -> String {
        format!("{}-{:05}.ts", self.config.preset.name, idx)
    }

    // ---- 4.3.1: encoder id allocation ----------------------------------

    fn find_next_available_id(state: &mut State) -> Result<u8> {
        let start = (state.last_assigned_id as u16 % 252) as u8 + MIN_ENCODER_ID;
        for step in 0..252u16 {
            let candidate = MIN_ENCODER_ID + (((start as u16 - MIN_ENCODER_ID as u16) + step) % 252) as u8;
            let in_use_status = state.segment_status.contains(&candidate);
            let in_use_head = state.encoder_heads.contains_key(&candidate);
            if !in_use_status && !in_use_head {
                state.last_assigned_id = candidate;
                return Ok(candidate);
            }
        }
        bail!("no available encoder id")
    }

    // ---- 4.3.2: starting a transcode ------------------------------------

    async fn start_transcode(self: &Arc<Self>, s: usize) -> Result<()> {
        let (eid, end) = {
            let mut state = self.state.lock().await;
            if state.segment_status[s] != EMPTY {
                bail!("segment {s} is not EMPTY");
            }
            let mut end = (s + MAX_SEGMENTS_PER_HEAD).min(self.n);
            for i in (s + 1)..end {
                if state.segment_status[i] != EMPTY {
                    end = i;
                    break;
                }
            }
            let eid = Self::find_next_available_id(&mut state)?;
            state.segment_status[s] = eid;
            (eid, end)
        };

        let bp = &self.config.breakpoints;
        let mut args: Vec<String> = Vec::new();
        if s > 0 {
            args.push("-ss".into());
            args.push(format!("{:.6}", bp[s]));
        }
        args.push("-i".into());
        args.push(self.config.source_path.clone());
        args.push("-to".into());
        args.push(format!("{:.6}", bp[end]));
        args.push("-copyts".into());

        let key_frame_times: Vec<String> = ((s + 1)..=end).map(|i| format!("{:.6}", bp[i])).collect();
        args.push("-force_key_frames".into());
        args.push(key_frame_times.join(","));

        push_codec_args(&mut args, &self.config.preset);

        args.push("-f".into());
        args.push("segment".into());
        args.push("-segment_time_delta".into());
        args.push("0.2".into());
        args.push("-segment_format".into());
        args.push("mpegts".into());
        args.push("-segment_times".into());
        args.push(key_frame_times.join(","));
        args.push("-segment_start_number".into());
        args.push(s.to_string());
        args.push("-segment_list_type".into());
        args.push("flat".into());
        args.push("-segment_list".into());
        args.push("pipe:1".into());

        let out_pattern = self
            .config
            .out_dir
            .join(format!("{}-%05d.ts", self.config.preset.name));
        args.push(out_pattern.to_string_lossy().to_string());

        info!(
            "starting encoder {eid} for {} segment {s}..{end}",
            self.config.preset.name
        );
        let process = ManagedProcess::spawn(&self.config.ffmpeg_bin, &args)
            .with_context(|| format!("failed to start encoder at segment {s}"))?;

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            state
                .encoder_heads
                .insert(eid, EncoderMeta { head: s, cancel: cancel.clone() });
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_encoder(eid, process, end, cancel).await;
        });

        Ok(())
    }

    async fn run_encoder(self: Arc<Self>, eid: u8, mut process: ManagedProcess, end: usize, cancel: CancellationToken) {
        let mut lines = process.lines();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    process.kill().await.ok();
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            if let Some(idx) = parse_segment_index(&l, self.config.preset.name) {
                                let should_stop = self.on_segment_emitted(eid, idx, end).await;
                                if should_stop {
                                    cancel.cancel();
                                }
                            } else {
                                warn!("unrecognised encoder output line: {l}");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("error reading encoder {eid} stdout: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let code = process.wait_timeout(ENCODER_DEADLINE).await.unwrap_or(255);
        self.on_encoder_exit(eid, code).await;
    }

    // ---- 4.3.3: encoder stdout protocol ---------------------------------

    /// Returns `true` if the caller should now cancel the encoder.
    async fn on_segment_emitted(self: &Arc<Self>, eid: u8, idx: usize, end: usize) -> bool {
        let mut fired: Vec<oneshot::Sender<Result<(), String>>> = Vec::new();
        let stop = {
            let mut state = self.state.lock().await;
            let head = state.encoder_heads.get(&eid).map(|m| m.head).unwrap_or(idx);
            if idx != head {
                debug!("encoder {eid} emitted segment {idx}, expected head {head} (drift)");
                if state.segment_status.get(head) == Some(&eid) {
                    state.segment_status[head] = EMPTY;
                }
            }

            if idx < state.segment_status.len() {
                state.segment_status[idx] = DONE;
            }
            if let Some(w) = state.waiters.remove(&idx) {
                fired = w;
            }

            if idx + 1 >= end {
                false
            } else if state.segment_status.get(idx + 1) != Some(&EMPTY) {
                true
            } else {
                let buffered_under_max = state.clients.values().any(|c| {
                    !c.deleted
                        && c.transcoder == Some(eid)
                        && c.head >= 0
                        && self.buffered_length(c.head as usize, idx + 1) < self.config.max_buffer_length
                });
                if buffered_under_max {
                    state.segment_status[idx + 1] = eid;
                    if let Some(m) = state.encoder_heads.get_mut(&eid) {
                        m.head = idx + 1;
                    }
                    false
                } else {
                    true
                }
            }
        };

        for w in fired {
            let _ = w.send(Ok(()));
        }
        stop
    }

    fn buffered_length(&self, playhead: usize, next_missing: usize) -> f64 {
        let bp = &self.config.breakpoints;
        bp[next_missing.min(bp.len() - 1)] - bp[playhead.min(bp.len() - 1)]
    }

    // ---- 4.3.4: encoder exit handling ------------------------------------

    async fn on_encoder_exit(self: &Arc<Self>, eid: u8, code: i32) {
        if code != 0 && code != 255 {
            warn!("encoder {eid} exited with code {code}");
        }
        let mut fired: Vec<oneshot::Sender<Result<(), String>>> = Vec::new();
        {
            let mut state = self.state.lock().await;
            if let Some(meta) = state.encoder_heads.remove(&eid) {
                if state.segment_status.get(meta.head) == Some(&eid) {
                    state.segment_status[meta.head] = EMPTY;
                }
                if let Some(w) = state.waiters.remove(&meta.head) {
                    fired = w;
                }
            }
        }
        for w in fired {
            let _ = w.send(Err(format!("encoder {eid} exited with code {code}")));
        }
        self.request_recalculate().await;
    }

    // ---- 4.3.5: debounced recalculation -----------------------------------

    /// Trigger a recalculation pass. Collapses overlapping invocations into
    /// at most one in-flight plus one queued, as spec.md §4.6 describes.
    pub async fn request_recalculate(&self) {
        self.recalc.call().await;
    }

    async fn recalculate(self: &Arc<Self>) -> Result<()> {
        struct Unresolved {
            client_id: String,
            first_to_encode: usize,
        }

        let (mut unresolved, kill_ids): (Vec<Unresolved>, Vec<u8>) = {
            let mut state = self.state.lock().await;
            if state.destructed {
                return Ok(());
            }

            // Step 1: detect duplicate heads (shouldn't occur).
            let mut by_index: HashMap<usize, u8> = HashMap::new();
            let mut dup_kill = Vec::new();
            for (&eid, meta) in state.encoder_heads.iter() {
                match by_index.get(&meta.head) {
                    Some(&existing) if existing != eid => dup_kill.push(eid.max(existing)),
                    _ => {
                        by_index.insert(meta.head, eid);
                    }
                }
            }

            // Step 2: compute firstToEncode per live client.
            let mut unresolved = Vec::new();
            let client_ids: Vec<String> = state.clients.keys().cloned().collect();
            for id in client_ids {
                let (deleted, head) = {
                    let c = &state.clients[&id];
                    (c.deleted, c.head)
                };
                if deleted || head < 0 {
                    continue;
                }
                let head = head as usize;
                let mut first_to_encode = None;
                let mut i = head;
                while i < self.n && self.config.breakpoints[i] - self.config.breakpoints[head] < self.config.min_buffer_length {
                    if state.segment_status[i] != DONE {
                        first_to_encode = Some(i);
                        break;
                    }
                    i += 1;
                }
                if let Some(first_to_encode) = first_to_encode {
                    unresolved.push(Unresolved {
                        client_id: id,
                        first_to_encode,
                    });
                }
            }

            // Step 3: attach to existing encoders whose head matches.
            let mut attach_now = Vec::new();
            unresolved.retain(|u| {
                let found = state.encoder_heads.iter().find(|(_, m)| {
                    m.head == u.first_to_encode || (u.first_to_encode > 0 && m.head == u.first_to_encode - 1)
                });
                if let Some((&eid, _)) = found {
                    attach_now.push((u.client_id.clone(), eid));
                    false
                } else {
                    true
                }
            });
            for (id, eid) in &attach_now {
                if let Some(c) = state.clients.get_mut(id) {
                    c.transcoder = Some(*eid);
                }
            }

            // Step 4: encoders with zero attached clients get killed.
            let mut attached_count: HashMap<u8, usize> = HashMap::new();
            for c in state.clients.values() {
                if !c.deleted {
                    if let Some(eid) = c.transcoder {
                        *attached_count.entry(eid).or_insert(0) += 1;
                    }
                }
            }
            let mut kill_ids: Vec<u8> = dup_kill;
            for &eid in state.encoder_heads.keys() {
                if attached_count.get(&eid).copied().unwrap_or(0) == 0 {
                    kill_ids.push(eid);
                }
            }
            kill_ids.sort_unstable();
            kill_ids.dedup();

            unresolved.sort_by_key(|u| u.first_to_encode);
            (unresolved, kill_ids)
        };

        for eid in kill_ids {
            self.cancel_encoder(eid).await;
        }

        // Step 5: spawn or attach the remaining unresolved clients.
        let mut just_started: Option<(usize, u8)> = None;
        for u in unresolved.drain(..) {
            let attach_to_just_started = just_started.and_then(|(idx, eid)| {
                if u.first_to_encode == idx || (u.first_to_encode > 0 && u.first_to_encode - 1 == idx) {
                    Some(eid)
                } else {
                    None
                }
            });
            if let Some(eid) = attach_to_just_started {
                let mut state = self.state.lock().await;
                if let Some(c) = state.clients.get_mut(&u.client_id) {
                    c.transcoder = Some(eid);
                }
                continue;
            }

            // Another recalculation step, or an existing encoder emitted a
            // segment, may have satisfied this client already.
            let already_done = {
                let state = self.state.lock().await;
                state.segment_status.get(u.first_to_encode) == Some(&DONE)
            };
            if already_done {
                continue;
            }

            let is_empty = {
                let state = self.state.lock().await;
                state.segment_status.get(u.first_to_encode) == Some(&EMPTY)
            };
            if !is_empty {
                // Someone else grabbed it between step 3 and now; an
                // existing encoder must already cover it.
                let eid = {
                    let state = self.state.lock().await;
                    state
                        .encoder_heads
                        .iter()
                        .find(|(_, m)| m.head == u.first_to_encode)
                        .map(|(&id, _)| id)
                };
                if let Some(eid) = eid {
                    let mut state = self.state.lock().await;
                    if let Some(c) = state.clients.get_mut(&u.client_id) {
                        c.transcoder = Some(eid);
                    }
                }
                continue;
            }

            match self.start_transcode(u.first_to_encode).await {
                Ok(()) => {
                    let eid = {
                        let state = self.state.lock().await;
                        state.segment_status[u.first_to_encode]
                    };
                    let mut state = self.state.lock().await;
                    if let Some(c) = state.clients.get_mut(&u.client_id) {
                        c.transcoder = Some(eid);
                    }
                    just_started = Some((u.first_to_encode, eid));
                }
                Err(e) => warn!("failed to start transcode at {}: {e}", u.first_to_encode),
            }
        }

        Ok(())
    }

    async fn cancel_encoder(&self, eid: u8) {
        let cancel = {
            let state = self.state.lock().await;
            state.encoder_heads.get(&eid).map(|m| m.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    // ---- 4.3.6: segment delivery -------------------------------------------

    /// Returns the path to the on-disk segment file once it is ready, or an
    /// error describing why it will never be ready.
    pub async fn get_segment(self: &Arc<Self>, client_id: &str, one_based_hex: &str) -> Result<PathBuf, SegmentError> {
        let idx = usize::from_str_radix(one_based_hex, 16)
            .map_err(|_| SegmentError::BadRequest("invalid segment index".into()))?
            .checked_sub(1)
            .ok_or_else(|| SegmentError::BadRequest("segment index must be >= 1".into()))?;
        if idx >= self.n {
            return Err(SegmentError::BadRequest(format!(
                "segment {idx} out of range (N={})",
                self.n
            )));
        }

        let wait_rx = {
            let mut state = self.state.lock().await;
            match state.clients.get_mut(client_id) {
                Some(c) if c.deleted => return Err(SegmentError::ClientGone),
                Some(c) => c.head = idx as i64,
                None => {
                    state.clients.insert(
                        client_id.to_string(),
                        ClientState {
                            head: idx as i64,
                            transcoder: None,
                            deleted: false,
                        },
                    );
                }
            }

            if state.segment_status[idx] == DONE {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(idx).or_default().push(tx);
                Some(rx)
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.request_recalculate().await;
        });

        if let Some(rx) = wait_rx {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SegmentError::EncoderFailed(e)),
                Err(_) => return Err(SegmentError::EncoderFailed("listener dropped".into())),
            }
        }

        Ok(self.config.out_dir.join(self.segment_filename(idx)))
    }

    // ---- 4.3.7: client lifecycle ----------------------------------------

    pub async fn remove_client(self: &Arc<Self>, client_id: &str) {
        {
            let mut state = self.state.lock().await;
            match state.clients.get_mut(client_id) {
                Some(c) => c.deleted = true,
                None => {
                    state.clients.insert(
                        client_id.to_string(),
                        ClientState {
                            head: -1,
                            transcoder: None,
                            deleted: true,
                        },
                    );
                }
            }
        }
        self.request_recalculate().await;

        let this = self.clone();
        let id = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            this.state.lock().await.clients.remove(&id);
        });
    }

    // ---- 4.3.8: destruction ----------------------------------------------

    pub async fn destruct(self: &Arc<Self>) {
        let (cancels, fired): (Vec<CancellationToken>, Vec<oneshot::Sender<Result<(), String>>>) = {
            let mut state = self.state.lock().await;
            state.destructed = true;
            let cancels = state.encoder_heads.values().map(|m| m.cancel.clone()).collect();
            let fired = state.waiters.drain().flat_map(|(_, v)| v).collect();
            (cancels, fired)
        };
        for w in fired {
            let _ = w.send(Err("Encoder being evicted".to_string()));
        }
        for c in cancels {
            c.cancel();
        }
    }
}

#[derive(Debug)]
pub enum SegmentError {
    BadRequest(String),
    ClientGone,
    EncoderFailed(String),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::BadRequest(s) => write!(f, "bad request: {s}"),
            SegmentError::ClientGone => write!(f, "client deleted"),
            SegmentError::EncoderFailed(s) => write!(f, "encoder failed: {s}"),
        }
    }
}

impl std::error::Error for SegmentError {}

fn parse_segment_index(line: &str, preset_name: &str) -> Option<usize> {
    let rest = line.strip_prefix(preset_name)?;
    let rest = rest.strip_prefix('-')?;
    let rest = rest.strip_suffix(".ts")?;
    rest.parse::<usize>().ok()
}

fn push_codec_args(args: &mut Vec<String>, preset: &QualityPreset) {
    if preset.resolution == 0 {
        args.push("-vn".into());
    } else {
        args.push("-vf".into());
        args.push(format!("scale=-2:{}", preset.resolution));
        args.push("-c:v".into());
        args.push("libx264".into());
        args.push("-b:v".into());
        args.push(format!("{}k", preset.video_bitrate_kbps));
    }
    args.push("-c:a".into());
    args.push("aac".into());
    args.push("-b:a".into());
    args.push(format!("{}k", preset.audio_bitrate_kbps));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segment_filenames() {
        assert_eq!(parse_segment_index("720p-00042.ts", "720p"), Some(42));
        assert_eq!(parse_segment_index("720p-00000.ts", "720p"), Some(0));
        assert_eq!(parse_segment_index("garbage", "720p"), None);
        assert_eq!(parse_segment_index("480p-00042.ts", "720p"), None);
    }

    fn test_backend(n: usize) -> Arc<QualityBackend> {
        let breakpoints: Vec<f64> = (0..=n).map(|i| i as f64 * 3.5).collect();
        QualityBackend::new(BackendConfig {
            ffmpeg_bin: "ffmpeg".into(),
            source_path: "/tmp/in.mp4".into(),
            out_dir: PathBuf::from("/tmp/out"),
            breakpoints: Arc::new(breakpoints),
            preset: crate::quality::VIDEO_PRESETS[1],
            min_buffer_length: 30.0,
            max_buffer_length: 60.0,
        })
    }

    #[tokio::test]
    async fn encoder_id_allocation_avoids_live_ids() {
        let backend = test_backend(10);
        let mut state = backend.state.lock().await;
        state.encoder_heads.insert(
            5,
            EncoderMeta {
                head: 0,
                cancel: CancellationToken::new(),
            },
        );
        let id = QualityBackend::find_next_available_id(&mut state).unwrap();
        assert_ne!(id, 5);
        assert!((MIN_ENCODER_ID..=MAX_ENCODER_ID).contains(&id));
    }

    #[tokio::test]
    async fn out_of_range_segment_is_rejected() {
        let backend = test_backend(4);
        let err = backend.get_segment("client-a", "5").await.unwrap_err();
        assert!(matches!(err, SegmentError::BadRequest(_)));
    }

    #[tokio::test]
    async fn deleted_client_gets_gone_error() {
        let backend = test_backend(4);
        backend.remove_client("client-a").await;
        let err = backend.get_segment("client-a", "1").await.unwrap_err();
        assert!(matches!(err, SegmentError::ClientGone));
    }
}
