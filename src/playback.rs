//! Playback transport over an external output engine
//!
//! **Architecture**: Transport does NOT own the playlist. Methods that move
//! between tracks receive `&PlaylistIndex`; the context owns the single index.
//!
//! **Why**: the output engine keeps playing stale stems for a moment after
//! `stop`. Every transition stops fully, waits the settle delay, then starts
//! the new stems, so consecutive tracks never overlap.
//!
//! **Used by**: AppContext (play / next / previous / stop, on the worker
//! pool), CLI `play`
//!
//! A transition holds `&mut Transport` for the whole stop-settle-load-start
//! sequence. [`TransportStatus`] is the shared view that stays readable
//! meanwhile.
//!
//! # Mixing
//!
//! Each stem has its own volume and mute flag; the sink gain of a stem is
//! `volume * master / 100`, or 0 while muted.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::core::ResourceError;
use crate::playlist::{PlaylistIndex, Track};
use crate::resources::{AudioManager, Stem, StemSet};

/// External audio output (mixer channels in the app)
pub trait OutputSink: Send {
    /// Start playing all stems from the beginning
    fn start(&mut self, stems: &StemSet);
    /// Stop and release every channel
    fn stop(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn set_gain(&mut self, stem: Stem, gain: f32);
}

/// Sink that plays nothing; used by the headless CLI
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn start(&mut self, stems: &StemSet) {
        debug!("NullSink: start {}", stems.folder.display());
    }
    fn stop(&mut self) {}
    fn pause(&mut self) {}
    fn resume(&mut self) {}
    fn set_gain(&mut self, _stem: Stem, _gain: f32) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Index after `current`, wrapping to the first
pub fn next_index(current: Option<usize>, len: usize) -> usize {
    match current {
        Some(i) if i + 1 < len => i + 1,
        _ => 0,
    }
}

/// Index before `current`, wrapping to the last
pub fn previous_index(current: Option<usize>, len: usize) -> usize {
    match current {
        Some(i) if i > 0 && i <= len => i - 1,
        _ => len.saturating_sub(1),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Position {
    state: PlaybackState,
    current: Option<usize>,
}

/// State and current index, shared with the transport
#[derive(Debug, Clone, Default)]
pub struct TransportStatus(Arc<Mutex<Position>>);

impl TransportStatus {
    pub fn state(&self) -> PlaybackState {
        self.position().state
    }

    pub fn current(&self) -> Option<usize> {
        self.position().current
    }

    fn position(&self) -> Position {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Position)) {
        f(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StemMix {
    volume: f32,
    muted: bool,
}

impl Default for StemMix {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }
}

pub struct Transport {
    audio: Arc<AudioManager>,
    sink: Box<dyn OutputSink>,
    settle_delay: Duration,
    status: TransportStatus,
    master_volume: u8,
    mix: [StemMix; 4],
}

impl Transport {
    pub fn new(audio: Arc<AudioManager>, sink: Box<dyn OutputSink>, settle_delay: Duration) -> Self {
        Self {
            audio,
            sink,
            settle_delay,
            status: TransportStatus::default(),
            master_volume: 100,
            mix: [StemMix::default(); 4],
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn current(&self) -> Option<usize> {
        self.status.current()
    }

    /// Shared handle to state and current index
    pub fn status(&self) -> TransportStatus {
        self.status.clone()
    }

    /// Stop, settle, then start the track at `index`.
    ///
    /// On a load error playback stays stopped; `current` still moves to
    /// `index` so next/previous continue from there.
    pub fn play(&mut self, playlist: &PlaylistIndex, index: usize) -> Result<Arc<StemSet>, ResourceError> {
        let Some(track) = playlist.get(index) else {
            self.stop();
            return Err(ResourceError::load(format!("No track at index {}", index)));
        };
        self.play_track(index, track)
    }

    /// Same as [`Transport::play`] for a track taken out of the playlist
    pub fn play_track(&mut self, index: usize, track: &Track) -> Result<Arc<StemSet>, ResourceError> {
        self.stop();
        self.status.update(|p| p.current = Some(index));

        let stems = self
            .audio
            .load(&track.folder)?
            .ok_or_else(|| ResourceError::load(format!("No stems for {}", track.display_name())))?;

        self.sink.start(&stems);
        self.apply_gains();
        self.status.update(|p| p.state = PlaybackState::Playing);
        info!("Playing {} ({} bytes)", track.display_name(), stems.total_bytes());
        Ok(stems)
    }

    /// Next track, wrapping to the first
    pub fn next(&mut self, playlist: &PlaylistIndex) -> Result<Arc<StemSet>, ResourceError> {
        let index = next_index(self.current(), playlist.len());
        self.play(playlist, index)
    }

    /// Previous track, wrapping to the last
    pub fn previous(&mut self, playlist: &PlaylistIndex) -> Result<Arc<StemSet>, ResourceError> {
        let index = previous_index(self.current(), playlist.len());
        self.play(playlist, index)
    }

    /// Stop output fully and wait for it to settle
    pub fn stop(&mut self) {
        self.sink.stop();
        if self.state() != PlaybackState::Stopped {
            debug!("Transport: settling {}ms", self.settle_delay.as_millis());
        }
        thread::sleep(self.settle_delay);
        self.status.update(|p| p.state = PlaybackState::Stopped);
    }

    pub fn toggle_pause(&mut self) -> PlaybackState {
        let next = match self.state() {
            PlaybackState::Playing => {
                self.sink.pause();
                PlaybackState::Paused
            }
            PlaybackState::Paused => {
                self.sink.resume();
                PlaybackState::Playing
            }
            PlaybackState::Stopped => PlaybackState::Stopped,
        };
        self.status.update(|p| p.state = next);
        next
    }

    /// Master volume, 0..=100
    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume = volume.min(100);
        self.apply_gains();
    }

    /// Stem volume, 0.0..=1.0
    pub fn set_stem_volume(&mut self, stem: Stem, volume: f32) {
        self.mix[stem as usize].volume = volume.clamp(0.0, 1.0);
        self.apply_gains();
    }

    /// Flip mute for one stem; returns the new muted flag
    pub fn toggle_mute(&mut self, stem: Stem) -> bool {
        let mix = &mut self.mix[stem as usize];
        mix.muted = !mix.muted;
        let muted = mix.muted;
        self.apply_gains();
        muted
    }

    pub fn gain(&self, stem: Stem) -> f32 {
        let mix = self.mix[stem as usize];
        if mix.muted {
            0.0
        } else {
            mix.volume * self.master_volume as f32 / 100.0
        }
    }

    fn apply_gains(&mut self) {
        for stem in Stem::ALL {
            let gain = self.gain(stem);
            self.sink.set_gain(stem, gain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Workers;
    use crate::playlist::DESCRIPTOR_FILE;
    use crate::resources::audio::tests::make_track;
    use std::time::Instant;

    /// Records sink calls
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl OutputSink for Recorder {
        fn start(&mut self, stems: &StemSet) {
            let name = stems.folder.file_name().unwrap().to_string_lossy().into_owned();
            self.0.lock().unwrap().push(format!("start {}", name));
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().push("stop".into());
        }
        fn pause(&mut self) {
            self.0.lock().unwrap().push("pause".into());
        }
        fn resume(&mut self) {
            self.0.lock().unwrap().push("resume".into());
        }
        fn set_gain(&mut self, _stem: Stem, _gain: f32) {}
    }

    fn setup(settle_ms: u64) -> (tempfile::TempDir, PlaylistIndex, Transport, Recorder) {
        let tmp = tempfile::tempdir().unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let folder = make_track(tmp.path(), name);
            std::fs::write(
                folder.join(DESCRIPTOR_FILE),
                format!(r#"{{"Artist": {{"{}{}": {{}}}}}}"#, i, name),
            )
            .unwrap();
        }
        let mut playlist = PlaylistIndex::new();
        playlist.scan(tmp.path());

        let audio = Arc::new(AudioManager::new(4, 2, Arc::new(Workers::new(1))));
        let recorder = Recorder::default();
        let transport = Transport::new(audio, Box::new(recorder.clone()), Duration::from_millis(settle_ms));
        (tmp, playlist, transport, recorder)
    }

    #[test]
    fn test_next_and_previous_wrap() {
        let (_tmp, playlist, mut transport, recorder) = setup(0);

        transport.play(&playlist, 2).unwrap();
        transport.next(&playlist).unwrap();
        assert_eq!(transport.current(), Some(0));
        transport.previous(&playlist).unwrap();
        assert_eq!(transport.current(), Some(2));

        let calls = recorder.0.lock().unwrap().clone();
        assert_eq!(calls, vec!["stop", "start c", "stop", "start a", "stop", "start c"]);
    }

    #[test]
    fn test_transition_waits_settle_delay() {
        let (_tmp, playlist, mut transport, _recorder) = setup(60);
        let started = Instant::now();
        transport.play(&playlist, 0).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(transport.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_missing_stems_leave_transport_stopped() {
        let (tmp, playlist, mut transport, _recorder) = setup(0);
        std::fs::remove_file(tmp.path().join("b/separated/drums.mp3")).unwrap();

        let err = transport.play(&playlist, 1).unwrap_err();
        assert!(matches!(err, ResourceError::Missing { .. }));
        assert_eq!(transport.state(), PlaybackState::Stopped);
        assert_eq!(transport.current(), Some(1));
    }

    #[test]
    fn test_wrapping_indices() {
        assert_eq!(next_index(None, 3), 0);
        assert_eq!(next_index(Some(1), 3), 2);
        assert_eq!(next_index(Some(2), 3), 0);
        assert_eq!(previous_index(Some(0), 3), 2);
        assert_eq!(previous_index(None, 3), 2);
        assert_eq!(previous_index(Some(9), 3), 2);
        assert_eq!(previous_index(None, 0), 0);
    }

    #[test]
    fn test_status_visible_while_transport_is_locked() {
        let (_tmp, playlist, transport, _recorder) = setup(0);
        let status = transport.status();
        let transport = Arc::new(Mutex::new(transport));

        transport.lock().unwrap().play(&playlist, 1).unwrap();
        let _held = transport.lock().unwrap();
        assert_eq!(status.state(), PlaybackState::Playing);
        assert_eq!(status.current(), Some(1));
    }

    #[test]
    fn test_pause_and_mix() {
        let (_tmp, playlist, mut transport, _recorder) = setup(0);
        assert_eq!(transport.toggle_pause(), PlaybackState::Stopped);

        transport.play(&playlist, 0).unwrap();
        assert_eq!(transport.toggle_pause(), PlaybackState::Paused);
        assert_eq!(transport.toggle_pause(), PlaybackState::Playing);

        transport.set_master_volume(50);
        transport.set_stem_volume(Stem::Vocals, 0.5);
        assert_eq!(transport.gain(Stem::Vocals), 0.25);
        assert!(transport.toggle_mute(Stem::Drums));
        assert_eq!(transport.gain(Stem::Drums), 0.0);
        assert!(!transport.toggle_mute(Stem::Drums));
        assert_eq!(transport.gain(Stem::Drums), 0.5);
    }
}
