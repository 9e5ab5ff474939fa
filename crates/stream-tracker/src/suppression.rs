//! Shared "last emitted event per channel" suppression logic (§3 invariant,
//! §4.5 steps, §4.6 POST handler) used identically by the polling (C5) and
//! webhook (C6) tracker variants so their transition rules never drift
//! apart.

use std::collections::HashMap;

use tracker_core::model::StreamInfo;

/// The last classification emitted for one channel.
#[derive(Debug, Clone)]
enum LastState {
    Offline,
    Online(StreamInfo),
}

/// One transition to emit, or none when the new sample is suppressed.
#[derive(Debug, Clone)]
pub enum Transition {
    Online(StreamInfo),
    Offline,
    Changed(StreamInfo),
}

/// Tracks `last_event[channel]` and computes the transition (if any) for a
/// freshly observed sample, per the rules common to §4.5 and §4.6:
/// offline->online emits Online, online->absent emits Offline, online with
/// a changed [`StreamInfo`] emits Changed, anything else is suppressed.
#[derive(Default)]
pub struct LastEventTracker {
    last: HashMap<String, LastState>,
}

impl LastEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `sample` is `Some(info)` when the channel is currently online,
    /// `None` when it is currently offline/absent from this observation.
    pub fn observe(&mut self, channel: &str, sample: Option<StreamInfo>) -> Option<Transition> {
        let previous = self.last.get(channel);
        let transition = match (previous, sample) {
            (None | Some(LastState::Offline), Some(info)) => Some(Transition::Online(info)),
            (Some(LastState::Online(_)), None) => Some(Transition::Offline),
            (Some(LastState::Online(old)), Some(new)) if *old != new => {
                Some(Transition::Changed(new))
            }
            _ => None,
        };

        match &transition {
            Some(Transition::Online(info)) | Some(Transition::Changed(info)) => {
                self.last.insert(channel.to_string(), LastState::Online(info.clone()));
            }
            Some(Transition::Offline) => {
                self.last.insert(channel.to_string(), LastState::Offline);
            }
            None => {}
        }

        transition
    }
}
