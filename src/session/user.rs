use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::peer::TrackKind;
use crate::signaller::UserKind;
use crate::stream::Stream;

/// Which kinds of media a user is sending under one label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamKinds {
    pub audio: bool,
    pub video: bool,
}

/// A member of the group, as announced by `user` messages.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: String,
    pub username: Option<String>,
    pub permissions: HashSet<String>,
    pub data: Option<Value>,
    streams: BTreeMap<String, StreamKinds>,
}

impl User {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Media the user is sending, keyed by stream label.
    pub fn streams(&self) -> &BTreeMap<String, StreamKinds> {
        &self.streams
    }

    /// Returns whether anything changed.
    pub(crate) fn set_streams(&mut self, streams: BTreeMap<String, StreamKinds>) -> bool {
        if self.streams == streams {
            return false;
        }
        self.streams = streams;
        true
    }
}

#[derive(Debug, Clone)]
pub struct UserEvent {
    pub id: String,
    pub kind: UserKind,
}

pub(crate) fn derive_streams<'a>(
    streams: impl Iterator<Item = &'a Stream>,
) -> BTreeMap<String, StreamKinds> {
    let mut kinds: BTreeMap<String, StreamKinds> = BTreeMap::new();
    for stream in streams {
        let entry = kinds.entry(stream.label().to_string()).or_default();
        for track in stream.media().map(|m| m.tracks.as_slice()).unwrap_or_default() {
            match track.kind {
                TrackKind::Audio => entry.audio = true,
                TrackKind::Video => entry.video = true,
            }
        }
    }
    kinds
}
