use crate::id::{StreamId, TrackId};
use crate::track::MediaStreamTrack;
use mediamux_traits::{MediaError, MediaKind};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamEvent {
    AddTrack,
    RemoveTrack,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StreamListenerId(u64);

type StreamListener = Rc<dyn Fn(StreamEvent, &Rc<MediaStreamTrack>)>;

/// An ordered set of tracks, unique by track id.
pub struct MediaStream {
    id: StreamId,
    tracks: RefCell<Vec<Rc<MediaStreamTrack>>>,
    listeners: RefCell<Vec<(StreamListenerId, StreamListener)>>,
    next_listener: Cell<u64>,
}

impl MediaStream {
    pub fn new(tracks: &[Rc<MediaStreamTrack>]) -> Rc<MediaStream> {
        MediaStream::with_id(StreamId::new(), tracks)
    }

    pub fn with_id(id: StreamId, tracks: &[Rc<MediaStreamTrack>]) -> Rc<MediaStream> {
        let mut unique: Vec<Rc<MediaStreamTrack>> = Vec::with_capacity(tracks.len());
        for track in tracks {
            if !unique.iter().any(|t| t.id() == track.id()) {
                unique.push(track.clone());
            }
        }
        Rc::new(MediaStream {
            id,
            tracks: RefCell::new(unique),
            listeners: RefCell::new(vec![]),
            next_listener: Cell::new(0),
        })
    }

    /// A new stream holding the same tracks. Listeners are not copied.
    pub fn from_stream(other: &MediaStream) -> Rc<MediaStream> {
        MediaStream::new(&other.get_tracks())
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// True while at least one track has not ended.
    pub fn active(&self) -> bool {
        self.tracks.borrow().iter().any(|t| !t.ended())
    }

    pub fn get_tracks(&self) -> Vec<Rc<MediaStreamTrack>> {
        self.tracks.borrow().clone()
    }

    pub fn get_audio_tracks(&self) -> Vec<Rc<MediaStreamTrack>> {
        self.tracks_of_kind(MediaKind::Audio)
    }

    pub fn get_video_tracks(&self) -> Vec<Rc<MediaStreamTrack>> {
        self.tracks_of_kind(MediaKind::Video)
    }

    fn tracks_of_kind(&self, kind: MediaKind) -> Vec<Rc<MediaStreamTrack>> {
        self.tracks
            .borrow()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn get_track_by_id(&self, id: TrackId) -> Option<Rc<MediaStreamTrack>> {
        self.tracks.borrow().iter().find(|t| t.id() == id).cloned()
    }

    pub fn add_track(&self, track: &Rc<MediaStreamTrack>) {
        {
            let mut tracks = self.tracks.borrow_mut();
            if tracks.iter().any(|t| t.id() == track.id()) {
                return;
            }
            tracks.push(track.clone());
        }
        self.dispatch(StreamEvent::AddTrack, track);
    }

    pub fn remove_track(&self, track: &Rc<MediaStreamTrack>) {
        let removed = {
            let mut tracks = self.tracks.borrow_mut();
            let before = tracks.len();
            tracks.retain(|t| t.id() != track.id());
            tracks.len() != before
        };
        if removed {
            self.dispatch(StreamEvent::RemoveTrack, track);
        }
    }

    /// A new stream with a clone of every track.
    pub fn clone_stream(&self) -> Result<Rc<MediaStream>, MediaError> {
        let tracks = self
            .get_tracks()
            .iter()
            .map(|t| t.clone_track())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MediaStream::new(&tracks))
    }

    pub fn add_listener(
        &self,
        listener: Box<dyn Fn(StreamEvent, &Rc<MediaStreamTrack>)>,
    ) -> StreamListenerId {
        let id = StreamListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .push((id, Rc::from(listener)));
        id
    }

    pub fn remove_listener(&self, id: StreamListenerId) {
        self.listeners.borrow_mut().retain(|(i, _)| *i != id);
    }

    fn dispatch(&self, event: StreamEvent, track: &Rc<MediaStreamTrack>) {
        // Listeners may add or remove listeners.
        let listeners: Vec<StreamListener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event, track);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::BaseTrackInput;
    use crate::tests::setup;
    use mediamux_traits::{AudioWave, VideoPattern};

    #[test]
    fn test_tracks_are_deduplicated() {
        let (_backend, context) = setup();
        let audio = BaseTrackInput::test_audio(&context, AudioWave::Sine).unwrap();
        let video = BaseTrackInput::test_video(&context, VideoPattern::Smpte).unwrap();
        let a = MediaStreamTrack::new(&context, audio).unwrap();
        let v = MediaStreamTrack::new(&context, video).unwrap();

        let stream = MediaStream::new(&[a.clone(), v.clone(), a.clone()]);
        assert_eq!(stream.get_tracks().len(), 2);
        assert_eq!(stream.get_audio_tracks()[0].id(), a.id());
        assert_eq!(stream.get_video_tracks()[0].id(), v.id());
        assert!(stream.get_track_by_id(v.id()).is_some());
        assert!(stream.get_track_by_id(TrackId::new()).is_none());

        let copy = MediaStream::from_stream(&stream);
        assert_ne!(copy.id(), stream.id());
        assert_eq!(copy.get_tracks().len(), 2);
    }

    #[test]
    fn test_listeners_see_changes_only() {
        let (_backend, context) = setup();
        let input = BaseTrackInput::test_audio(&context, AudioWave::Sine).unwrap();
        let track = MediaStreamTrack::new(&context, input).unwrap();
        let stream = MediaStream::new(&[]);

        let seen = Rc::new(RefCell::new(vec![]));
        let recorded = seen.clone();
        let id = stream.add_listener(Box::new(move |event, track| {
            recorded.borrow_mut().push((event, track.id()))
        }));

        stream.add_track(&track);
        stream.add_track(&track);
        stream.remove_track(&track);
        stream.remove_track(&track);
        assert_eq!(
            *seen.borrow(),
            vec![
                (StreamEvent::AddTrack, track.id()),
                (StreamEvent::RemoveTrack, track.id())
            ]
        );

        stream.remove_listener(id);
        stream.add_track(&track);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn test_active_and_clone() {
        let (_backend, context) = setup();
        let input = BaseTrackInput::test_video(&context, VideoPattern::Smpte).unwrap();
        let track = MediaStreamTrack::new(&context, input.clone()).unwrap();
        let stream = MediaStream::new(&[track.clone()]);
        assert!(stream.active());

        let cloned = stream.clone_stream().unwrap();
        assert_ne!(cloned.get_tracks()[0].id(), track.id());
        assert_eq!(input.branch_count(), 2);

        track.stop();
        assert!(!stream.active());
        assert!(cloned.active());
        assert!(!MediaStream::new(&[]).active());
    }
}
