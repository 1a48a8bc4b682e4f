//! Per-peer offer/answer state machine ("perfect negotiation").
//!
//! Both sides may decide to renegotiate at the same time. The polite side
//! resolves a collision by rolling back its own offer and answering the
//! remote one; the impolite side drops the colliding offer and waits for
//! its own offer to be answered.

use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::connection::{MediaSender, PeerConnection};
use crate::peer::sdp;
use crate::peer::state::NegotiationPhase;
use crate::peer::types::{PeerId, RemoteStream, RemoteTrack, SessionDescription, SignalingState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The offer was applied; this answer must be sent back.
    Answered(SessionDescription),
    /// Colliding offer dropped by the impolite side.
    Ignored,
}

/// Groups remote tracks by media group and decides when a composite
/// stream is complete enough to report.
#[derive(Debug, Default)]
struct RemoteStreams {
    groups: HashMap<String, Vec<RemoteTrack>>,
    reported: HashMap<String, Vec<String>>,
}

impl RemoteStreams {
    fn add(&mut self, track: RemoteTrack, expected: Option<usize>) -> Option<RemoteStream> {
        let stream_id = track.stream_id.clone();
        let group = self.groups.entry(stream_id.clone()).or_default();
        match group.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => group.push(track),
        }

        if group.len() < expected.unwrap_or(1) {
            return None;
        }
        let ids: Vec<String> = group.iter().map(|t| t.id.clone()).collect();
        if self.reported.get(&stream_id) == Some(&ids) {
            return None;
        }
        self.reported.insert(stream_id.clone(), ids);
        Some(RemoteStream {
            id: stream_id,
            tracks: group.clone(),
        })
    }
}

pub struct PeerNegotiator {
    remote_id: PeerId,
    connection: Arc<dyn PeerConnection>,
    polite: bool,
    phase: NegotiationPhase,
    ice_restart: bool,
    restart_in_flight: bool,
    senders: Vec<Arc<dyn MediaSender>>,
    streams: RemoteStreams,
}

impl PeerNegotiator {
    pub fn new(remote_id: PeerId, connection: Arc<dyn PeerConnection>, polite: bool) -> Self {
        Self {
            remote_id,
            connection,
            polite,
            phase: NegotiationPhase::Stable,
            ice_restart: false,
            restart_in_flight: false,
            senders: Vec::new(),
            streams: RemoteStreams::default(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    /// True while an ICE restart is requested but not yet answered.
    pub fn restart_requested(&self) -> bool {
        self.ice_restart
    }

    pub fn senders(&self) -> &[Arc<dyn MediaSender>] {
        &self.senders
    }

    pub fn video_senders(&self) -> impl Iterator<Item = &Arc<dyn MediaSender>> {
        self.senders.iter().filter(|s| s.kind() == TrackKind::Video)
    }

    /// Attaches the whole local track set before any signaling, so the first
    /// offer already carries every track. Without a local microphone a bare
    /// audio transceiver keeps the first negotiation predictable.
    pub async fn attach_local_media(&mut self, tracks: &[LocalTrack], stream_id: &str) -> Result<()> {
        for track in tracks {
            self.attach_track(track, stream_id).await?;
        }
        if !tracks.iter().any(|t| t.kind() == TrackKind::Audio) {
            self.connection.add_transceiver(TrackKind::Audio).await?;
        }
        Ok(())
    }

    /// Adds a track, or swaps it into an existing sender of the same kind.
    pub async fn attach_track(
        &mut self,
        track: &LocalTrack,
        stream_id: &str,
    ) -> Result<Arc<dyn MediaSender>> {
        if let Some(sender) = self.senders.iter().find(|s| s.kind() == track.kind()) {
            if sender.track_id().as_deref() != Some(track.id()) {
                sender.replace_track(track).await?;
                debug!(peer = %self.remote_id, track = track.id(), "track replaced");
            }
            return Ok(sender.clone());
        }

        let sender = self.connection.add_track(track, stream_id).await?;
        debug!(peer = %self.remote_id, track = track.id(), kind = %track.kind(), "track attached");
        self.senders.push(sender.clone());
        Ok(sender)
    }

    /// Handles a renegotiation-needed signal. Returns the offer to send, if
    /// one was produced.
    pub async fn on_negotiation_needed(&mut self) -> Result<Option<SessionDescription>> {
        if self.phase != NegotiationPhase::Stable
            || self.connection.signaling_state() != SignalingState::Stable
        {
            debug!(peer = %self.remote_id, phase = ?self.phase, "negotiation deferred, not stable");
            return Ok(None);
        }
        if !self.ice_restart && !self.connection.needs_negotiation().await {
            return Ok(None);
        }
        self.make_offer().await.map(Some)
    }

    /// Requests an ICE restart through the regular renegotiation path.
    pub async fn restart_ice(&mut self) -> Result<Option<SessionDescription>> {
        info!(peer = %self.remote_id, "ICE restart requested");
        self.ice_restart = true;
        self.on_negotiation_needed().await
    }

    /// Offers again if an ICE restart is still owed after an exchange
    /// settled.
    pub async fn follow_up(&mut self) -> Result<Option<SessionDescription>> {
        if self.ice_restart && !self.restart_in_flight {
            self.on_negotiation_needed().await
        } else {
            Ok(None)
        }
    }

    async fn make_offer(&mut self) -> Result<SessionDescription> {
        let connection = self.connection.clone();
        let ice_restart = self.ice_restart;

        self.phase = NegotiationPhase::MakingOffer;
        let result = async move {
            let offer = connection.create_offer(ice_restart).await?;
            connection.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;
        self.phase = NegotiationPhase::Stable;

        if result.is_ok() {
            self.restart_in_flight = ice_restart;
            debug!(peer = %self.remote_id, ice_restart, "local offer applied");
        }
        result
    }

    pub async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<OfferOutcome> {
        let state = self.connection.signaling_state();
        let ready = state == SignalingState::Stable
            || self.phase == NegotiationPhase::AwaitingAnswerApplication;
        let collision = self.phase == NegotiationPhase::MakingOffer || !ready;

        if collision && !self.polite {
            info!(peer = %self.remote_id, ?state, "ignoring colliding offer");
            return Ok(OfferOutcome::Ignored);
        }

        if collision {
            debug!(peer = %self.remote_id, ?state, "offer collision, rolling back local offer");
            self.connection
                .set_local_description(SessionDescription::rollback())
                .await?;
            self.phase = NegotiationPhase::Stable;
            self.restart_in_flight = false;
        }

        let previous_ufrag = self
            .connection
            .remote_description()
            .await
            .and_then(|d| sdp::ice_ufrag(&d.sdp).map(str::to_string));
        let offered_ufrag = sdp::ice_ufrag(&offer.sdp).map(str::to_string);

        self.connection.set_remote_description(offer).await?;
        if previous_ufrag.is_some() && previous_ufrag != offered_ufrag && self.ice_restart {
            // answering a remote restart already renews our credentials
            debug!(peer = %self.remote_id, "remote offer restarted ICE, local restart dropped");
            self.ice_restart = false;
            self.restart_in_flight = false;
        }
        let answer = self.connection.create_answer().await?;

        self.phase = NegotiationPhase::AwaitingAnswerApplication;
        let applied = self.connection.set_local_description(answer.clone()).await;
        self.phase = NegotiationPhase::Stable;
        applied?;

        debug!(peer = %self.remote_id, "remote offer answered");
        Ok(OfferOutcome::Answered(answer))
    }

    /// Applies an answer to our outstanding offer. Answers that do not match
    /// a pending local offer are dropped.
    pub async fn on_remote_answer(&mut self, answer: SessionDescription) -> bool {
        let state = self.connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!(peer = %self.remote_id, ?state, "dropping answer without pending offer");
            return false;
        }
        if let Err(e) = self.connection.set_remote_description(answer).await {
            warn!(peer = %self.remote_id, error = %e, "failed to apply remote answer");
            return false;
        }
        if self.restart_in_flight {
            self.ice_restart = false;
            self.restart_in_flight = false;
        }
        debug!(peer = %self.remote_id, "remote answer applied");
        true
    }

    pub async fn on_remote_candidate(&mut self, candidate: crate::peer::types::IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            debug!(peer = %self.remote_id, error = %e, "remote candidate rejected");
        }
    }

    /// Groups an incoming track with its siblings. Returns the composite
    /// stream once every track the remote announced for its group is here.
    pub async fn on_remote_track(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        let expected = self
            .connection
            .remote_description()
            .await
            .and_then(|d| sdp::tracks_per_stream(&d.sdp).get(&track.stream_id).copied());
        debug!(
            peer = %self.remote_id,
            track = %track.id,
            kind = %track.kind,
            stream = %track.stream_id,
            ?expected,
            "remote track"
        );
        self.streams.add(track, expected)
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!(peer = %self.remote_id, error = %e, "error while closing connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnectionFactory, MockPeerConnection};
    use crate::peer::connection::{PeerConnectionFactory, PeerEventSink};
    use tokio::sync::mpsc;

    async fn negotiator(
        factory: &MockConnectionFactory,
        remote: &str,
        polite: bool,
    ) -> (PeerNegotiator, Arc<MockPeerConnection>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(remote.to_string(), 1, tx);
        let conn = factory.create(sink).await.unwrap();
        let mock = factory.last().unwrap();
        (PeerNegotiator::new(remote.to_string(), conn, polite), mock)
    }

    fn mic() -> LocalTrack {
        LocalTrack::new(TrackKind::Audio, "mic")
    }

    #[tokio::test]
    async fn offer_is_made_when_tracks_change() {
        let factory = MockConnectionFactory::new();
        let (mut a, conn) = negotiator(&factory, "b", true).await;
        a.attach_local_media(&[mic()], "s1").await.unwrap();

        let offer = a.on_negotiation_needed().await.unwrap().unwrap();
        assert_eq!(offer.sdp_type, crate::peer::types::SdpType::Offer);
        assert_eq!(conn.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(a.phase(), NegotiationPhase::Stable);

        // nothing new to offer while waiting for the answer
        assert!(a.on_negotiation_needed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn polite_side_rolls_back_on_collision() {
        let factory = MockConnectionFactory::new();
        let (mut a, a_conn) = negotiator(&factory, "b", true).await;
        let (mut b, _b_conn) = negotiator(&factory, "a", false).await;
        a.attach_local_media(&[mic()], "sa").await.unwrap();
        b.attach_local_media(&[mic()], "sb").await.unwrap();

        let offer_a = a.on_negotiation_needed().await.unwrap().unwrap();
        let offer_b = b.on_negotiation_needed().await.unwrap().unwrap();

        // impolite b drops a's offer
        assert_eq!(b.on_remote_offer(offer_a).await.unwrap(), OfferOutcome::Ignored);
        // polite a rolls back and answers
        let OfferOutcome::Answered(answer) = a.on_remote_offer(offer_b).await.unwrap() else {
            panic!("polite side must answer");
        };
        assert_eq!(a_conn.rollbacks(), 1);
        assert!(b.on_remote_answer(answer).await);

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn stray_answer_is_dropped() {
        let factory = MockConnectionFactory::new();
        let (mut a, _) = negotiator(&factory, "b", true).await;
        assert!(!a.on_remote_answer(SessionDescription::answer("v=0\r\n")).await);
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn restart_flag_survives_until_answered() {
        let factory = MockConnectionFactory::new();
        let (mut a, a_conn) = negotiator(&factory, "b", true).await;
        let (mut b, _) = negotiator(&factory, "a", false).await;
        a.attach_local_media(&[mic()], "sa").await.unwrap();

        let offer = a.on_negotiation_needed().await.unwrap().unwrap();
        let OfferOutcome::Answered(answer) = b.on_remote_offer(offer).await.unwrap() else {
            panic!("expected answer");
        };
        assert!(a.on_remote_answer(answer).await);

        let restart = a.restart_ice().await.unwrap().unwrap();
        assert!(a.restart_requested());
        assert_eq!(a_conn.ice_restarts(), 1);
        let OfferOutcome::Answered(answer) = b.on_remote_offer(restart).await.unwrap() else {
            panic!("expected answer");
        };
        assert!(a.on_remote_answer(answer).await);
        assert!(!a.restart_requested());
    }

    async fn connected_pair(
        factory: &MockConnectionFactory,
    ) -> (PeerNegotiator, Arc<MockPeerConnection>, PeerNegotiator) {
        let (mut a, a_conn) = negotiator(factory, "b", true).await;
        let (mut b, _) = negotiator(factory, "a", false).await;
        a.attach_local_media(&[mic()], "sa").await.unwrap();
        b.attach_local_media(&[mic()], "sb").await.unwrap();

        let offer = a.on_negotiation_needed().await.unwrap().unwrap();
        let OfferOutcome::Answered(answer) = b.on_remote_offer(offer).await.unwrap() else {
            panic!("expected answer");
        };
        assert!(a.on_remote_answer(answer).await);
        (a, a_conn, b)
    }

    #[tokio::test]
    async fn rolled_back_restart_is_offered_again() {
        let factory = MockConnectionFactory::new();
        let (mut a, a_conn, mut b) = connected_pair(&factory).await;

        let _lost = a.restart_ice().await.unwrap().unwrap();
        b.attach_track(&LocalTrack::new(TrackKind::Video, "cam"), "sb")
            .await
            .unwrap();
        let offer_b = b.on_negotiation_needed().await.unwrap().unwrap();

        let OfferOutcome::Answered(answer) = a.on_remote_offer(offer_b).await.unwrap() else {
            panic!("polite side must answer");
        };
        assert!(b.on_remote_answer(answer).await);
        assert!(a.restart_requested());

        let restart = a.follow_up().await.unwrap().expect("restart offer owed");
        assert_eq!(a_conn.ice_restarts(), 2);
        let OfferOutcome::Answered(answer) = b.on_remote_offer(restart).await.unwrap() else {
            panic!("expected answer");
        };
        assert!(a.on_remote_answer(answer).await);
        assert!(!a.restart_requested());
        assert!(a.follow_up().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_restart_settles_local_restart() {
        let factory = MockConnectionFactory::new();
        let (mut a, _, mut b) = connected_pair(&factory).await;

        let _lost = a.restart_ice().await.unwrap().unwrap();
        let restart_b = b.restart_ice().await.unwrap().unwrap();

        let OfferOutcome::Answered(answer) = a.on_remote_offer(restart_b).await.unwrap() else {
            panic!("polite side must answer");
        };
        assert!(!a.restart_requested());
        assert!(a.follow_up().await.unwrap().is_none());
        assert!(b.on_remote_answer(answer).await);
        assert!(!b.restart_requested());
    }

    #[tokio::test]
    async fn camera_track_replaces_into_existing_sender() {
        let factory = MockConnectionFactory::new();
        let (mut a, conn) = negotiator(&factory, "b", true).await;
        let first = LocalTrack::new(TrackKind::Video, "cam");
        let second = LocalTrack::new(TrackKind::Video, "cam2");

        a.attach_track(&first, "s").await.unwrap();
        a.attach_track(&second, "s").await.unwrap();

        assert_eq!(a.senders().len(), 1);
        assert_eq!(a.senders()[0].track_id().as_deref(), Some(second.id()));
        assert_eq!(conn.local_track_ids().len(), 1);
    }

    #[test]
    fn composite_stream_waits_for_siblings() {
        let mut streams = RemoteStreams::default();
        let audio = RemoteTrack {
            id: "a1".into(),
            kind: TrackKind::Audio,
            stream_id: "s".into(),
        };
        let video = RemoteTrack {
            id: "v1".into(),
            kind: TrackKind::Video,
            stream_id: "s".into(),
        };

        assert!(streams.add(audio.clone(), Some(2)).is_none());
        let stream = streams.add(video, Some(2)).unwrap();
        assert_eq!(stream.tracks.len(), 2);
        // re-delivery of a known track does not report again
        assert!(streams.add(audio, Some(2)).is_none());
    }
}
