//! Session façade and its single-threaded event loop.
//!
//! [`SessionRegistry`] owns every peer record. Relay messages, connection
//! events, restart timers and UI commands all arrive as messages and are
//! handled one at a time, so per-peer ordering holds without locks.

use crate::commands::{Command, SessionHandle};
use crate::config::RtcConfig;
use crate::error::{Result, RtcError};
use crate::events::{ConnectionStatus, SessionEvents};
use crate::logger::dump_candidate;
use crate::media::{MediaDevices, MediaSource};
use crate::peer::connection::{PeerConnectionFactory, PeerEvent, PeerEventEnvelope, PeerEventSink};
use crate::peer::negotiator::{OfferOutcome, PeerNegotiator};
use crate::peer::state::NegotiationPhase;
use crate::peer::types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, SessionDescription,
    SignalingState,
};
use crate::quality::{EncodingParams, QualityController, QualityPreset};
use crate::resilience::{RecoveryAction, ResilienceController, RestartDue, RestartTimer};
use crate::signaling::{InboundSignal, OutboundSignal, SignalingLink};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Command queue depth between the UI handle and the loop.
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_id: String,
    pub local_id: PeerId,
}

struct PeerRecord {
    /// Distinguishes this record from an earlier one for the same peer.
    generation: u64,
    negotiator: PeerNegotiator,
    restart_timer: Option<RestartTimer>,
    status: ConnectionStatus,
    ice_state: IceConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub room_id: String,
    pub local_id: PeerId,
    pub audio: bool,
    pub video: bool,
    /// The session was already joined; nothing was done.
    pub already_joined: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub remote_id: PeerId,
    pub polite: bool,
    pub signaling_state: SignalingState,
    pub connection_state: PeerConnectionState,
    pub ice_state: IceConnectionState,
    pub phase: NegotiationPhase,
    pub status: ConnectionStatus,
    pub restart_pending: bool,
    pub restart_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub room_id: Option<String>,
    pub local_id: Option<PeerId>,
    pub status: ConnectionStatus,
    pub preset: QualityPreset,
    pub mic_enabled: Option<bool>,
    pub camera_enabled: Option<bool>,
    pub peers: Vec<PeerSnapshot>,
}

fn peer_status(state: PeerConnectionState) -> ConnectionStatus {
    match state {
        PeerConnectionState::Connected => ConnectionStatus::Connected,
        PeerConnectionState::New
        | PeerConnectionState::Connecting
        | PeerConnectionState::Disconnected => ConnectionStatus::Connecting,
        PeerConnectionState::Failed | PeerConnectionState::Closed => ConnectionStatus::Disconnected,
    }
}

pub struct SessionRegistry {
    config: RtcConfig,
    link: Arc<dyn SignalingLink>,
    factory: Arc<dyn PeerConnectionFactory>,
    media: MediaSource,
    quality: QualityController,
    resilience: ResilienceController,
    events: SessionEvents,
    session: Option<Session>,
    peers: HashMap<PeerId, PeerRecord>,
    peer_tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEventEnvelope>>,
    restart_rx: Option<mpsc::UnboundedReceiver<RestartDue>>,
    next_generation: u64,
    status: ConnectionStatus,
}

impl SessionRegistry {
    pub fn new(
        config: RtcConfig,
        link: Arc<dyn SignalingLink>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        events: SessionEvents,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (resilience, restart_rx) = ResilienceController::new(config.ice_restart_delay);
        let quality = QualityController::new(config.quality, config.max_video_bitrate);
        Self {
            config,
            link,
            factory,
            media: MediaSource::new(devices),
            quality,
            resilience,
            events,
            session: None,
            peers: HashMap::new(),
            peer_tx,
            peer_rx: Some(peer_rx),
            restart_rx: Some(restart_rx),
            next_generation: 0,
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ---- session operations -------------------------------------------

    /// Acquires local media and announces presence. A second call while
    /// joined does nothing. Missing media is tolerated: the session joins
    /// with whatever tracks could be opened.
    pub async fn join(&mut self, room_id: &str) -> Result<JoinOutcome> {
        if let Some(session) = &self.session {
            debug!(room = %session.room_id, "join ignored, already joined");
            return Ok(self.join_outcome(true));
        }
        let local_id = self.link.local_id().ok_or(RtcError::SignalingUnavailable)?;

        if let Err(e) = self.media.acquire().await {
            warn!(room = room_id, error = %e, "joining without local media");
        }

        self.session = Some(Session {
            room_id: room_id.to_string(),
            local_id: local_id.clone(),
        });
        info!(room = room_id, local = %local_id, "joined session");
        self.emit(OutboundSignal::Join {
            room: room_id.to_string(),
        });
        self.refresh_status();
        Ok(self.join_outcome(false))
    }

    fn join_outcome(&self, already_joined: bool) -> JoinOutcome {
        let stream = self.media.stream();
        JoinOutcome {
            room_id: self.session.as_ref().map(|s| s.room_id.clone()).unwrap_or_default(),
            local_id: self.session.as_ref().map(|s| s.local_id.clone()).unwrap_or_default(),
            audio: stream.map_or(false, |s| s.audio_track().is_some()),
            video: stream.map_or(false, |s| s.video_track().is_some()),
            already_joined,
        }
    }

    /// Tears everything down. Safe after a partial or failed join.
    pub async fn leave(&mut self) {
        let peers: Vec<(PeerId, PeerRecord)> = self.peers.drain().collect();
        for (remote_id, record) in peers {
            record.negotiator.close().await;
            debug!(peer = %remote_id, "peer closed on leave");
        }
        self.media.release();

        if let Some(session) = self.session.take() {
            info!(room = %session.room_id, "leaving session");
            self.emit(OutboundSignal::Leave {
                room: session.room_id,
            });
        }
        self.refresh_status();
    }

    pub fn toggle_mic(&mut self, enabled: bool) -> bool {
        self.media.set_mic_enabled(enabled)
    }

    /// Enables or disables the camera. A freshly acquired camera track is
    /// pushed to every connection; the resulting renegotiation runs
    /// through the connections' negotiation-needed events.
    pub async fn toggle_camera(&mut self, enabled: bool) -> Result<()> {
        let Some(track) = self.media.set_camera_enabled(enabled).await? else {
            return Ok(());
        };
        let stream_id = self.local_stream_id();
        for (remote_id, record) in self.peers.iter_mut() {
            match record.negotiator.attach_track(&track, &stream_id).await {
                Ok(sender) => {
                    if let Err(e) = self.quality.apply(sender.as_ref()).await {
                        warn!(peer = %remote_id, error = %e, "failed to apply quality to camera sender");
                    }
                }
                Err(e) => warn!(peer = %remote_id, error = %e, "failed to attach camera track"),
            }
        }
        Ok(())
    }

    /// Switches the preset and rewrites every video sender in place.
    pub async fn set_preset(&mut self, preset: QualityPreset) -> EncodingParams {
        let params = self.quality.set_preset(preset);
        for (remote_id, record) in self.peers.iter() {
            for sender in record.negotiator.video_senders() {
                if let Err(e) = self.quality.apply(sender.as_ref()).await {
                    warn!(peer = %remote_id, error = %e, "failed to update encoding parameters");
                }
            }
        }
        params
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let stream = self.media.stream();
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(remote_id, record)| PeerSnapshot {
                remote_id: remote_id.clone(),
                polite: record.negotiator.is_polite(),
                signaling_state: record.negotiator.signaling_state(),
                connection_state: record.negotiator.connection().connection_state(),
                ice_state: record.ice_state,
                phase: record.negotiator.phase(),
                status: record.status,
                restart_pending: record.restart_timer.is_some(),
                restart_requested: record.negotiator.restart_requested(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        SessionSnapshot {
            room_id: self.session.as_ref().map(|s| s.room_id.clone()),
            local_id: self.session.as_ref().map(|s| s.local_id.clone()),
            status: self.status,
            preset: self.quality.preset(),
            mic_enabled: stream.and_then(|s| s.audio_track()).map(|t| t.is_enabled()),
            camera_enabled: stream.and_then(|s| s.video_track()).map(|t| t.is_enabled()),
            peers,
        }
    }

    // ---- inbound relay traffic -----------------------------------------

    pub async fn handle_signal(&mut self, signal: InboundSignal) {
        let Some(session) = &self.session else {
            trace!(event = signal.name(), "signal before join dropped");
            return;
        };
        if signal.from() == session.local_id {
            trace!(event = signal.name(), "own signal echoed back, ignored");
            return;
        }
        debug!(event = signal.name(), peer = signal.from(), "signal received");

        match signal {
            InboundSignal::Joined { from } => {
                if self.peers.contains_key(&from) {
                    debug!(peer = %from, "already known, joined ignored");
                    return;
                }
                if let Err(e) = self.create_peer(&from).await {
                    warn!(peer = %from, error = %e, "failed to create peer");
                    return;
                }
                let offer = match self.peers.get_mut(&from) {
                    Some(record) => record.negotiator.on_negotiation_needed().await,
                    None => return,
                };
                self.after_negotiation(&from, offer);
            }
            InboundSignal::Offer { from, offer } => {
                if !self.peers.contains_key(&from) {
                    if let Err(e) = self.create_peer(&from).await {
                        warn!(peer = %from, error = %e, "failed to create peer for offer");
                        return;
                    }
                }
                let outcome = match self.peers.get_mut(&from) {
                    Some(record) => record.negotiator.on_remote_offer(offer).await,
                    None => return,
                };
                match outcome {
                    Ok(OfferOutcome::Answered(answer)) => {
                        self.send_answer(&from, answer);
                        // a restart rolled back by the collision is still owed
                        let follow_up = match self.peers.get_mut(&from) {
                            Some(record) => record.negotiator.follow_up().await,
                            None => return,
                        };
                        self.after_negotiation(&from, follow_up);
                    }
                    Ok(OfferOutcome::Ignored) => {}
                    Err(e) => warn!(peer = %from, error = %e, "failed to handle remote offer"),
                }
            }
            InboundSignal::Answer { from, answer } => {
                let Some(record) = self.peers.get_mut(&from) else {
                    debug!(peer = %from, "answer for unknown peer dropped");
                    return;
                };
                let follow_up = if record.negotiator.on_remote_answer(answer).await {
                    record.negotiator.follow_up().await
                } else {
                    Ok(None)
                };
                self.after_negotiation(&from, follow_up);
            }
            InboundSignal::Ice { from, candidate } => {
                let Some(record) = self.peers.get_mut(&from) else {
                    debug!(peer = %from, "candidate for unknown peer dropped");
                    return;
                };
                dump_candidate("remote", &from, &candidate);
                record.negotiator.on_remote_candidate(candidate).await;
            }
            InboundSignal::Left { from } => {
                if self.remove_peer(&from).await {
                    info!(peer = %from, "participant left");
                } else {
                    debug!(peer = %from, "left for unknown peer ignored");
                }
            }
        }
    }

    async fn create_peer(&mut self, remote_id: &str) -> Result<()> {
        let local_id = self
            .session
            .as_ref()
            .map(|s| s.local_id.clone())
            .ok_or(RtcError::NotJoined)?;

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(remote_id.to_string(), generation, self.peer_tx.clone());
        let connection = self.factory.create(sink).await?;

        let polite = self.config.politeness.is_polite(&local_id, remote_id);
        let mut negotiator = PeerNegotiator::new(remote_id.to_string(), connection, polite);
        let tracks = self.media.tracks();
        let stream_id = self.local_stream_id();
        if let Err(e) = negotiator.attach_local_media(&tracks, &stream_id).await {
            negotiator.close().await;
            return Err(e);
        }
        for sender in negotiator.video_senders() {
            if let Err(e) = self.quality.apply(sender.as_ref()).await {
                warn!(peer = remote_id, error = %e, "failed to apply quality to new sender");
            }
        }

        let record = PeerRecord {
            generation,
            negotiator,
            restart_timer: None,
            status: ConnectionStatus::Connecting,
            ice_state: IceConnectionState::New,
        };
        self.peers.insert(remote_id.to_string(), record);
        info!(peer = remote_id, polite, generation, tracks = tracks.len(), "peer created");
        self.events.emit_participant_joined(remote_id);
        self.refresh_status();
        Ok(())
    }

    /// Removes a record, closing its connection and dropping its timer.
    /// Returns false when there was nothing to remove.
    async fn remove_peer(&mut self, remote_id: &str) -> bool {
        let Some(record) = self.peers.remove(remote_id) else {
            return false;
        };
        record.negotiator.close().await;
        drop(record);
        self.events.emit_participant_left(remote_id);
        self.refresh_status();
        true
    }

    // ---- connection events ---------------------------------------------

    pub async fn handle_peer_event(&mut self, envelope: PeerEventEnvelope) {
        let PeerEventEnvelope {
            remote_id,
            generation,
            event,
        } = envelope;
        let Some(record) = self.peers.get_mut(&remote_id) else {
            trace!(peer = %remote_id, ?event, "event for removed peer dropped");
            return;
        };
        if record.generation != generation {
            trace!(peer = %remote_id, generation, "event from replaced connection dropped");
            return;
        }

        match event {
            PeerEvent::NegotiationNeeded => {
                let offer = record.negotiator.on_negotiation_needed().await;
                self.after_negotiation(&remote_id, offer);
            }
            PeerEvent::LocalCandidate(candidate) => {
                dump_candidate("local", &remote_id, &candidate);
                self.send_candidate(&remote_id, candidate);
            }
            PeerEvent::IceConnectionState(state) => {
                record.ice_state = state;
                let action =
                    self.resilience
                        .on_ice_state(&remote_id, generation, &mut record.restart_timer, state);
                debug!(peer = %remote_id, ?state, ?action, "ICE connection state");
            }
            PeerEvent::ConnectionState(state) => {
                if self.resilience.on_connection_state(state) == RecoveryAction::Teardown {
                    warn!(peer = %remote_id, ?state, "connection lost, removing peer");
                    self.remove_peer(&remote_id).await;
                    return;
                }
                let status = peer_status(state);
                if record.status != status {
                    record.status = status;
                    self.events.emit_peer_status(&remote_id, status);
                    self.refresh_status();
                }
            }
            PeerEvent::Track(track) => {
                if let Some(stream) = record.negotiator.on_remote_track(track).await {
                    self.events.emit_stream(&remote_id, stream);
                }
            }
        }
    }

    pub async fn handle_restart_due(&mut self, due: RestartDue) {
        let Some(record) = self.peers.get_mut(&due.remote_id) else {
            trace!(peer = %due.remote_id, "restart for removed peer dropped");
            return;
        };
        if record.generation != due.generation
            || !ResilienceController::is_current(&record.restart_timer, &due)
        {
            trace!(peer = %due.remote_id, timer = due.timer_id, "stale restart timer");
            return;
        }
        record.restart_timer = None;
        let offer = record.negotiator.restart_ice().await;
        self.after_negotiation(&due.remote_id, offer);
    }

    // ---- outbound --------------------------------------------------------

    fn after_negotiation(&self, remote_id: &str, result: Result<Option<SessionDescription>>) {
        match result {
            Ok(Some(offer)) => self.send_offer(remote_id, offer),
            Ok(None) => {}
            Err(e) => warn!(peer = remote_id, error = %e, "negotiation failed"),
        }
    }

    fn send_offer(&self, remote_id: &str, offer: SessionDescription) {
        if let Some(room) = self.room_for(remote_id) {
            self.emit(OutboundSignal::Offer {
                room,
                to: remote_id.to_string(),
                offer,
            });
        }
    }

    fn send_answer(&self, remote_id: &str, answer: SessionDescription) {
        if let Some(room) = self.room_for(remote_id) {
            self.emit(OutboundSignal::Answer {
                room,
                to: remote_id.to_string(),
                answer,
            });
        }
    }

    fn send_candidate(&self, remote_id: &str, candidate: IceCandidate) {
        if let Some(room) = self.room_for(remote_id) {
            self.emit(OutboundSignal::Ice {
                room,
                to: remote_id.to_string(),
                candidate,
            });
        }
    }

    /// Room to address a peer in, or None when the peer is gone and the
    /// send must be skipped.
    fn room_for(&self, remote_id: &str) -> Option<String> {
        let session = self.session.as_ref()?;
        if !self.peers.contains_key(remote_id) {
            debug!(peer = remote_id, "peer gone, outbound signal skipped");
            return None;
        }
        Some(session.room_id.clone())
    }

    fn emit(&self, msg: OutboundSignal) {
        let name = msg.name();
        if let Err(e) = self.link.emit(msg) {
            warn!(event = name, error = %e, "signal not sent");
        }
    }

    fn local_stream_id(&self) -> String {
        self.media
            .stream()
            .map(|s| s.id().to_string())
            .unwrap_or_default()
    }

    fn refresh_status(&mut self) {
        let status = if self.session.is_none() {
            ConnectionStatus::Disconnected
        } else if self
            .peers
            .values()
            .any(|r| r.status == ConnectionStatus::Connected)
        {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Connecting
        };
        if status != self.status {
            self.status = status;
            self.events.emit_status(status);
        }
    }

    // ---- loop --------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room_id, reply } => {
                let _ = reply.send(self.join(&room_id).await);
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::ToggleMic { enabled, reply } => {
                let _ = reply.send(self.toggle_mic(enabled));
            }
            Command::ToggleCamera { enabled, reply } => {
                let _ = reply.send(self.toggle_camera(enabled).await);
            }
            Command::SetPreset { preset, reply } => {
                let _ = reply.send(self.set_preset(preset).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
        }
    }

    /// Runs the session until every [`SessionHandle`] is dropped or a
    /// shutdown command arrives. Leaves the room on the way out.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundSignal>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let (Some(mut peer_rx), Some(mut restart_rx)) = (self.peer_rx.take(), self.restart_rx.take())
        else {
            error!("session loop started twice");
            return;
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        let shutdown = matches!(command, Command::Shutdown { .. });
                        self.handle_command(command).await;
                        if shutdown {
                            break;
                        }
                    }
                    None => {
                        self.leave().await;
                        break;
                    }
                },
                Some(signal) = inbound.recv() => self.handle_signal(signal).await,
                Some(envelope) = peer_rx.recv() => self.handle_peer_event(envelope).await,
                Some(due) = restart_rx.recv() => self.handle_restart_due(due).await,
            }
        }
        debug!("session loop stopped");
    }

    /// Spawns the loop on the current runtime.
    pub fn spawn(
        self,
        inbound: mpsc::UnboundedReceiver<InboundSignal>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(self.run(inbound, rx));
        (SessionHandle::new(tx), task)
    }
}
