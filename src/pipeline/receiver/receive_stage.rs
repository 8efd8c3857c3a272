//! Network stage: receives server packets and dispatches them
//!
//! Runs on its own thread. It is the sole producer into the shard queue, and
//! the only thread that replaces the decoder set or the audio bridge when the
//! server announces a new layout.

use crate::audio::AudioBridge;
use crate::net::packets::{
    AudioDescription, AudioStreamDescription, FromHeadset, TimesyncResponse, ToHeadset,
    VideoStreamDescription,
};
use crate::pipeline::receiver::coordinator::StreamShared;
use crate::pipeline::receiver::decode_stage::QueuedShard;
use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct NetworkStage {
    shared: Arc<StreamShared>,
    /// Layout generation shards are tagged with
    generation: u64,
    packets: u64,
    shards: u64,
}

impl NetworkStage {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        let generation = shared.lock_decoders().generation;
        Self {
            shared,
            generation,
            packets: 0,
            shards: 0,
        }
    }

    /// Thread body; returns once the stream is exiting or failed
    pub(crate) fn run(mut self) {
        info!("NetworkStage: started");
        let poll = self.shared.config.receive_poll_interval();
        let mut last_stats = Instant::now();

        while !self.shared.sos.cancelled() {
            match self.shared.session.receive(poll) {
                Ok(Some(packet)) => {
                    self.packets += 1;
                    if let Err(e) = self.dispatch(packet) {
                        self.shared.fail(e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("NetworkStage: receive failed: {:#}", e);
                    if self.shared.sos.wait_timeout(poll) {
                        break;
                    }
                }
            }

            self.forward_microphone();

            if last_stats.elapsed() >= STATS_INTERVAL {
                info!(
                    "NetworkStage: {} packets received ({} shards)",
                    self.packets, self.shards
                );
                last_stats = Instant::now();
            }
        }

        info!(
            "NetworkStage: finished ({} packets, {} shards)",
            self.packets, self.shards
        );
    }

    /// Handle one inbound packet. Errors are fatal for the stream.
    fn dispatch(&mut self, packet: ToHeadset) -> Result<()> {
        match packet {
            ToHeadset::Handshake(handshake) => {
                info!(
                    "NetworkStage: handshake from server (protocol {})",
                    handshake.protocol_version
                );
                self.send(FromHeadset::HeadsetInfo(self.shared.headset_info));
            }
            ToHeadset::VideoStreamDescription(description) => {
                self.apply_video_description(&description)?;
            }
            ToHeadset::VideoShard(shard) => {
                self.shards += 1;
                self.shared.health.record_shard(shard.payload.len());
                let queued = QueuedShard {
                    generation: self.generation,
                    received_at: Instant::now(),
                    shard,
                };
                if self.shared.queue.push(queued).is_err() {
                    debug!("NetworkStage: shard queue closed");
                }
            }
            ToHeadset::Haptics(haptics) => {
                self.shared.headset.apply_haptics(&haptics);
            }
            ToHeadset::TimesyncQuery(query) => {
                self.send(FromHeadset::TimesyncResponse(TimesyncResponse {
                    query: query.query,
                    response: self.shared.clock.now().nanos,
                }));
            }
            ToHeadset::AudioStreamDescription(description) => {
                self.apply_audio_description(description)?;
            }
            ToHeadset::AudioData(data) => {
                if let Some(bridge) = self.shared.lock_audio().as_ref() {
                    bridge.push_speaker(data);
                }
            }
        }
        Ok(())
    }

    fn apply_video_description(&mut self, description: &VideoStreamDescription) -> Result<()> {
        let shared = &self.shared;
        let mut decoders = shared.lock_decoders();
        decoders.rebuild(
            description,
            &shared.decoder_factory,
            &shared.health,
            &shared.clock,
            shared.config.shard_timeout(),
        )?;
        self.generation = decoders.generation;
        drop(decoders);

        shared.set_frame_rate(description.fps);
        info!(
            "NetworkStage: video layout {}x{} @ {} fps, {} sub-streams",
            description.width,
            description.height,
            description.fps,
            description.items.len()
        );
        Ok(())
    }

    fn apply_audio_description(&mut self, description: AudioStreamDescription) -> Result<()> {
        let shared = &self.shared;
        let mut audio = shared.lock_audio();
        if let Some(mut previous) = audio.take() {
            previous.close();
        }

        if description.speaker.is_none() && description.microphone.is_none() {
            info!("NetworkStage: audio disabled by server");
            return Ok(());
        }

        let advertised = shared.headset_info.audio;
        let negotiated = AudioDescription {
            speaker: description.speaker.unwrap_or(advertised.speaker),
            microphone: if advertised.microphone_enabled() {
                description.microphone
            } else {
                None
            },
        };

        *audio = Some(AudioBridge::start(
            &*shared.audio_backend,
            negotiated,
            &shared.config,
            shared.health.clone(),
            shared.clock.clone(),
        )?);
        Ok(())
    }

    fn forward_microphone(&self) {
        let frames = match self.shared.lock_audio().as_ref() {
            Some(bridge) => bridge.drain_microphone(),
            None => return,
        };
        for frame in frames {
            self.send(FromHeadset::AudioData(frame));
        }
    }

    fn send(&self, packet: FromHeadset) {
        if let Err(e) = self.shared.send(packet) {
            debug!("NetworkStage: send failed: {:#}", e);
        }
    }
}
