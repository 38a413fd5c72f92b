//! Device-side state machine for one scooter.
//!
//! A session owns the scooter's current position and battery. It waits for
//! dispatch commands, runs a [`Simulation`] toward each destination and
//! streams every sample back over the link. A newer dispatch replaces the
//! trip in flight, starting again from wherever the scooter is.

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::engine::{MotionProfile, Outcome, Simulation};
use crate::error::{LinkError, SessionError};
use crate::link::{FrameSink, FrameSource};
use crate::position::Position;
use crate::protocol::{
    DeviceFrame, DeviceState, ScooterId, ServerFrame, TelemetryMessage, TripId, TripReport,
};

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The kernel closed the link.
    Closed,
    /// Battery ran out mid-trip; the device shuts down.
    Discharged,
}

#[derive(Debug)]
pub struct DeviceSession {
    scooter_id: ScooterId,
    position: Position,
    battery: f64,
    profile: MotionProfile,
    trip: Option<Simulation>,
    trip_id: Option<TripId>,
}

impl DeviceSession {
    pub fn new(scooter_id: ScooterId, state: DeviceState, profile: MotionProfile) -> Self {
        Self {
            scooter_id,
            position: state.position,
            battery: state.battery,
            profile,
            trip: None,
            trip_id: None,
        }
    }

    /// Announces the device and waits for the kernel to assign its identity.
    pub async fn handshake<S, R>(
        sink: &mut S,
        source: &mut R,
        requested: Option<ScooterId>,
        profile: MotionProfile,
    ) -> Result<Self, SessionError>
    where
        S: FrameSink<DeviceFrame> + ?Sized,
        R: FrameSource<ServerFrame> + ?Sized,
    {
        sink.send(DeviceFrame::Hello {
            scooter_id: requested,
        })
        .await
        .map_err(|e| SessionError::Handshake(e.to_string()))?;

        loop {
            match source.recv().await {
                None => {
                    return Err(SessionError::Handshake(
                        "link closed before welcome".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(SessionError::Handshake(e.to_string())),
                Some(Ok(ServerFrame::Welcome { scooter_id, state })) => {
                    info!(
                        scooter_id,
                        lat = state.position.latitude,
                        lon = state.position.longitude,
                        battery = state.battery,
                        "device attached"
                    );
                    return Ok(Self::new(scooter_id, state, profile));
                }
                Some(Ok(ServerFrame::Rejected { reason })) => {
                    return Err(SessionError::Rejected(reason))
                }
                Some(Ok(frame)) => debug!(?frame, "ignoring frame before welcome"),
            }
        }
    }

    pub fn scooter_id(&self) -> ScooterId {
        self.scooter_id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn battery(&self) -> f64 {
        self.battery
    }

    pub fn is_moving(&self) -> bool {
        self.trip.is_some()
    }

    /// Starts a trip toward `destination`, dropping any trip in flight.
    /// `trip_id` is echoed in the report that ends this movement.
    pub fn dispatch(
        &mut self,
        destination: Position,
        trip_id: Option<TripId>,
    ) -> Result<(), SessionError> {
        let sim = Simulation::new(self.position, destination, self.battery, self.profile)?;
        if self.trip.is_some() {
            info!(
                scooter_id = self.scooter_id,
                lat = destination.latitude,
                lon = destination.longitude,
                "redirected"
            );
        } else {
            info!(
                scooter_id = self.scooter_id,
                lat = destination.latitude,
                lon = destination.longitude,
                "dispatched"
            );
        }
        self.trip = Some(sim);
        self.trip_id = trip_id;
        Ok(())
    }

    /// Drives the session until the link closes, the battery dies or the
    /// link breaks.
    pub async fn run<S, R>(
        mut self,
        sink: &mut S,
        source: &mut R,
    ) -> Result<SessionEnd, SessionError>
    where
        S: FrameSink<DeviceFrame> + ?Sized,
        R: FrameSource<ServerFrame> + ?Sized,
    {
        let interval = self.profile.tick_interval;
        let mut next_tick = Instant::now() + interval;

        loop {
            let moving = self.trip.is_some();
            tokio::select! {
                inbound = source.recv() => match inbound {
                    None => {
                        info!(scooter_id = self.scooter_id, "link closed by kernel");
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Err(LinkError::Codec(e))) => {
                        warn!(scooter_id = self.scooter_id, "dropping malformed frame: {e}");
                    }
                    Some(Err(error)) => {
                        return Err(SessionError::StreamBroken {
                            scooter_id: self.scooter_id,
                            source: error,
                        });
                    }
                    Some(Ok(ServerFrame::Dispatch(cmd))) => {
                        if cmd.scooter_id == self.scooter_id {
                            self.dispatch(cmd.destination, cmd.trip_id)?;
                            next_tick = Instant::now() + interval;
                        } else {
                            warn!(
                                scooter_id = self.scooter_id,
                                target = cmd.scooter_id,
                                "dispatch addressed to another scooter"
                            );
                        }
                    }
                    Some(Ok(frame)) => {
                        debug!(scooter_id = self.scooter_id, ?frame, "ignoring frame");
                    }
                },
                _ = sleep_until(next_tick), if moving => {
                    next_tick += interval;
                    if let Some(end) = self.tick(sink).await? {
                        return Ok(end);
                    }
                }
            }
        }
    }

    async fn tick<S>(&mut self, sink: &mut S) -> Result<Option<SessionEnd>, SessionError>
    where
        S: FrameSink<DeviceFrame> + ?Sized,
    {
        let (sample, outcome) = match self.trip.as_mut() {
            Some(sim) => (sim.next(), sim.outcome()),
            None => return Ok(None),
        };

        if let Some(sample) = sample {
            self.position = sample.position;
            self.battery = sample.battery;
            self.emit(
                sink,
                DeviceFrame::Telemetry(TelemetryMessage::new(self.scooter_id, sample.position)),
            )
            .await?;
        }

        let Some(outcome) = outcome else {
            return Ok(None);
        };
        self.trip = None;
        let trip_id = self.trip_id.take();
        info!(
            scooter_id = self.scooter_id,
            ?outcome,
            battery = self.battery,
            "trip ended"
        );
        self.emit(
            sink,
            DeviceFrame::TripEnded(TripReport {
                scooter_id: self.scooter_id,
                position: self.position,
                battery: self.battery,
                outcome,
                trip_id,
            }),
        )
        .await?;

        match outcome {
            Outcome::Arrived => Ok(None),
            Outcome::Discharged => Ok(Some(SessionEnd::Discharged)),
        }
    }

    async fn emit<S>(&self, sink: &mut S, frame: DeviceFrame) -> Result<(), SessionError>
    where
        S: FrameSink<DeviceFrame> + ?Sized,
    {
        sink.send(frame)
            .await
            .map_err(|source| SessionError::StreamBroken {
                scooter_id: self.scooter_id,
                source,
            })
    }
}
