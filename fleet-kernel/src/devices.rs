/**
 * DEVICE GATEWAY - kernel side of one device connection
 *
 * `serve_device` speaks the device protocol over any frame sink/source pair:
 * the websocket route and the embedded simulated devices both go through it.
 *
 * Connection lifecycle:
 * 1. device sends hello, optionally naming its scooter id
 * 2. kernel claims that slot, or the first free one, and answers welcome
 *    with the stored position and battery
 * 3. dispatches flow down, telemetry and trip reports flow up
 * 4. on disconnect the slot is released and any pending trip interrupted
 */

use std::sync::Arc;
use std::time::Duration;

use fleet_sim::link::pair;
use fleet_sim::{
    DeviceFrame, DeviceSession, DeviceState, FrameSink, FrameSource, LinkError, MotionProfile,
    ScooterId, ServerFrame,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;
use crate::registry::{CommandReceiver, Registration, StreamRegistry};
use crate::storage::FleetStore;

pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered per direction on in-process links.
const EMBEDDED_LINK_BUFFER: usize = 32;

/// Serves one device connection until it closes. Returns the scooter id the
/// device held.
pub async fn serve_device<S, R>(
    registry: &StreamRegistry,
    store: &dyn FleetStore,
    sink: &mut S,
    source: &mut R,
) -> Result<ScooterId, DeviceError>
where
    S: FrameSink<ServerFrame> + ?Sized,
    R: FrameSource<DeviceFrame> + ?Sized,
{
    let requested = match timeout(HELLO_TIMEOUT, source.recv()).await {
        Ok(Some(Ok(DeviceFrame::Hello { scooter_id }))) => scooter_id,
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Err(LinkError::Closed.into()),
        Ok(Some(Ok(_))) | Err(_) => {
            reject(sink, "expected hello").await;
            return Err(DeviceError::NoHello);
        }
    };

    let (registration, mut commands) = match claim(registry, store, requested).await {
        Ok(claimed) => claimed,
        Err(e) => {
            warn!(?requested, "device refused: {e}");
            reject(sink, &e.to_string()).await;
            return Err(e);
        }
    };
    let scooter_id = registration.scooter_id();

    let scooter = store.get_scooter(scooter_id).await?;
    let position = registry
        .last_known(scooter_id)
        .map(|live| live.position)
        .unwrap_or(scooter.position);
    sink.send(ServerFrame::Welcome {
        scooter_id,
        state: DeviceState {
            position,
            battery: scooter.battery_percent,
        },
    })
    .await?;
    info!(scooter_id, connection_id = %registration.connection_id(), "device connected");

    let result = pump(registry, scooter_id, &mut commands, sink, source).await;
    drop(registration);
    match &result {
        Ok(()) => info!(scooter_id, "device disconnected"),
        Err(e) => warn!(scooter_id, "device stream broken: {e}"),
    }
    result.map(|()| scooter_id)
}

async fn claim(
    registry: &StreamRegistry,
    store: &dyn FleetStore,
    requested: Option<ScooterId>,
) -> Result<(Registration, CommandReceiver), DeviceError> {
    match requested {
        Some(id) => {
            store.get_scooter(id).await?;
            Ok(registry.register(id)?)
        }
        None => {
            let ids: Vec<ScooterId> = store.list_scooters().await?.iter().map(|s| s.id).collect();
            Ok(registry.register_first_free(ids)?)
        }
    }
}

async fn reject<S>(sink: &mut S, reason: &str)
where
    S: FrameSink<ServerFrame> + ?Sized,
{
    let frame = ServerFrame::Rejected {
        reason: reason.to_string(),
    };
    if let Err(e) = sink.send(frame).await {
        debug!("could not deliver rejection: {e}");
    }
}

async fn pump<S, R>(
    registry: &StreamRegistry,
    scooter_id: ScooterId,
    commands: &mut CommandReceiver,
    sink: &mut S,
    source: &mut R,
) -> Result<(), DeviceError>
where
    S: FrameSink<ServerFrame> + ?Sized,
    R: FrameSource<DeviceFrame> + ?Sized,
{
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => sink.send(ServerFrame::Dispatch(cmd)).await?,
                None => {
                    info!(scooter_id, "session removed from registry");
                    return Ok(());
                }
            },
            inbound = source.recv() => match inbound {
                None => return Ok(()),
                Some(Ok(DeviceFrame::Telemetry(msg))) if msg.scooter_id == scooter_id => {
                    registry.on_telemetry(msg);
                }
                Some(Ok(DeviceFrame::TripEnded(report))) if report.scooter_id == scooter_id => {
                    registry.on_trip_ended(report);
                }
                Some(Ok(frame)) => warn!(scooter_id, ?frame, "unexpected frame"),
                Some(Err(LinkError::Codec(e))) => {
                    warn!(scooter_id, "dropping malformed frame: {e}");
                }
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

/// Runs `count` simulated scooters inside the kernel, each on an in-memory
/// link. Each one takes the first free scooter slot.
pub fn spawn_embedded_devices(
    count: usize,
    registry: &StreamRegistry,
    store: Arc<dyn FleetStore>,
    profile: MotionProfile,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count * 2);
    for n in 0..count {
        let (mut device, mut server) = pair(EMBEDDED_LINK_BUFFER);

        let registry = registry.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let served =
                serve_device(&registry, store.as_ref(), &mut server.sink, &mut server.source).await;
            if let Err(e) = served {
                debug!(device = n, "embedded gateway ended: {e}");
            }
        }));

        handles.push(tokio::spawn(async move {
            let handshake =
                DeviceSession::handshake(&mut device.sink, &mut device.source, None, profile);
            let session = match handshake.await {
                Ok(session) => session,
                Err(e) => {
                    error!(device = n, "embedded device not attached: {e}");
                    return;
                }
            };
            let scooter_id = session.scooter_id();
            match session.run(&mut device.sink, &mut device.source).await {
                Ok(end) => info!(scooter_id, ?end, "embedded device stopped"),
                Err(e) => warn!(scooter_id, "embedded device failed: {e}"),
            }
        }));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LiveHub;
    use crate::models::ScooterState;
    use crate::storage::MemoryStore;
    use fleet_sim::link::ServerEnd;
    use fleet_sim::{DispatchCommand, Outcome, Position, TelemetryMessage, TripReport};

    fn fleet() -> (StreamRegistry, Arc<MemoryStore>) {
        let scooters = (1..=2)
            .map(|id| ScooterState {
                id,
                model: "Segway".into(),
                position: Position::new(0.0, 0.0),
                battery_percent: 70.0,
                station_id: None,
            })
            .collect();
        (
            StreamRegistry::new(LiveHub::new(8)),
            Arc::new(MemoryStore::new(scooters, Vec::new())),
        )
    }

    fn spawn_gateway(
        registry: &StreamRegistry,
        store: &Arc<MemoryStore>,
        mut server: ServerEnd,
    ) -> JoinHandle<Result<ScooterId, DeviceError>> {
        let registry = registry.clone();
        let store = store.clone();
        tokio::spawn(async move {
            serve_device(&registry, store.as_ref(), &mut server.sink, &mut server.source).await
        })
    }

    #[tokio::test]
    async fn test_welcome_carries_stored_state() {
        let (registry, store) = fleet();
        let (mut device, server) = pair(8);
        let gateway = spawn_gateway(&registry, &store, server);

        device.sink.send(DeviceFrame::Hello { scooter_id: Some(2) }).await.unwrap();
        let welcome = device.source.recv().await.unwrap();
        assert_eq!(
            welcome,
            ServerFrame::Welcome {
                scooter_id: 2,
                state: DeviceState {
                    position: Position::new(0.0, 0.0),
                    battery: 70.0,
                },
            }
        );
        assert!(registry.is_connected(2));

        drop(device);
        assert_eq!(gateway.await.unwrap().unwrap(), 2);
        assert!(!registry.is_connected(2));
    }

    #[tokio::test]
    async fn test_duplicate_scooter_is_rejected() {
        let (registry, store) = fleet();
        let (_guard, _rx) = registry.register(1).unwrap();
        let (mut device, server) = pair(8);
        let gateway = spawn_gateway(&registry, &store, server);

        device.sink.send(DeviceFrame::Hello { scooter_id: Some(1) }).await.unwrap();
        assert!(matches!(device.source.recv().await, Some(ServerFrame::Rejected { .. })));
        assert!(matches!(
            gateway.await.unwrap(),
            Err(DeviceError::Registry(crate::error::RegistryError::AlreadyRegistered(1)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_scooter_is_rejected() {
        let (registry, store) = fleet();
        let (mut device, server) = pair(8);
        let gateway = spawn_gateway(&registry, &store, server);

        device.sink.send(DeviceFrame::Hello { scooter_id: Some(42) }).await.unwrap();
        assert!(matches!(device.source.recv().await, Some(ServerFrame::Rejected { .. })));
        assert!(matches!(gateway.await.unwrap(), Err(DeviceError::Store(_))));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let (registry, store) = fleet();
        let (mut device, server) = pair(8);
        let gateway = spawn_gateway(&registry, &store, server);

        device
            .sink
            .send(DeviceFrame::Telemetry(TelemetryMessage::new(1, Position::new(0.0, 0.0))))
            .await
            .unwrap();
        assert!(matches!(device.source.recv().await, Some(ServerFrame::Rejected { .. })));
        assert!(matches!(gateway.await.unwrap(), Err(DeviceError::NoHello)));
    }

    #[tokio::test]
    async fn test_frames_flow_through_registry() {
        let (registry, store) = fleet();
        let mut viewer = registry.hub().subscribe();
        let (mut device, server) = pair(8);
        let _gateway = spawn_gateway(&registry, &store, server);

        device.sink.send(DeviceFrame::Hello { scooter_id: None }).await.unwrap();
        let Some(ServerFrame::Welcome { scooter_id, .. }) = device.source.recv().await else {
            panic!("expected welcome");
        };
        assert_eq!(scooter_id, 1);

        let ticket = registry.begin_trip(1).unwrap();
        let trip_id = ticket.trip_id();
        registry.dispatch(1, Position::new(0.5, 0.5), Some(trip_id)).unwrap();
        assert_eq!(
            device.source.recv().await,
            Some(ServerFrame::Dispatch(DispatchCommand {
                scooter_id: 1,
                destination: Position::new(0.5, 0.5),
                trip_id: Some(trip_id),
            }))
        );

        device
            .sink
            .send(DeviceFrame::Telemetry(TelemetryMessage::new(1, Position::new(0.1, 0.1))))
            .await
            .unwrap();
        assert_eq!(viewer.recv().await.unwrap().latitude, 0.1);

        let report = TripReport {
            scooter_id: 1,
            position: Position::new(0.5, 0.5),
            battery: 60.0,
            outcome: Outcome::Arrived,
            trip_id: Some(trip_id),
        };
        device.sink.send(DeviceFrame::TripEnded(report)).await.unwrap();
        assert_eq!(
            ticket.wait(Duration::from_secs(1)).await,
            crate::registry::TripSignal::Ended(report)
        );
    }

    #[tokio::test]
    async fn test_embedded_devices_claim_distinct_slots() {
        let (registry, store) = fleet();
        let profile = MotionProfile::instant(0.0001, 0.1);
        let handles = spawn_embedded_devices(2, &registry, store.clone(), profile);

        for _ in 0..100 {
            if registry.connected_ids().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.connected_ids(), vec![1, 2]);
        for handle in handles {
            handle.abort();
        }
    }
}
