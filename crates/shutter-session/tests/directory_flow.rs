//! End-to-end flows through the session directory against the simulated SDK

use shutter_core::{well_known as wk, CapabilityValue, DirectoryOutput, InterruptReason, ObjectId, SdkEvent};
use shutter_session::{
    DirectoryConfig, LiveViewState, LiveViewStop, RunExit, SessionDirectory, SessionEvent,
    SimCamera, SimConfig, SimFrameDecoder, SimManager,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

struct Rig {
    dir: TempDir,
    manager: Arc<SimManager>,
    events: mpsc::UnboundedReceiver<SdkEvent>,
    directory: SessionDirectory,
}

impl Rig {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let (manager, events) = SimManager::new("Sim");
        let mut directory = SessionDirectory::new(
            DirectoryConfig::default(),
            Arc::new(SimFrameDecoder),
            Arc::new(DirectoryOutput::new(dir.path())),
        );
        directory.open_manager(manager.clone());
        Self {
            dir,
            manager,
            events,
            directory,
        }
    }

    fn attach(&mut self, config: SimConfig) -> Arc<SimCamera> {
        let camera = self.manager.attach(config);
        self.directory.pump_pending(&mut self.events);
        camera
    }

    fn pump(&mut self) {
        self.directory.pump_pending(&mut self.events);
    }

    async fn run_until<F>(&mut self, done: F)
    where
        F: FnMut(&SessionDirectory) -> bool,
    {
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            self.directory.run_until(&mut self.events, done),
        )
        .await
        .expect("condition not reached in time");
        assert_eq!(exit, RunExit::Done);
    }
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn clip_payload(fragments: usize, size: usize) -> Vec<u8> {
    (0..fragments)
        .flat_map(|i| (0..size).map(move |b| ((i + b) % 256) as u8))
        .collect()
}

#[tokio::test]
async fn test_video_download_writes_concatenated_payloads() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig {
        video_fragments: 4,
        fragment_size: 100,
        ..Default::default()
    });
    let id = camera.id().clone();

    let session = rig.directory.get_mut(&id).unwrap();
    let mut rx = session.subscribe();
    session.start_live_view().unwrap();
    session.start(wk::MOVIE_REC_START).unwrap();
    session.start(wk::MOVIE_REC_STOP).unwrap();
    rig.pump();

    let events = drain(&mut rx);
    let completed = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::RecordingCompleted(done) => Some(done.clone()),
            _ => None,
        })
        .expect("recording completed");
    assert_eq!(completed.path, rig.dir.path().join("DSC_0001.MOV"));
    assert_eq!((completed.width, completed.height), (1920, 1080));
    assert_eq!(completed.bytes_written, 400);
    assert_eq!(std::fs::read(&completed.path).unwrap(), clip_payload(4, 100));

    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::RecordingInterrupted { .. })));
}

#[tokio::test]
async fn test_detach_mid_recording_marks_interrupted() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig {
        video_fragments: 5,
        fragment_size: 10,
        ..Default::default()
    });
    let id = camera.id().clone();
    camera.truncate_next_video(2, None);

    let session = rig.directory.get_mut(&id).unwrap();
    let mut rx = session.subscribe();
    session.start_live_view().unwrap();
    session.start(wk::MOVIE_REC_START).unwrap();
    session.start(wk::MOVIE_REC_STOP).unwrap();
    rig.pump();
    assert!(rig.directory.get(&id).unwrap().is_recording());

    rig.manager.detach(&id);
    rig.pump();
    assert!(rig.directory.get(&id).is_none());
    assert_eq!(rig.directory.device_count(), 0);

    let events = drain(&mut rx);
    let partial = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::RecordingInterrupted {
                reason: InterruptReason::Detached,
                partial,
            } => partial.clone(),
            _ => None,
        })
        .expect("recording interrupted");
    assert_eq!(partial.bytes_written, 20);
    assert_eq!(std::fs::read(&partial.path).unwrap(), clip_payload(2, 10));

    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::RecordingCompleted(_))));
    assert!(matches!(events.last(), Some(SessionEvent::Closed)));
}

#[tokio::test]
async fn test_sdk_interruption_keeps_partial_file() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig {
        video_fragments: 5,
        fragment_size: 8,
        ..Default::default()
    });
    let id = camera.id().clone();
    camera.truncate_next_video(3, Some(-42));

    let session = rig.directory.get_mut(&id).unwrap();
    let mut rx = session.subscribe();
    session.start_live_view().unwrap();
    session.start(wk::MOVIE_REC_START).unwrap();
    session.start(wk::MOVIE_REC_STOP).unwrap();
    rig.pump();

    let session = rig.directory.get(&id).unwrap();
    assert!(!session.is_recording());
    let partial = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            SessionEvent::RecordingInterrupted {
                reason: InterruptReason::Sdk(-42),
                partial,
            } => partial,
            _ => None,
        })
        .expect("recording interrupted");
    assert_eq!(std::fs::read(&partial.path).unwrap(), clip_payload(3, 8));
}

#[tokio::test]
async fn test_capture_and_burst_deliver_images() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig::default());
    let id = camera.id().clone();

    let session = rig.directory.get_mut(&id).unwrap();
    let mut rx = session.subscribe();
    session.start(wk::CAPTURE).unwrap();
    rig.pump();

    let events = drain(&mut rx);
    let images = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ImageReady(_)))
        .count();
    assert_eq!(images, 1);
    assert!(matches!(
        events.last(),
        Some(SessionEvent::CaptureComplete { data: 1 })
    ));

    let session = rig.directory.get_mut(&id).unwrap();
    session
        .select_enum_item(wk::SHOOTING_MODE, "Continuous H")
        .unwrap();
    session
        .write(wk::CONTINUOUS_SHOOTING_NUM, CapabilityValue::Unsigned(4))
        .unwrap();
    session.set_enum_index(wk::COMPRESSION_LEVEL, 3).unwrap();
    session.start(wk::CAPTURE).unwrap();
    rig.pump();

    let nefs = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, SessionEvent::ImageReady(img) if img.kind == shutter_core::ImageKind::Nef))
        .count();
    assert_eq!(nefs, 4);
}

#[tokio::test]
async fn test_manual_focus_drive_completes() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig::default());
    let id = camera.id().clone();

    rig.directory
        .get_mut(&id)
        .unwrap()
        .set_live_view_enabled(true)
        .unwrap();
    rig.pump();

    let session = rig.directory.get_mut(&id).unwrap();
    assert!(session.supports(wk::MF_DRIVE));
    let max = session
        .read(wk::MF_DRIVE_STEP)
        .unwrap()
        .as_range()
        .unwrap()
        .max;
    session.set_range_value(wk::MF_DRIVE_STEP, max).unwrap();
    session
        .write(wk::MF_DRIVE, CapabilityValue::Unsigned(wk::MF_DRIVE_TO_CLOSEST))
        .unwrap();

    let mut frames = 0;
    loop {
        let raw = session.fetch_live_frame().unwrap();
        frames += 1;
        if raw.header_byte(wk::HEADER_DRIVING_OFFSET) == Some(0) {
            break;
        }
        assert!(frames < 100, "focus drive never finished");
    }

    let mut watch = rig.directory.get(&id).unwrap().watch_capability(wk::LENS_POSITION);
    rig.pump();
    assert_eq!(watch.try_changed(), Some(true));
    let position = rig
        .directory
        .get_mut(&id)
        .unwrap()
        .read(wk::LENS_POSITION)
        .unwrap();
    assert_eq!(position, CapabilityValue::Unsigned(camera.lens_position()));
}

#[tokio::test]
async fn test_live_view_stream_end_stops_loop_only() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig::default());
    let id = camera.id().clone();

    let session = rig.directory.get_mut(&id).unwrap();
    let mut rx = session.subscribe();
    session.start_live_view().unwrap();

    rig.run_until(|d| d.get(&id).and_then(|s| s.current_frame()).is_some())
        .await;

    camera.end_live_stream();
    rig.run_until(|d| d.get(&id).unwrap().live_view_state() == LiveViewState::Stopped)
        .await;

    let session = rig.directory.get(&id).unwrap();
    assert!(session.current_frame().is_none());
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        SessionEvent::LiveViewStopped {
            reason: LiveViewStop::StreamEnded
        }
    )));

    // The session itself survives
    assert_eq!(rig.directory.device_count(), 1);
}

#[tokio::test]
async fn test_events_for_unknown_objects_are_ignored() {
    let mut rig = Rig::new();
    let camera = rig.attach(SimConfig::default());
    rig.manager.detach(camera.id());
    rig.pump();

    // Late notifications after detach must not resurrect the session
    rig.directory.handle(SdkEvent::CapabilityValueChanged {
        id: camera.id().clone(),
        capability: wk::ISO,
    });
    rig.directory.handle(SdkEvent::Detached {
        id: ObjectId::new("never-attached"),
    });
    assert_eq!(rig.directory.device_count(), 0);
    assert_eq!(rig.directory.len(), 1);
}
