//! Demo commands driving a camera session end to end

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use shutter_core::{
    well_known as wk, CapabilityFlags, CapabilityId, CapabilityType, CapabilityValue,
    CapturedImage, DecodedImage, ObjectId, PreviewImage, PreviewResolution,
};
use shutter_session::{ImageDelivery, SessionEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state::AppState;

/// Drive step used for fine focusing after the coarse move
const FINE_FOCUS_STEP: f64 = 200.0;

#[derive(Debug, Serialize)]
struct CapabilityRow {
    session: String,
    id: CapabilityId,
    description: String,
    kind: CapabilityType,
    flags: CapabilityFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<CapabilityValue>,
}

/// List every capability of every open session
pub async fn capabilities(state: &mut AppState, json: bool) -> Result<()> {
    state.wait_for_device().await?;
    let ids: Vec<ObjectId> = state.directory.iter().map(|s| s.id().clone()).collect();

    let mut rows = Vec::new();
    for id in &ids {
        let session = state.session(id)?;
        let name = session.name().to_string();
        for entry in session.capabilities().iter() {
            let fetchable = entry.is_readable()
                && entry.kind().is_supported()
                && entry.kind() != CapabilityType::Process;
            let value = if fetchable {
                session.read(entry.id()).ok()
            } else {
                None
            };
            rows.push(CapabilityRow {
                session: name.clone(),
                id: entry.id(),
                description: entry.description().to_string(),
                kind: entry.kind(),
                flags: entry.flags(),
                value,
            });
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{} camera(s) connected", state.manager.devices().len());
    let mut current = None;
    for row in &rows {
        if current.as_ref() != Some(&row.session) {
            println!("\n{}:", row.session);
            current = Some(row.session.clone());
        }
        let value = match (&row.value, row.kind) {
            (Some(value), _) => value.to_string(),
            (None, kind) if !kind.is_supported() => "<unsupported type>".to_string(),
            (None, CapabilityType::Process) => String::new(),
            (None, _) if !row.flags.readable => "<write only>".to_string(),
            (None, _) => "<read failed>".to_string(),
        };
        println!(
            "  {}  {:<28} {:<9} {}  {}",
            row.id, row.description, row.kind, row.flags, value
        );
    }
    Ok(())
}

fn save_bytes(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create image directory {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Binary PPM of an RGB24 image, dropping any row padding
fn encode_ppm(image: &DecodedImage) -> Vec<u8> {
    let row = image.width as usize * 3;
    let mut out = format!("P6\n{} {}\n255\n", image.width, image.height).into_bytes();
    for line in image.pixels.chunks((image.stride as usize).max(1)).take(image.height as usize) {
        out.extend_from_slice(&line[..row.min(line.len())]);
    }
    out
}

enum Delivered {
    Image(Arc<CapturedImage>),
    Preview(Arc<PreviewImage>),
    Thumbnail(Arc<DecodedImage>),
    Complete,
}

/// Wait for capture images until `CaptureComplete`, saving each one
///
/// Previews and thumbnails are saved too when the session relays them.
async fn collect_images<F>(
    state: &mut AppState,
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    mut name: F,
) -> Result<usize>
where
    F: FnMut(usize, &CapturedImage) -> String,
{
    let dir = PathBuf::from(&state.config.output.image_dir);
    let mut saved = 0;
    loop {
        let next = state
            .wait_for_event(rx, |event| match event {
                SessionEvent::ImageReady(image) => Some(Delivered::Image(image)),
                SessionEvent::PreviewReady(preview) => Some(Delivered::Preview(preview)),
                SessionEvent::ThumbnailReady(thumbnail) => Some(Delivered::Thumbnail(thumbnail)),
                SessionEvent::CaptureComplete { .. } => Some(Delivered::Complete),
                _ => None,
            })
            .await?;
        let path = match next {
            Delivered::Image(image) => {
                saved += 1;
                save_bytes(&dir, &name(saved, image.as_ref()), &image.data)?
            }
            Delivered::Preview(preview) => {
                let file = match preview.resolution {
                    PreviewResolution::Normal => "preview.jpg",
                    PreviewResolution::Low => "preview_lowres.jpg",
                };
                save_bytes(&dir, file, &preview.jpeg)?
            }
            Delivered::Thumbnail(thumbnail) => {
                save_bytes(&dir, "thumbnail.ppm", &encode_ppm(&thumbnail))?
            }
            Delivered::Complete => return Ok(saved),
        };
        println!("Saved {}", path.display());
    }
}

/// Take a single picture, optionally keeping its previews and thumbnail
pub async fn capture(state: &mut AppState, extras: &[ImageDelivery]) -> Result<()> {
    let id = state.wait_for_device().await?;
    let session = state.session(&id)?;
    if !session.supports_capture() {
        bail!("{} cannot capture", session.name());
    }
    for &kind in extras {
        let supported = match kind {
            ImageDelivery::Preview => session.supports_preview(),
            ImageDelivery::LowResPreview => session.supports_low_res_preview(),
            ImageDelivery::Thumbnail => true,
        };
        if !supported {
            bail!("{} does not deliver {:?} images", session.name(), kind);
        }
        session.set_delivery(kind, true)?;
    }

    let mut rx = session.subscribe();
    session.start(wk::CAPTURE)?;
    info!("Capture triggered");

    let saved = collect_images(state, &mut rx, |_, image| {
        format!(
            "{}_image.{}",
            Local::now().format("%H%M%S"),
            image.kind.extension()
        )
    })
    .await?;
    println!("Capture complete, {} image(s) saved", saved);
    Ok(())
}

/// Shoot a continuous-high burst of `count` pictures
pub async fn burst(state: &mut AppState, count: u32) -> Result<()> {
    let id = state.wait_for_device().await?;
    let session = state.session(&id)?;
    if !session.supports_capture() {
        bail!("{} cannot capture", session.name());
    }

    session.select_enum_item(wk::SHOOTING_MODE, "Continuous H")?;
    session.write(wk::CONTINUOUS_SHOOTING_NUM, CapabilityValue::Unsigned(count))?;

    let mut rx = session.subscribe();
    session.start(wk::CAPTURE)?;
    info!(count, "Burst triggered");

    let saved = collect_images(state, &mut rx, |n, image| {
        format!("image{}.{}", n, image.kind.extension())
    })
    .await?;
    println!("Burst complete, {} image(s) saved", saved);
    Ok(())
}

/// Drive the focus motor and wait for it to settle
///
/// Completion is read from the live-view frame header; returns the lens
/// position the device reports afterwards.
async fn drive_focus(state: &mut AppState, id: &ObjectId, direction: u32) -> Result<u32> {
    state
        .session(id)?
        .write(wk::MF_DRIVE, CapabilityValue::Unsigned(direction))?;

    let poll = state.directory.config().live_view.interval;
    let deadline = Instant::now() + state.wait();
    loop {
        tokio::time::sleep(poll).await;
        let frame = state.session(id)?.fetch_live_frame()?;
        if frame.header_byte(wk::HEADER_DRIVING_OFFSET) == Some(0) {
            break;
        }
        if Instant::now() >= deadline {
            bail!("Focus drive did not finish within {:?}", state.wait());
        }
        debug!("Focus motor driving");
    }

    // Pick up the position change the device reported
    state.pump_pending();
    state
        .session(id)?
        .read(wk::LENS_POSITION)?
        .as_unsigned()
        .context("Lens position is not an unsigned value")
}

/// Drive focus to the closest point, then step back `steps` times
pub async fn focus(state: &mut AppState, steps: u32) -> Result<()> {
    let id = state.wait_for_device().await?;
    state.session(&id)?.set_live_view_enabled(true)?;

    // Manual focus capabilities appear once live view is on
    state
        .wait_until(|d| d.get(&id).is_some_and(|s| s.supports(wk::MF_DRIVE)))
        .await
        .context("Camera does not offer manual focus")?;

    let session = state.session(&id)?;
    let step = session.read(wk::MF_DRIVE_STEP)?;
    let range = step.as_range().context("MF drive step is not a range")?;
    session.set_range_value(wk::MF_DRIVE_STEP, range.max)?;

    let position = drive_focus(state, &id, wk::MF_DRIVE_TO_CLOSEST).await?;
    println!("Closest focus reached, lens position {}", position);

    state
        .session(&id)?
        .set_range_value(wk::MF_DRIVE_STEP, FINE_FOCUS_STEP.min(range.max))?;
    for n in 1..=steps {
        let position = drive_focus(state, &id, wk::MF_DRIVE_TO_INFINITY).await?;
        println!("Step {}: lens position {}", n, position);
    }

    state.session(&id)?.set_live_view_enabled(false)?;
    Ok(())
}

/// Record a clip and download it
pub async fn video(state: &mut AppState, seconds: u64) -> Result<()> {
    let id = state.wait_for_device().await?;
    let session = state.session(&id)?;
    let mut rx = session.subscribe();
    session.start_live_view()?;
    session.start(wk::MOVIE_REC_START)?;
    println!("Recording for {} s", seconds);

    state.pump(Duration::from_secs(seconds)).await?;
    state.session(&id)?.start(wk::MOVIE_REC_STOP)?;
    println!("Recording stopped, downloading");

    let outcome = state
        .wait_for_event(&mut rx, |event| match event {
            SessionEvent::RecordingStarted { path } => {
                println!("Saving to {}", path.display());
                None
            }
            SessionEvent::RecordingProgress { percent, .. } => {
                println!("  {:5.1}%", percent);
                None
            }
            SessionEvent::RecordingCompleted(done) => Some(Ok(done)),
            SessionEvent::RecordingInterrupted { reason, partial } => Some(Err((reason, partial))),
            _ => None,
        })
        .await?;

    state.session(&id)?.stop_live_view();

    match outcome {
        Ok(done) => {
            println!(
                "Saved {} ({}x{}, {} bytes)",
                done.path.display(),
                done.width,
                done.height,
                done.bytes_written
            );
            Ok(())
        }
        Err((reason, Some(partial))) => bail!(
            "Recording interrupted ({}), partial file {} ({} bytes)",
            reason,
            partial.path.display(),
            partial.bytes_written
        ),
        Err((reason, None)) => bail!("Recording interrupted ({})", reason),
    }
}

/// Run the live-view loop and report published frames
pub async fn liveview(state: &mut AppState, seconds: u64) -> Result<()> {
    let id = state.wait_for_device().await?;
    let session = state.session(&id)?;
    if !session.supports_live_view() {
        bail!("{} has no live view", session.name());
    }
    let mut frames = session
        .subscribe_frames()
        .context("Session has no live view")?;
    session.start_live_view()?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut observed = 0u64;
    let mut last_sequence = 0;
    while Instant::now() < deadline {
        state.pump(Duration::from_millis(100)).await?;
        if !frames.has_changed().unwrap_or(false) {
            continue;
        }
        let Some(frame) = frames.borrow_and_update().clone() else {
            // Stopped by the loop itself
            break;
        };
        observed += 1;
        last_sequence = frame.sequence;
        println!(
            "Frame {:>5}  {}x{}  stride {}",
            frame.sequence, frame.width, frame.height, frame.stride
        );
    }

    let session = state.session(&id)?;
    let running = session.stop_live_view();
    println!(
        "Observed {} frame(s), last sequence {}{}",
        observed,
        last_sequence,
        if running { "" } else { " (live view had stopped)" }
    );
    Ok(())
}
