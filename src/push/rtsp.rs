//! RTSP server output.
//!
//! One server per process; every camera gets a shared media mounted at
//! `<mount_prefix>/<camera_id>`. Each media's `appsrc` is fed from its
//! `need-data` callback: the callback waits for the next frame slot and
//! pulls the camera's current frame from the `PushSink`.

use anyhow::{anyhow, Context, Result};
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_rtsp_server::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{gst, PushAttachment, PushMount, PushOutputFactory, PushSettings};
use crate::frame::AnnotatedFrame;
use crate::sink::PushSink;
use crate::worker::StopSignal;

/// Path a camera is served under.
pub fn mount_path(prefix: &str, camera_id: &str) -> String {
    format!("/{}/{}", prefix.trim_matches('/'), camera_id).replace("//", "/")
}

/// Which mount owns each path. A camera restarted before its old mount is
/// dropped must not lose the new mount.
type MountOwners = Arc<Mutex<HashMap<String, u64>>>;

pub struct RtspOutputFactory {
    settings: PushSettings,
    _server: gstreamer_rtsp_server::RTSPServer,
    mounts: gstreamer_rtsp_server::RTSPMountPoints,
    owners: MountOwners,
    next_token: Mutex<u64>,
    context: glib::MainContext,
    main_loop: glib::MainLoop,
    source: Option<glib::SourceId>,
    thread: Option<JoinHandle<()>>,
}

impl RtspOutputFactory {
    /// Bind the server and start its main loop thread.
    pub fn start(settings: &PushSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let server = gstreamer_rtsp_server::RTSPServer::new();
        server.set_address(&settings.host);
        server.set_service(&settings.rtsp_port.to_string());
        let mounts = server
            .mount_points()
            .ok_or_else(|| anyhow!("rtsp server has no mount points"))?;

        let context = glib::MainContext::new();
        let source = server.attach(Some(&context)).map_err(|e| {
            anyhow!(
                "bind rtsp server on {}:{}: {}",
                settings.host,
                settings.rtsp_port,
                e
            )
        })?;
        let main_loop = glib::MainLoop::new(Some(&context), false);
        let loop_handle = main_loop.clone();
        let thread = std::thread::Builder::new()
            .name("rtsp-server".into())
            .spawn(move || loop_handle.run())
            .context("failed to spawn rtsp server thread")?;

        log::info!(
            "RtspOutput: serving rtsp://{}:{}{}/<camera>",
            settings.host,
            settings.rtsp_port,
            settings.mount_prefix.trim_end_matches('/')
        );
        Ok(Self {
            settings: settings.clone(),
            _server: server,
            mounts,
            owners: Arc::new(Mutex::new(HashMap::new())),
            next_token: Mutex::new(0),
            context,
            main_loop,
            source: Some(source),
            thread: Some(thread),
        })
    }

    fn token(&self) -> u64 {
        let mut next = self.next_token.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }
}

impl PushOutputFactory for RtspOutputFactory {
    fn open(&self, camera_id: &str, sink: &PushSink) -> Result<PushAttachment> {
        let path = mount_path(&self.settings.mount_prefix, camera_id);
        let launch = format!(
            "( appsrc name=source is-live=true format=time do-timestamp=false ! {} )",
            gst::encoder_chain(&self.settings, Some("pay0"))
        );

        let detached = StopSignal::new();
        let feed = FeedConfig {
            camera_id: camera_id.to_string(),
            sink: sink.clone(),
            fps: self.settings.fps.max(1),
            detached: detached.clone(),
        };
        let factory = gstreamer_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&launch);
        factory.set_shared(true);
        factory.connect_media_configure(move |_, media| {
            if let Err(e) = attach_feed(media, &feed) {
                log::warn!("[{}] rtsp media not configured: {:#}", feed.camera_id, e);
            }
        });

        let token = self.token();
        self.mounts.add_factory(&path, factory);
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), token);

        let url = format!(
            "rtsp://{}:{}{}",
            self.settings.host, self.settings.rtsp_port, path
        );
        Ok(PushAttachment::OnDemand(Box::new(RtspMount {
            url,
            path,
            token,
            mounts: self.mounts.clone(),
            owners: Arc::clone(&self.owners),
            detached,
        })))
    }
}

impl Drop for RtspOutputFactory {
    fn drop(&mut self) {
        // The server source lives on our own context, not the default one.
        if let Some(source) = self
            .source
            .take()
            .and_then(|id| self.context.find_source_by_id(&id))
        {
            source.destroy();
        }
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A camera's mount on the RTSP server. Dropping it unmounts the path and
/// ends the feeds of connected clients.
pub struct RtspMount {
    url: String,
    path: String,
    token: u64,
    mounts: gstreamer_rtsp_server::RTSPMountPoints,
    owners: MountOwners,
    detached: StopSignal,
}

impl PushMount for RtspMount {
    fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for RtspMount {
    fn drop(&mut self) {
        self.detached.raise();
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if owners.get(&self.path) == Some(&self.token) {
            owners.remove(&self.path);
            self.mounts.remove_factory(&self.path);
            log::info!("RtspOutput: unmounted {}", self.url);
        }
    }
}

#[derive(Clone)]
struct FeedConfig {
    camera_id: String,
    sink: PushSink,
    fps: u32,
    detached: StopSignal,
}

/// Per-media feed state, owned by the `need-data` callback.
struct Feed {
    config: FeedConfig,
    interval: Duration,
    next_tick: Instant,
    emitted: u64,
    caps_size: Option<(u32, u32)>,
}

fn attach_feed(media: &gstreamer_rtsp_server::RTSPMedia, config: &FeedConfig) -> Result<()> {
    let element = media.element();
    let appsrc = element
        .dynamic_cast_ref::<gstreamer::Bin>()
        .ok_or_else(|| anyhow!("media element is not a bin"))?
        .by_name_recurse_up("source")
        .ok_or_else(|| anyhow!("appsrc missing from media"))?
        .dynamic_cast::<gstreamer_app::AppSrc>()
        .map_err(|_| anyhow!("source element is not an appsrc"))?;
    appsrc.set_format(gstreamer::Format::Time);

    let mut feed = Feed {
        config: config.clone(),
        interval: Duration::from_secs(1) / config.fps,
        next_tick: Instant::now(),
        emitted: 0,
        caps_size: None,
    };
    appsrc.set_callbacks(
        gstreamer_app::AppSrcCallbacks::builder()
            .need_data(move |appsrc, _| feed.need_data(appsrc))
            .build(),
    );
    log::debug!("[{}] rtsp client attached", config.camera_id);
    Ok(())
}

impl Feed {
    /// Push exactly one buffer, waiting for the next frame slot first.
    /// Absent frames are skipped: the slot passes and the sink is asked
    /// again on the next one.
    fn need_data(&mut self, appsrc: &gstreamer_app::AppSrc) {
        loop {
            let now = Instant::now();
            if self.next_tick > now && self.config.detached.sleep(self.next_tick - now) {
                let _ = appsrc.end_of_stream();
                return;
            }
            if self.config.detached.is_raised() {
                let _ = appsrc.end_of_stream();
                return;
            }
            self.next_tick = self.next_tick.max(Instant::now()) + self.interval;

            if let Some(frame) = self.config.sink.request_next(&self.config.camera_id) {
                if let Err(e) = self.push(appsrc, &frame) {
                    log::debug!("[{}] rtsp push failed: {:#}", self.config.camera_id, e);
                }
                return;
            }
            // The media is being torn down; appsrc is flushing and no longer
            // waits for this buffer.
            if appsrc.current_state() != gstreamer::State::Playing
                && appsrc.pending_state() != gstreamer::State::Playing
            {
                return;
            }
        }
    }

    fn push(
        &mut self,
        appsrc: &gstreamer_app::AppSrc,
        frame: &AnnotatedFrame,
    ) -> Result<()> {
        let size = (frame.width(), frame.height());
        if self.caps_size != Some(size) {
            appsrc.set_caps(Some(&gst::rgb_caps(size.0, size.1, self.config.fps)?));
            self.caps_size = Some(size);
        }
        let pts =
            Duration::from_nanos((self.interval.as_nanos() as u64).saturating_mul(self.emitted));
        let buffer = gst::frame_buffer(frame, pts, self.interval)?;
        appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow!("push to {} failed: {:?}", self.config.camera_id, e))?;
        self.emitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_paths_follow_prefix() {
        assert_eq!(mount_path("/annotated", "cam1"), "/annotated/cam1");
        assert_eq!(mount_path("annotated/", "cam1"), "/annotated/cam1");
        assert_eq!(mount_path("/", "cam1"), "/cam1");
    }
}
