//! Dedicated threads that own platform audio objects.
//!
//! Most OS audio handles (COM interfaces, AVAudioEngine, Oboe streams,
//! PulseAudio connections) must be created, driven and released on one
//! thread. A `DeviceThread` runs the platform body on such a thread and
//! walks it through a fixed handshake with the owning backend:
//!
//! ```text
//! backend::open  ──spawn──▶  body: acquire device, negotiate format
//!                ◀─opened──        (StreamInfo or error)
//! backend::start ──sink───▶        install callback / start stream
//!                ◀─started─
//! backend::close ──drop───▶        stop stream, release device, exit
//!                ◀─join────
//! ```

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use voice_io_core::models::error::{VoiceError, VoiceResult};

/// Format negotiated by the device, reported once from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub rate: u32,
    pub period_frames: usize,
}

/// Backend-side handle of a device thread. `S` is what the stream consumes
/// once started: a `FrameProducer` for capture, a `SampleSource` for
/// playback.
pub struct DeviceThread<S> {
    name: &'static str,
    info: StreamInfo,
    start_tx: Option<Sender<S>>,
    ack_rx: Receiver<VoiceResult<()>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Body-side end of the handshake.
pub struct DeviceContext<S> {
    open_tx: Sender<VoiceResult<StreamInfo>>,
    start_rx: Receiver<S>,
    ack_tx: Sender<VoiceResult<()>>,
    stop_rx: Receiver<()>,
}

impl<S: Send + 'static> DeviceThread<S> {
    /// Run `body` on a new thread and wait for it to report the negotiated
    /// format. A setup error is returned after the thread has exited.
    pub fn spawn<F>(name: &'static str, body: F) -> VoiceResult<Self>
    where
        F: FnOnce(DeviceContext<S>) + Send + 'static,
    {
        let (open_tx, open_rx) = bounded(1);
        let (start_tx, start_rx) = bounded(1);
        let (ack_tx, ack_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(0);

        let context = DeviceContext {
            open_tx,
            start_rx,
            ack_tx,
            stop_rx,
        };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || body(context))
            .map_err(|e| VoiceError::BackendError(format!("failed to spawn {name} thread: {e}")))?;

        let opened = open_rx.recv().unwrap_or_else(|_| {
            Err(VoiceError::BackendError(format!(
                "{name} thread exited before reporting its format"
            )))
        });
        let info = match opened {
            Ok(info) => info,
            Err(e) => {
                drop(start_tx);
                drop(stop_tx);
                let _ = handle.join();
                return Err(e);
            }
        };

        log::debug!(
            "{} opened: {} Hz, {} frames per period",
            name,
            info.rate,
            info.period_frames
        );

        Ok(Self {
            name,
            info,
            start_tx: Some(start_tx),
            ack_rx,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl<S> DeviceThread<S> {
    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Hand the sink to the body and wait until the stream is running.
    pub fn start(&mut self, sink: S) -> VoiceResult<()> {
        let Some(start_tx) = self.start_tx.take() else {
            return Err(VoiceError::BackendError(format!(
                "{} already started",
                self.name
            )));
        };
        let lost = || VoiceError::BackendError(format!("{} thread exited", self.name));

        start_tx.send(sink).map_err(|_| lost())?;
        self.ack_rx.recv().unwrap_or_else(|_| Err(lost()))
    }

    /// Signal the body to stop and join it. Idempotent.
    pub fn close(&mut self) {
        self.start_tx.take();
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{} thread panicked", self.name);
            }
        }
    }
}

impl<S> Drop for DeviceThread<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S> DeviceContext<S> {
    /// Report setup success or failure. After an error the body should
    /// release what it acquired and return.
    pub fn opened(&self, result: VoiceResult<StreamInfo>) {
        let _ = self.open_tx.send(result);
    }

    /// Block until the backend starts the stream. `None` means it was
    /// closed first.
    pub fn wait_for_start(&self) -> Option<S> {
        self.start_rx.recv().ok()
    }

    pub fn started(&self, result: VoiceResult<()>) {
        let _ = self.ack_tx.send(result);
    }

    /// False once the backend has asked the body to stop.
    pub fn is_running(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Park the body until the backend closes the stream. For platforms
    /// whose callbacks run on an OS-owned thread.
    pub fn wait_for_stop(&self) {
        let _ = self.stop_rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const INFO: StreamInfo = StreamInfo {
        rate: 48000,
        period_frames: 480,
    };

    #[test]
    fn handshake_delivers_sink_and_joins_on_close() {
        let seen = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let (body_seen, body_released) = (Arc::clone(&seen), Arc::clone(&released));

        let mut device = DeviceThread::<usize>::spawn("test-device", move |ctx| {
            ctx.opened(Ok(INFO));
            let Some(sink) = ctx.wait_for_start() else {
                return;
            };
            body_seen.store(sink, Ordering::SeqCst);
            ctx.started(Ok(()));
            while ctx.is_running() {
                std::thread::sleep(Duration::from_millis(1));
            }
            body_released.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(device.info(), INFO);
        device.start(7).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(device.start(8).is_err());

        device.close();
        assert!(released.load(Ordering::SeqCst));
        device.close();
    }

    #[test]
    fn setup_error_is_returned_from_spawn() {
        let result = DeviceThread::<()>::spawn("test-device", |ctx| {
            ctx.opened(Err(VoiceError::PermissionDenied));
        });
        assert_eq!(result.err(), Some(VoiceError::PermissionDenied));
    }

    #[test]
    fn body_exiting_silently_is_a_backend_error() {
        let result = DeviceThread::<()>::spawn("test-device", |_ctx| {});
        assert!(matches!(result, Err(VoiceError::BackendError(_))));
    }

    #[test]
    fn start_failure_is_reported() {
        let mut device = DeviceThread::<()>::spawn("test-device", |ctx| {
            ctx.opened(Ok(INFO));
            if ctx.wait_for_start().is_some() {
                ctx.started(Err(VoiceError::DeviceUnavailable));
            }
        })
        .unwrap();
        assert_eq!(device.start(()), Err(VoiceError::DeviceUnavailable));
        device.close();
    }

    #[test]
    fn close_before_start_releases_body() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let mut device = DeviceThread::<()>::spawn("test-device", move |ctx| {
            ctx.opened(Ok(INFO));
            assert!(ctx.wait_for_start().is_none());
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        device.close();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_for_stop_returns_on_close() {
        let mut device = DeviceThread::<()>::spawn("test-device", |ctx| {
            ctx.opened(Ok(INFO));
            if ctx.wait_for_start().is_some() {
                ctx.started(Ok(()));
                ctx.wait_for_stop();
            }
        })
        .unwrap();
        device.start(()).unwrap();
        device.close();
    }
}
