//! The host window and its event pump.
//!
//! The frame loop owns control: instead of handing the thread to winit's
//! `run_app`, [`WindowHost`] pumps pending events once per poll with a zero
//! timeout and translates them into [`SurfaceEvent`]s.

use std::time::Duration;

use tracing::{debug, error, info, instrument};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    event::{EventSource, SurfaceEvent},
};

/// Pumps attempted while waiting for the platform to deliver `resumed`.
const OPEN_ATTEMPTS: usize = 64;

#[derive(Debug)]
struct Handler {
    title: String,
    size: LogicalSize<u32>,
    window: Option<Window>,
    failure: Option<OsError>,
    pending: Vec<SurfaceEvent>,
}

impl ApplicationHandler for Handler {
    #[instrument(level = "debug", skip(self, event_loop))]
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.failure.is_some() {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title(&self.title)
            .with_inner_size(self.size)
            .with_resizable(false);
        match event_loop.create_window(attributes) {
            Ok(window) => {
                info!(
                    width = self.size.width,
                    height = self.size.height,
                    "window created"
                );
                self.window = Some(window);
            }
            Err(err) => {
                error!("Failed to create window: {err}");
                self.failure = Some(err);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let event = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                SurfaceEvent::CloseRequested
            }
            WindowEvent::Resized(size) => SurfaceEvent::Resized {
                width: size.width,
                height: size.height,
            },
            WindowEvent::Focused(focused) => SurfaceEvent::Focused(focused),
            _ => SurfaceEvent::Other,
        };
        self.pending.push(event);
    }
}

/// A window plus the event loop feeding it.
#[derive(Debug)]
pub struct WindowHost {
    event_loop: EventLoop<()>,
    handler: Handler,
    exited: bool,
}

impl WindowHost {
    /// Opens a fixed-size window sized to the configured viewport.
    ///
    /// Returns once the window exists. Fails if the platform refuses to
    /// create it or never resumes the application.
    #[instrument(level = "info", skip(config))]
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);
        let mut host = Self {
            event_loop,
            handler: Handler {
                title: config.window_title.clone(),
                size: LogicalSize::new(config.viewport_width, config.viewport_height),
                window: None,
                failure: None,
                pending: Vec::new(),
            },
            exited: false,
        };

        for _ in 0..OPEN_ATTEMPTS {
            if let PumpStatus::Exit(code) = host.pump() {
                debug!(code, "event loop exited before a window was created");
                break;
            }
            if let Some(err) = host.handler.failure.take() {
                return Err(err.into());
            }
            if host.handler.window.is_some() {
                // Startup events are not frame-loop events.
                host.handler.pending.clear();
                return Ok(host);
            }
        }
        Err(EngineError::WindowUnavailable)
    }

    /// The window.
    pub fn window(&self) -> EngineResult<&Window> {
        self.handler
            .window
            .as_ref()
            .ok_or(EngineError::WindowUnavailable)
    }

    fn pump(&mut self) -> PumpStatus {
        self.event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.handler)
    }
}

impl EventSource for WindowHost {
    fn poll(&mut self) -> Vec<SurfaceEvent> {
        if !self.exited
            && let PumpStatus::Exit(code) = self.pump()
        {
            debug!(code, "event loop exited");
            self.exited = true;
        }
        let mut events = std::mem::take(&mut self.handler.pending);
        if self.exited && !events.contains(&SurfaceEvent::CloseRequested) {
            events.push(SurfaceEvent::CloseRequested);
        }
        events
    }
}
