//! Window abstraction and event pump
//!
//! Windows queue [`WindowEvent`]s as they arrive; the graphics system drains
//! the queue once per frame.

use std::sync::Arc;

use glam::UVec2;
use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{DeviceEvent, ElementState, Event, KeyEvent, WindowEvent as WinitWindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::PhysicalKey,
    window::{Window as WinitWindow, WindowBuilder},
};

pub use winit::keyboard::KeyCode;

/// Input and window events, in arrival order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    Resized { width: u32, height: u32 },
    KeyPressed(KeyCode),
    KeyReleased(KeyCode),
    /// Raw mouse motion in pixels
    MouseMoved { dx: f32, dy: f32 },
    CloseRequested,
}

/// Window collaborator of the graphics system
pub trait PlatformWindow {
    /// Client area in physical pixels
    fn dimensions(&self) -> UVec2;

    fn is_minimized(&self) -> bool {
        let size = self.dimensions();
        size.x == 0 || size.y == 0
    }

    fn should_close(&self) -> bool;

    fn set_title(&mut self, title: &str);

    /// Take every event queued since the last call
    fn drain_events(&mut self) -> Vec<WindowEvent>;
}

/// Wrapper around a winit window queueing its events
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    close_requested: bool,
    events: Vec<WindowEvent>,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, OsError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)?,
        );
        let size = window.inner_size();

        Ok(Self {
            window,
            width: size.width,
            height: size.height,
            close_requested: false,
            events: Vec::new(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Translate a winit window event into the queue
    pub fn handle_event(&mut self, event: &WinitWindowEvent) {
        match event {
            WinitWindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.events.push(WindowEvent::Resized {
                    width: size.width,
                    height: size.height,
                });
            }
            WinitWindowEvent::CloseRequested => {
                self.close_requested = true;
                self.events.push(WindowEvent::CloseRequested);
            }
            WinitWindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat: false,
                        ..
                    },
                ..
            } => self.events.push(match state {
                ElementState::Pressed => WindowEvent::KeyPressed(*code),
                ElementState::Released => WindowEvent::KeyReleased(*code),
            }),
            _ => {}
        }
    }

    /// Translate raw mouse motion into the queue
    pub fn handle_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            self.events.push(WindowEvent::MouseMoved {
                dx: delta.0 as f32,
                dy: delta.1 as f32,
            });
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl PlatformWindow for Window {
    fn dimensions(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    fn is_minimized(&self) -> bool {
        self.window.is_minimized().unwrap_or(false) || self.width == 0 || self.height == 0
    }

    fn should_close(&self) -> bool {
        self.close_requested
    }

    fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    fn drain_events(&mut self) -> Vec<WindowEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Pump `event_loop`, calling `frame` once per iteration until it returns
/// false or the window is closed
pub fn run<F>(
    event_loop: EventLoop<()>,
    mut window: Window,
    mut frame: F,
) -> Result<(), EventLoopError>
where
    F: FnMut(&mut Window) -> bool + 'static,
{
    event_loop.run(move |event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => window.handle_event(&event),
            Event::DeviceEvent { event, .. } => window.handle_device_event(&event),
            Event::AboutToWait => {
                if !frame(&mut window) || window.should_close() {
                    elwt.exit();
                } else {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    })
}

/// Window without a display, fed by hand
#[derive(Debug, Clone)]
pub struct HeadlessWindow {
    size: UVec2,
    title: String,
    close_requested: bool,
    events: Vec<WindowEvent>,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: UVec2::new(width, height),
            title: String::new(),
            close_requested: false,
            events: Vec::new(),
        }
    }

    /// Queue an event as if the platform delivered it
    pub fn push_event(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::Resized { width, height } => self.size = UVec2::new(width, height),
            WindowEvent::CloseRequested => self.close_requested = true,
            _ => {}
        }
        self.events.push(event);
    }

    /// Resize the client area, queueing the matching event
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.push_event(WindowEvent::Resized { width, height });
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl PlatformWindow for HeadlessWindow {
    fn dimensions(&self) -> UVec2 {
        self.size
    }

    fn should_close(&self) -> bool {
        self.close_requested
    }

    fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    fn drain_events(&mut self) -> Vec<WindowEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_events_drain_in_order() {
        let mut window = HeadlessWindow::new(800, 600);
        window.push_event(WindowEvent::KeyPressed(KeyCode::KeyW));
        window.set_size(1024, 768);
        window.push_event(WindowEvent::KeyReleased(KeyCode::KeyW));

        assert_eq!(window.dimensions(), UVec2::new(1024, 768));
        let events = window.drain_events();
        assert_eq!(
            events,
            [
                WindowEvent::KeyPressed(KeyCode::KeyW),
                WindowEvent::Resized {
                    width: 1024,
                    height: 768
                },
                WindowEvent::KeyReleased(KeyCode::KeyW),
            ]
        );
        assert!(window.drain_events().is_empty());
    }

    #[test]
    fn test_headless_minimized() {
        let mut window = HeadlessWindow::new(800, 600);
        assert!(!window.is_minimized());
        window.set_size(0, 0);
        assert!(window.is_minimized());
    }

    #[test]
    fn test_headless_close() {
        let mut window = HeadlessWindow::new(800, 600);
        window.push_event(WindowEvent::CloseRequested);
        assert!(window.should_close());
        window.set_title("closing");
        assert_eq!(window.title(), "closing");
    }
}
