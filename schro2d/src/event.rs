//! Window events as seen by the frame loop.

/// An event from the presentation surface's host window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The user asked to close the window.
    CloseRequested,
    /// The window's physical size changed.
    Resized {
        /// New width in physical pixels.
        width: u32,
        /// New height in physical pixels.
        height: u32,
    },
    /// The window gained or lost focus.
    Focused(bool),
    /// Anything the engine does not act on.
    Other,
}

/// A queue of pending window events.
pub trait EventSource {
    /// Drains the events that arrived since the last poll. Never blocks.
    fn poll(&mut self) -> Vec<SurfaceEvent>;
}

impl<F> EventSource for F
where
    F: FnMut() -> Vec<SurfaceEvent>,
{
    fn poll(&mut self) -> Vec<SurfaceEvent> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_event_sources() {
        let mut polls = 0;
        let mut source = || {
            polls += 1;
            vec![SurfaceEvent::Focused(true)]
        };
        assert_eq!(source.poll(), [SurfaceEvent::Focused(true)]);
        assert_eq!(EventSource::poll(&mut source).len(), 1);
        drop(source);
        assert_eq!(polls, 2);
    }
}
