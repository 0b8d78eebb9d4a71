//! Synthetic middle-button injection via CGEventPost.
//!
//! Injection is synchronous: `CGEventPost` hands the event to the window
//! server before returning, so by the time the tap callback returns the
//! replacement is queued in the same relative order as the original.
//!
//! Injection is best-effort. If the OS fails to construct the synthetic
//! event, the failure is logged at debug level and swallowed; the caller
//! still consumes the original event. There is no actionable recovery.

use crate::session::MiddleEvent;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// CGEventType value for other-mouse-button press.
pub(crate) const CG_EVENT_OTHER_MOUSE_DOWN: u32 = 25;

/// CGEventType value for other-mouse-button release.
pub(crate) const CG_EVENT_OTHER_MOUSE_UP: u32 = 26;

/// CGEventType value for other-mouse-button drag.
pub(crate) const CG_EVENT_OTHER_MOUSE_DRAGGED: u32 = 27;

/// kCGMouseButtonCenter: the middle button.
pub(crate) const CG_MOUSE_BUTTON_CENTER: u32 = 2;

/// kCGSessionEventTap: post at the session level, the same location the
/// capture tap listens at. No feedback loop: the tap's mask covers only
/// left-button events, and everything posted here is other-button.
#[cfg(target_os = "macos")]
const CG_SESSION_EVENT_TAP: u32 = 1;

// ---------------------------------------------------------------------------
// MiddleEvent -> CoreGraphics parameters
// ---------------------------------------------------------------------------

/// CGEventType and CGMouseButton for a synthetic middle event.
///
/// Pure mapping, split out of the FFI path so it can be tested anywhere.
pub(crate) fn cg_parameters(event: &MiddleEvent) -> (u32, u32) {
    let event_type = match event {
        MiddleEvent::Down(_) => CG_EVENT_OTHER_MOUSE_DOWN,
        MiddleEvent::Up(_) => CG_EVENT_OTHER_MOUSE_UP,
        MiddleEvent::Dragged(_) => CG_EVENT_OTHER_MOUSE_DRAGGED,
    };
    (event_type, CG_MOUSE_BUTTON_CENTER)
}

// ---------------------------------------------------------------------------
// Raw FFI
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod ffi {
    use std::ffi::c_void;

    pub type CGEventRef = *mut c_void;

    /// CGPoint in global display coordinates.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct CGPoint {
        pub x: f64,
        pub y: f64,
    }

    #[link(name = "ApplicationServices", kind = "framework")]
    extern "C" {
        /// Creates a mouse event; returns null on failure. A null source is
        /// permitted and uses the default event source.
        pub fn CGEventCreateMouseEvent(
            source: *mut c_void,
            mouse_type: u32,
            mouse_cursor_position: CGPoint,
            mouse_button: u32,
        ) -> CGEventRef;

        pub fn CGEventPost(tap_location: u32, event: CGEventRef);
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        pub fn CFRelease(cf: *const c_void);
    }
}

// ---------------------------------------------------------------------------
// Posting
// ---------------------------------------------------------------------------

/// Builds and posts one synthetic middle-button event at the position
/// copied from the triggering event, then releases it.
#[cfg(target_os = "macos")]
pub(crate) fn post(event: &MiddleEvent) {
    use std::ffi::c_void;

    let (event_type, button) = cg_parameters(event);
    let pos = event.pos();
    let position = ffi::CGPoint { x: pos.x, y: pos.y };

    unsafe {
        let cg_event =
            ffi::CGEventCreateMouseEvent(std::ptr::null_mut(), event_type, position, button);
        if cg_event.is_null() {
            // Best-effort: the original is consumed regardless.
            log::debug!("inject: CGEventCreateMouseEvent returned null for {:?}", event);
            return;
        }
        ffi::CGEventPost(CG_SESSION_EVENT_TAP, cg_event);
        ffi::CFRelease(cg_event.cast::<c_void>());
    }

    log::trace!("inject: posted {:?}", event);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Point;

    const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    /// Every middle event targets the center button.
    #[test]
    fn all_events_use_center_button() {
        for event in [
            MiddleEvent::Down(ORIGIN),
            MiddleEvent::Up(ORIGIN),
            MiddleEvent::Dragged(ORIGIN),
        ] {
            let (_, button) = cg_parameters(&event);
            assert_eq!(button, CG_MOUSE_BUTTON_CENTER);
        }
    }

    #[test]
    fn event_types_map_to_other_mouse_kinds() {
        assert_eq!(
            cg_parameters(&MiddleEvent::Down(ORIGIN)).0,
            CG_EVENT_OTHER_MOUSE_DOWN
        );
        assert_eq!(
            cg_parameters(&MiddleEvent::Up(ORIGIN)).0,
            CG_EVENT_OTHER_MOUSE_UP
        );
        assert_eq!(
            cg_parameters(&MiddleEvent::Dragged(ORIGIN)).0,
            CG_EVENT_OTHER_MOUSE_DRAGGED
        );
    }
}
