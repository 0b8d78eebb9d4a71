//! Left-mouse interception via CGEventTap and CFRunLoop.
//!
//! `EventTap` owns the tap subscription. `start()` creates the event tap
//! on the calling thread so that permission errors surface immediately,
//! then spawns a background thread that adds the tap to a CFRunLoop and
//! drives delivery. The OS serializes callback invocations on that thread,
//! so the session state machine runs strictly one event at a time.
//!
//! Required permissions: Accessibility must be granted in
//!   System Settings > Privacy & Security > Accessibility.
//! `AXIsProcessTrusted()` is called first; if it returns false the call
//! fails with `TapError::PermissionDenied` before any tap is created.
//!
//! Memory ownership:
//!   The background thread owns the tap port (CFMachPortRef), the initial
//!   run loop source, and the callback state (TapState). All three are
//!   released after `CFRunLoopRun` returns (i.e. after `stop()` completes).
//!
//! Auto-recovery: when the OS disables the tap (callback latency timeout
//! or user-input security policy) it delivers a disabled-notice to the
//! same callback. The callback re-enables the tap right there and passes
//! the notice through. The session flag is untouched, so an in-flight
//! drag keeps being remapped after recovery.

use crate::session::{Point, TapEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// CGEventType value for left-button press.
pub(crate) const CG_EVENT_LEFT_MOUSE_DOWN: u32 = 1;

/// CGEventType value for left-button release.
pub(crate) const CG_EVENT_LEFT_MOUSE_UP: u32 = 2;

/// CGEventType value for left-button drag.
pub(crate) const CG_EVENT_LEFT_MOUSE_DRAGGED: u32 = 6;

/// kCGEventTapDisabledByTimeout: the callback exceeded the OS deadline.
pub(crate) const CG_EVENT_TAP_DISABLED_BY_TIMEOUT: u32 = 0xFFFF_FFFE;

/// kCGEventTapDisabledByUserInput: a security policy disabled the tap.
pub(crate) const CG_EVENT_TAP_DISABLED_BY_USER_INPUT: u32 = 0xFFFF_FFFF;

/// Event mask: LeftMouseDown | LeftMouseUp | LeftMouseDragged.
/// Disabled-notices are delivered regardless of the mask.
const EVENT_MASK: u64 = (1u64 << CG_EVENT_LEFT_MOUSE_DOWN)
    | (1u64 << CG_EVENT_LEFT_MOUSE_UP)
    | (1u64 << CG_EVENT_LEFT_MOUSE_DRAGGED);

/// kCGEventFlagMaskSecondaryFn (NX_SECONDARYFNMASK): the Fn modifier bit.
pub(crate) const CG_EVENT_FLAG_MASK_SECONDARY_FN: u64 = 0x0080_0000;

/// kCGSessionEventTap: tap at the login-session level, before dispatch to
/// applications. Synthetic events are posted at the same location.
#[cfg(target_os = "macos")]
const CG_SESSION_EVENT_TAP: u32 = 1;

/// kCGHeadInsertEventTap: insert at the head of the tap list so this
/// engine sees events before any other consumer.
#[cfg(target_os = "macos")]
const CG_HEAD_INSERT_EVENT_TAP: u32 = 0;

/// kCGEventTapOptionDefault: active tap; the callback may modify or
/// suppress events.
#[cfg(target_os = "macos")]
const CG_EVENT_TAP_OPTION_DEFAULT: u32 = 0;

// ---------------------------------------------------------------------------
// Event classification
// ---------------------------------------------------------------------------

/// Maps a raw CGEventType (plus the sampled Fn bit and location) to the
/// state machine's input alphabet.
pub(crate) fn classify(event_type: u32, fn_held: bool, pos: Point) -> TapEvent {
    match event_type {
        CG_EVENT_LEFT_MOUSE_DOWN => TapEvent::Press { fn_held, pos },
        CG_EVENT_LEFT_MOUSE_UP => TapEvent::Release { pos },
        CG_EVENT_LEFT_MOUSE_DRAGGED => TapEvent::Drag { pos },
        CG_EVENT_TAP_DISABLED_BY_TIMEOUT | CG_EVENT_TAP_DISABLED_BY_USER_INPUT => TapEvent::Revoked,
        _ => TapEvent::Other,
    }
}

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
pub use platform::EventTap;

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicPtr, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::error::TapError;
    use crate::inject;
    use crate::session::{Session, Verdict};

    // -----------------------------------------------------------------------
    // Raw FFI types and declarations
    // -----------------------------------------------------------------------

    type CFMachPortRef = *mut c_void;
    type CFRunLoopRef = *mut c_void;
    type CFRunLoopSourceRef = *mut c_void;
    type CFStringRef = *const c_void;
    type CGEventRef = *mut c_void;
    type CGEventTapProxy = *mut c_void;

    /// CGPoint in global display coordinates.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct CGPoint {
        x: f64,
        y: f64,
    }

    /// Signature required by CGEventTapCreate for the C callback.
    type CGEventTapCallBack = unsafe extern "C" fn(
        proxy: CGEventTapProxy,
        event_type: u32,
        event: CGEventRef,
        user_info: *mut c_void,
    ) -> CGEventRef;

    #[link(name = "ApplicationServices", kind = "framework")]
    extern "C" {
        /// Returns true if this process has been granted Accessibility permission.
        fn AXIsProcessTrusted() -> bool;

        /// Creates an event tap; returns null on permission failure or system error.
        fn CGEventTapCreate(
            tap: u32,
            place: u32,
            options: u32,
            events_of_interest: u64,
            callback: CGEventTapCallBack,
            user_info: *mut c_void,
        ) -> CFMachPortRef;

        /// Enables or disables an event tap.
        fn CGEventTapEnable(tap: CFMachPortRef, enable: bool);

        /// Reads the modifier-flag bitset from a CGEvent.
        fn CGEventGetFlags(event: CGEventRef) -> u64;

        /// Reads the screen position from a CGEvent.
        fn CGEventGetLocation(event: CGEventRef) -> CGPoint;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        /// Creates a CFRunLoopSource backed by a CFMachPort.
        fn CFMachPortCreateRunLoopSource(
            allocator: *mut c_void,
            port: CFMachPortRef,
            order: isize,
        ) -> CFRunLoopSourceRef;

        /// Returns the CFRunLoop for the calling thread.
        fn CFRunLoopGetCurrent() -> CFRunLoopRef;

        /// Adds a source to a run loop for the given mode.
        fn CFRunLoopAddSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFStringRef);

        /// Runs the current thread's run loop until CFRunLoopStop is called.
        fn CFRunLoopRun();

        /// Stops the specified run loop.
        fn CFRunLoopStop(rl: CFRunLoopRef);

        /// Releases a Core Foundation object.
        fn CFRelease(cf: *const c_void);

        /// Run loop mode constant matching all common modes.
        static kCFRunLoopCommonModes: CFStringRef;
    }

    // -----------------------------------------------------------------------
    // Thread-safety wrappers for raw pointers
    // -----------------------------------------------------------------------

    /// Wraps CFRunLoopRef for cross-thread transfer.
    ///
    /// Apple's documentation states that CFRunLoopStop may be called from
    /// any thread. CFRunLoopRef itself follows CF thread-safety rules.
    struct SendableRunLoop(CFRunLoopRef);
    unsafe impl Send for SendableRunLoop {}

    /// Wraps CFMachPortRef for cross-thread transfer.
    ///
    /// Core Foundation types are safe to share between threads per Apple docs.
    struct SendableMachPort(CFMachPortRef);
    unsafe impl Send for SendableMachPort {}

    /// Wraps *mut TapState for cross-thread transfer.
    ///
    /// The raw pointer is handed off to the background thread which becomes
    /// the sole owner. The calling thread no longer accesses it after handoff.
    struct SendableStatePtr(*mut TapState);
    unsafe impl Send for SendableStatePtr {}

    // -----------------------------------------------------------------------
    // Callback state
    // -----------------------------------------------------------------------

    /// Heap-allocated state passed to the C callback via the `user_info`
    /// pointer. No global mutable state: the callback reaches the session
    /// and the tap port only through this struct.
    ///
    /// Kept alive (via `Box::into_raw`) for the full lifetime of the event
    /// tap. The background thread reclaims it with `Box::from_raw` after
    /// `CFRunLoopRun` returns.
    struct TapState {
        session: Arc<Session>,
        /// Set once, between tap creation and enabling; read by the
        /// callback when re-enabling after an OS revocation.
        port: AtomicPtr<c_void>,
    }

    // -----------------------------------------------------------------------
    // Public struct
    // -----------------------------------------------------------------------

    /// Left-mouse interception engine backed by a CGEventTap.
    pub struct EventTap {
        session: Arc<Session>,
        run_loop: Option<SendableRunLoop>,
        thread: Option<JoinHandle<()>>,
    }

    impl EventTap {
        pub fn new() -> Self {
            Self {
                session: Arc::new(Session::new()),
                run_loop: None,
                thread: None,
            }
        }

        pub fn is_running(&self) -> bool {
            self.run_loop.is_some()
        }

        /// Creates and enables the tap. Idempotent: a second call while
        /// running is a no-op returning `Ok`.
        pub fn start(&mut self) -> Result<(), TapError> {
            if self.run_loop.is_some() {
                log::debug!("tap: start() while already running, ignoring");
                return Ok(());
            }

            // Fail fast with a clear message rather than letting
            // CGEventTapCreate return null without explanation.
            if !unsafe { AXIsProcessTrusted() } {
                return Err(TapError::PermissionDenied(
                    "Accessibility permission required. \
                     Grant it in System Settings > Privacy & Security > Accessibility."
                        .into(),
                ));
            }

            // Heap-allocate TapState so its address is stable for the tap
            // lifetime.
            let state_ptr = Box::into_raw(Box::new(TapState {
                session: Arc::clone(&self.session),
                port: AtomicPtr::new(std::ptr::null_mut()),
            }));

            // Create the tap on the calling thread so errors surface
            // synchronously.
            let tap_port = unsafe {
                CGEventTapCreate(
                    CG_SESSION_EVENT_TAP,
                    CG_HEAD_INSERT_EVENT_TAP,
                    CG_EVENT_TAP_OPTION_DEFAULT,
                    EVENT_MASK,
                    tap_callback,
                    state_ptr.cast::<c_void>(),
                )
            };

            if tap_port.is_null() {
                // Reclaim TapState before returning the error.
                drop(unsafe { Box::from_raw(state_ptr) });
                return Err(TapError::TapCreateFailed(
                    "CGEventTapCreate returned null. \
                     Verify Accessibility permission is active."
                        .into(),
                ));
            }

            // The callback needs the port to re-enable the tap after an OS
            // revocation. Publish it before the tap is enabled.
            unsafe { (*state_ptr).port.store(tap_port, Ordering::Release) };

            // Send pointers into the worker via channel so the spawn closure
            // only captures Send types (the channel). The worker receives and
            // owns them on its thread.
            let (handoff_tx, handoff_rx) = mpsc::channel::<(SendableMachPort, SendableStatePtr)>();
            let _ = handoff_tx.send((SendableMachPort(tap_port), SendableStatePtr(state_ptr)));

            // Channel to receive the background thread's run loop reference.
            let (rl_tx, rl_rx) = mpsc::channel::<SendableRunLoop>();

            let thread = thread::spawn(move || {
                let (sendable_tap, sendable_state) = match handoff_rx.recv() {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let tap_port = sendable_tap.0;
                let state_ptr = sendable_state.0;

                unsafe {
                    let source = CFMachPortCreateRunLoopSource(std::ptr::null_mut(), tap_port, 0);

                    let run_loop = CFRunLoopGetCurrent();
                    CFRunLoopAddSource(run_loop, source, kCFRunLoopCommonModes);
                    // The run loop now retains the source; release our reference.
                    CFRelease(source.cast::<c_void>());

                    CGEventTapEnable(tap_port, true);
                    log::info!("tap: CGEventTap active, remapping Fn+click to middle-click");

                    // Notify the calling thread that the run loop is ready.
                    let _ = rl_tx.send(SendableRunLoop(run_loop));

                    // Block until stop() calls CFRunLoopStop.
                    CFRunLoopRun();

                    log::info!("tap: CFRunLoop exited");

                    // Disable the tap and release all owned resources.
                    CGEventTapEnable(tap_port, false);
                    CFRelease(tap_port.cast::<c_void>());
                    drop(Box::from_raw(state_ptr));
                }
            });

            // Wait for the background thread to confirm the run loop is
            // running before returning, so the first event can be remapped
            // immediately.
            match rl_rx.recv() {
                Ok(rl) => {
                    self.run_loop = Some(rl);
                    self.thread = Some(thread);
                    Ok(())
                }
                Err(_) => {
                    log::warn!("tap: delivery thread exited before run loop was ready");
                    let _ = thread.join();
                    Err(TapError::TapCreateFailed(
                        "delivery thread exited before run loop was ready".into(),
                    ))
                }
            }
        }

        /// Disables and releases the tap. Idempotent; safe to call from the
        /// owning thread while the delivery thread is processing events.
        pub fn stop(&mut self) {
            // Signal the run loop to exit; the background thread releases
            // the tap.
            if let Some(SendableRunLoop(rl)) = self.run_loop.take() {
                unsafe { CFRunLoopStop(rl) };
            }
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
            self.session.reset();
        }
    }

    impl Default for EventTap {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for EventTap {
        fn drop(&mut self) {
            self.stop();
        }
    }

    // -----------------------------------------------------------------------
    // C callback
    // -----------------------------------------------------------------------

    /// Called by the OS on the run loop thread for each matching event.
    ///
    /// Must not block: exceeding the OS processing deadline is exactly what
    /// gets the tap disabled. The work here is one atomic state transition,
    /// at most one synchronous CGEventPost, and a return.
    unsafe extern "C" fn tap_callback(
        _proxy: CGEventTapProxy,
        event_type: u32,
        event: CGEventRef,
        user_info: *mut c_void,
    ) -> CGEventRef {
        let state = &*(user_info as *const TapState);

        // Read flags and location only for the mouse kinds; a disabled
        // notice carries no meaningful payload.
        let tap_event = match event_type {
            CG_EVENT_LEFT_MOUSE_DOWN | CG_EVENT_LEFT_MOUSE_UP | CG_EVENT_LEFT_MOUSE_DRAGGED => {
                let fn_held =
                    CGEventGetFlags(event) & CG_EVENT_FLAG_MASK_SECONDARY_FN != 0;
                let location = CGEventGetLocation(event);
                classify(
                    event_type,
                    fn_held,
                    Point {
                        x: location.x,
                        y: location.y,
                    },
                )
            }
            _ => classify(event_type, false, Point { x: 0.0, y: 0.0 }),
        };

        match state.session.decide(tap_event) {
            Verdict::PassThrough => event,
            Verdict::Replace(middle) => {
                // Suppress the original; the injected middle event is the
                // sole event the applications see for this delivery.
                inject::post(&middle);
                log::trace!("tap: replaced {:?} with {:?}", tap_event, middle);
                std::ptr::null_mut()
            }
            Verdict::Recover => {
                let port = state.port.load(Ordering::Acquire);
                if !port.is_null() {
                    CGEventTapEnable(port, true);
                    log::warn!("tap: re-enabled after OS revocation (type {})", event_type);
                }
                event
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn new_produces_idle_state() {
            let tap = EventTap::new();
            assert!(!tap.is_running());
            assert!(!tap.session.is_active());
        }

        /// Stopping a tap that was never started must be a no-op.
        #[test]
        fn stop_on_unstarted_tap_is_noop() {
            let mut tap = EventTap::new();
            tap.stop();
            assert!(!tap.is_running());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    #[test]
    fn left_mouse_kinds_classify_with_position() {
        let pos = Point { x: 3.0, y: 7.0 };
        assert_eq!(
            classify(CG_EVENT_LEFT_MOUSE_DOWN, true, pos),
            TapEvent::Press { fn_held: true, pos }
        );
        assert_eq!(
            classify(CG_EVENT_LEFT_MOUSE_UP, false, pos),
            TapEvent::Release { pos }
        );
        assert_eq!(
            classify(CG_EVENT_LEFT_MOUSE_DRAGGED, false, pos),
            TapEvent::Drag { pos }
        );
    }

    #[test]
    fn both_disabled_notices_classify_as_revoked() {
        assert_eq!(
            classify(CG_EVENT_TAP_DISABLED_BY_TIMEOUT, false, ORIGIN),
            TapEvent::Revoked
        );
        assert_eq!(
            classify(CG_EVENT_TAP_DISABLED_BY_USER_INPUT, false, ORIGIN),
            TapEvent::Revoked
        );
    }

    /// Kinds outside the mask (scroll, keyboard, plain moves) must land on
    /// the pass-through path.
    #[test]
    fn unhandled_kinds_classify_as_other() {
        // RightMouseDown, MouseMoved, KeyDown, ScrollWheel.
        for event_type in [3, 5, 10, 22] {
            assert_eq!(classify(event_type, true, ORIGIN), TapEvent::Other);
        }
    }
}
