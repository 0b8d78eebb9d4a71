//! Middle-click session state machine.
//!
//! `Session` tracks whether a Fn+click gesture is currently being remapped
//! and, given a classified tap event, decides what the event callback must
//! do with it. The decision is a value (`Verdict`); the side effects
//! (posting the synthetic event, re-enabling the tap) are performed by the
//! thin adapter in `tap.rs`. This keeps the whole state machine testable
//! without a CGEventTap.
//!
//! The Fn modifier is sampled only at press time. Once a session is
//! active, every subsequent drag and the closing release are remapped to
//! middle-button semantics even if Fn was released mid-gesture, so a drag
//! never snaps back to a left-drag halfway through. Continuity is keyed
//! off button state, not modifier state.
//!
//! `active` is an `AtomicBool`: it is written on the OS delivery thread
//! (inside `decide`) and read/reset from the owning thread during `stop()`.

use std::sync::atomic::{AtomicBool, Ordering};

/// Screen position in global display coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A tap delivery, classified from the raw CGEventType and flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TapEvent {
    /// Left-button press. `fn_held` is the secondary-Fn modifier bit.
    Press { fn_held: bool, pos: Point },
    /// Left-button release.
    Release { pos: Point },
    /// Left-button drag move.
    Drag { pos: Point },
    /// The OS disabled the tap (timeout or user-input policy).
    Revoked,
    /// Any event kind the engine does not handle.
    Other,
}

/// Synthetic middle-button event to inject in place of the original.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MiddleEvent {
    Down(Point),
    Up(Point),
    Dragged(Point),
}

impl MiddleEvent {
    pub fn pos(&self) -> Point {
        match *self {
            MiddleEvent::Down(p) | MiddleEvent::Up(p) | MiddleEvent::Dragged(p) => p,
        }
    }
}

/// What the event callback must do with the delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Return the original event unchanged.
    PassThrough,
    /// Consume the original and inject the replacement.
    Replace(MiddleEvent),
    /// Re-enable the tap, then return the notice unchanged.
    Recover,
}

/// Process-wide interception session. One instance, owned by the tap.
#[derive(Debug, Default)]
pub struct Session {
    active: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between a qualifying press and its matching release.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clears the session. Called when interception stops.
    pub fn reset(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Runs the state machine for one delivery.
    ///
    /// Called only from the tap's delivery thread, which the OS serializes;
    /// there is never more than one `decide` in flight.
    pub fn decide(&self, event: TapEvent) -> Verdict {
        match event {
            TapEvent::Press { fn_held, pos } => {
                if self.is_active() {
                    // Cannot occur for a single-button device, but if the
                    // OS delivers it anyway, do not nest sessions.
                    return Verdict::PassThrough;
                }
                if !fn_held {
                    return Verdict::PassThrough;
                }
                self.active.store(true, Ordering::Release);
                Verdict::Replace(MiddleEvent::Down(pos))
            }
            TapEvent::Release { pos } => {
                if !self.is_active() {
                    return Verdict::PassThrough;
                }
                self.active.store(false, Ordering::Release);
                Verdict::Replace(MiddleEvent::Up(pos))
            }
            TapEvent::Drag { pos } => {
                if !self.is_active() {
                    return Verdict::PassThrough;
                }
                Verdict::Replace(MiddleEvent::Dragged(pos))
            }
            // Revocation never touches the session: an in-flight drag keeps
            // being remapped once the tap is re-enabled.
            TapEvent::Revoked => Verdict::Recover,
            TapEvent::Other => Verdict::PassThrough,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, y: f64) -> Point {
        Point { x, y }
    }

    fn press(fn_held: bool, pos: Point) -> TapEvent {
        TapEvent::Press { fn_held, pos }
    }

    #[test]
    fn new_session_is_inactive() {
        assert!(!Session::new().is_active());
    }

    /// Active toggles press→true, release→false, and never goes true twice
    /// in a row without an intervening release.
    #[test]
    fn session_invariant_press_release_toggle() {
        let s = Session::new();

        assert_eq!(
            s.decide(press(true, at(1.0, 1.0))),
            Verdict::Replace(MiddleEvent::Down(at(1.0, 1.0)))
        );
        assert!(s.is_active());

        // A second press while active must not re-trigger.
        assert_eq!(s.decide(press(true, at(2.0, 2.0))), Verdict::PassThrough);
        assert!(s.is_active());

        assert_eq!(
            s.decide(TapEvent::Release { pos: at(3.0, 3.0) }),
            Verdict::Replace(MiddleEvent::Up(at(3.0, 3.0)))
        );
        assert!(!s.is_active());
    }

    /// A press without Fn never starts a session; once active, drags and the
    /// closing release are remapped even though Fn is no longer sampled.
    #[test]
    fn fn_is_gating_only_at_press_time() {
        let s = Session::new();

        assert_eq!(s.decide(press(false, at(0.0, 0.0))), Verdict::PassThrough);
        assert!(!s.is_active());

        s.decide(press(true, at(0.0, 0.0)));
        assert!(s.is_active());

        // Fn state is not part of Drag/Release at all: the gesture stays
        // remapped regardless of the modifier.
        assert_eq!(
            s.decide(TapEvent::Drag { pos: at(5.0, 5.0) }),
            Verdict::Replace(MiddleEvent::Dragged(at(5.0, 5.0)))
        );
        assert_eq!(
            s.decide(TapEvent::Release { pos: at(5.0, 5.0) }),
            Verdict::Replace(MiddleEvent::Up(at(5.0, 5.0)))
        );
        assert!(!s.is_active());
    }

    /// Unhandled event kinds are never suppressed, in either state.
    #[test]
    fn other_events_pass_through() {
        let s = Session::new();
        assert_eq!(s.decide(TapEvent::Other), Verdict::PassThrough);

        s.decide(press(true, at(0.0, 0.0)));
        assert_eq!(s.decide(TapEvent::Other), Verdict::PassThrough);
        assert!(s.is_active());
    }

    /// Revocation yields exactly one recover verdict and never alters the
    /// session, active or not.
    #[test]
    fn revocation_recovers_without_touching_session() {
        let s = Session::new();
        assert_eq!(s.decide(TapEvent::Revoked), Verdict::Recover);
        assert!(!s.is_active());

        s.decide(press(true, at(0.0, 0.0)));
        assert_eq!(s.decide(TapEvent::Revoked), Verdict::Recover);
        assert!(s.is_active());
    }

    /// One qualifying press yields exactly one middle-down injection.
    #[test]
    fn single_press_injects_exactly_one_middle_down() {
        let s = Session::new();
        let injected: Vec<_> = [press(true, at(4.0, 4.0)), press(true, at(4.0, 4.0))]
            .into_iter()
            .filter_map(|e| match s.decide(e) {
                Verdict::Replace(m @ MiddleEvent::Down(_)) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(injected, vec![MiddleEvent::Down(at(4.0, 4.0))]);
    }

    /// Full gesture with Fn released mid-drag: every event is replaced by
    /// its middle-button equivalent and the session ends closed.
    #[test]
    fn drag_gesture_survives_fn_release() {
        let s = Session::new();
        let events = [
            press(true, at(10.0, 10.0)),
            TapEvent::Drag { pos: at(12.0, 10.0) },
            TapEvent::Drag { pos: at(15.0, 11.0) },
            TapEvent::Release { pos: at(15.0, 11.0) },
        ];
        let verdicts: Vec<_> = events.into_iter().map(|e| s.decide(e)).collect();

        assert_eq!(
            verdicts,
            vec![
                Verdict::Replace(MiddleEvent::Down(at(10.0, 10.0))),
                Verdict::Replace(MiddleEvent::Dragged(at(12.0, 10.0))),
                Verdict::Replace(MiddleEvent::Dragged(at(15.0, 11.0))),
                Verdict::Replace(MiddleEvent::Up(at(15.0, 11.0))),
            ]
        );
        assert!(!s.is_active());
    }

    /// A plain click with Fn absent is untouched from start to finish.
    #[test]
    fn plain_click_is_untouched() {
        let s = Session::new();
        assert_eq!(s.decide(press(false, at(0.0, 0.0))), Verdict::PassThrough);
        assert!(!s.is_active());
        assert_eq!(
            s.decide(TapEvent::Release { pos: at(0.0, 0.0) }),
            Verdict::PassThrough
        );
        assert!(!s.is_active());
    }

    /// Revocation mid-gesture does not lose the session: the drag after
    /// recovery is still remapped.
    #[test]
    fn recovery_preserves_in_flight_session() {
        let s = Session::new();
        assert_eq!(
            s.decide(press(true, at(1.0, 1.0))),
            Verdict::Replace(MiddleEvent::Down(at(1.0, 1.0)))
        );
        assert_eq!(s.decide(TapEvent::Revoked), Verdict::Recover);
        assert!(s.is_active());
        assert_eq!(
            s.decide(TapEvent::Drag { pos: at(2.0, 1.0) }),
            Verdict::Replace(MiddleEvent::Dragged(at(2.0, 1.0)))
        );
        assert!(s.is_active());
    }

    /// Releases outside any session pass through.
    #[test]
    fn stray_release_passes_through() {
        let s = Session::new();
        assert_eq!(
            s.decide(TapEvent::Release { pos: at(9.0, 9.0) }),
            Verdict::PassThrough
        );
    }

    #[test]
    fn reset_clears_active() {
        let s = Session::new();
        s.decide(press(true, at(0.0, 0.0)));
        assert!(s.is_active());
        s.reset();
        assert!(!s.is_active());
    }
}
