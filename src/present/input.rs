//! Local input capture.
//!
//! Device events are folded into an [`InputSnapshot`]; once per tick the
//! snapshot yields a message holding only what changed since the last one.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::protocol::InputMessage;

/// Input sampling period (125 Hz).
pub const INPUT_TICK: Duration = Duration::from_millis(8);
/// Two Escape presses within this window toggle relative pointer mode.
pub const DOUBLE_TAP_WINDOW: Duration = Duration::from_millis(400);
/// USB HID usage of the Escape key.
pub const SCANCODE_ESCAPE: u32 = 41;
pub const GAMEPAD_AXES: usize = 6;

/// A single device event. Keys are USB HID usage codes, mouse buttons are
/// numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown(u32),
    KeyUp(u32),
    /// `x`/`y` is the absolute position normalized to [0, 1]; `dx`/`dy` the
    /// movement since the previous motion event.
    MouseMotion { x: f32, y: f32, dx: f32, dy: f32 },
    MouseButtonDown(u8),
    MouseButtonUp(u8),
    Wheel { dx: i32, dy: i32 },
    GamepadAxis { axis: u8, value: i16 },
    GamepadButtonDown(u8),
    GamepadButtonUp(u8),
}

pub trait InputSource: Send {
    /// Next pending event, without blocking.
    fn poll_event(&mut self) -> Option<InputEvent>;
}

#[derive(Debug, Default)]
pub struct InputSnapshot {
    released: BTreeSet<u32>,
    held: BTreeSet<u32>,
    keys_changed: bool,
    relative: bool,
    pointer: Option<[f32; 2]>,
    buttons: u32,
    sent_buttons: u32,
    wheel: [i32; 2],
    axes: [i16; GAMEPAD_AXES],
    sent_axes: [i16; GAMEPAD_AXES],
    pad_buttons: u32,
    sent_pad_buttons: u32,
    last_escape: Option<Instant>,
}

impl InputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn apply(&mut self, event: InputEvent, now: Instant) {
        match event {
            InputEvent::KeyDown(key) => {
                if key == SCANCODE_ESCAPE && !self.held.contains(&key) {
                    self.escape_pressed(now);
                }
                self.released.remove(&key);
                self.keys_changed |= self.held.insert(key);
            }
            InputEvent::KeyUp(key) => {
                if self.held.remove(&key) {
                    self.released.insert(key);
                    self.keys_changed = true;
                }
            }
            InputEvent::MouseMotion { x, y, dx, dy } => {
                self.pointer = Some(match (self.relative, self.pointer) {
                    (true, Some([ax, ay])) => [ax + dx, ay + dy],
                    (true, None) => [dx, dy],
                    (false, _) => [x, y],
                });
            }
            InputEvent::MouseButtonDown(button) => self.buttons |= button_bit(button),
            InputEvent::MouseButtonUp(button) => self.buttons &= !button_bit(button),
            InputEvent::Wheel { dx, dy } => {
                self.wheel[0] += dx;
                self.wheel[1] += dy;
            }
            InputEvent::GamepadAxis { axis, value } => {
                if let Some(lane) = self.axes.get_mut(axis as usize) {
                    *lane = value;
                }
            }
            InputEvent::GamepadButtonDown(button) if button < 32 => {
                self.pad_buttons |= 1 << button;
            }
            InputEvent::GamepadButtonUp(button) if button < 32 => {
                self.pad_buttons &= !(1 << button);
            }
            InputEvent::GamepadButtonDown(_) | InputEvent::GamepadButtonUp(_) => {}
        }
    }

    fn escape_pressed(&mut self, now: Instant) {
        match self.last_escape {
            Some(previous) if now.saturating_duration_since(previous) <= DOUBLE_TAP_WINDOW => {
                self.relative = !self.relative;
                self.pointer = None;
                self.last_escape = None;
                log::info!(
                    "Input: pointer mode {}",
                    if self.relative { "relative" } else { "absolute" }
                );
            }
            _ => self.last_escape = Some(now),
        }
    }

    /// Fields changed since the previous call. Clears per-tick deltas.
    pub fn take_message(&mut self) -> InputMessage {
        let mut message = InputMessage::default();

        if self.keys_changed {
            message.keys = Some([
                self.released.iter().copied().collect(),
                self.held.iter().copied().collect(),
            ]);
            self.released.clear();
            self.keys_changed = false;
        }
        if let Some(pointer) = self.pointer.take() {
            if !self.relative || pointer != [0.0, 0.0] {
                message.mouse = Some(pointer);
            }
        }
        if self.buttons != self.sent_buttons {
            message.buttons = Some(self.buttons);
            self.sent_buttons = self.buttons;
        }
        if self.wheel != [0, 0] {
            message.wheel = Some(std::mem::take(&mut self.wheel));
        }
        if self.axes != self.sent_axes {
            message.axes = Some(self.axes);
            self.sent_axes = self.axes;
        }
        if self.pad_buttons != self.sent_pad_buttons {
            message.gamepad_buttons = Some(self.pad_buttons);
            self.sent_pad_buttons = self.pad_buttons;
        }
        message
    }
}

fn button_bit(button: u8) -> u32 {
    match button {
        1..=32 => 1 << (button - 1),
        _ => 0,
    }
}

/// Drains `source` into `snapshot` and returns the changes, if any.
pub fn capture_tick(
    snapshot: &mut InputSnapshot,
    source: &mut dyn InputSource,
    now: Instant,
) -> Option<InputMessage> {
    while let Some(event) = source.poll_event() {
        snapshot.apply(event, now);
    }
    let message = snapshot.take_message();
    (!message.is_empty()).then_some(message)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    struct Scripted(VecDeque<InputEvent>);

    impl Scripted {
        fn push(&mut self, events: &[InputEvent]) {
            self.0.extend(events.iter().copied());
        }
    }

    impl InputSource for Scripted {
        fn poll_event(&mut self) -> Option<InputEvent> {
            self.0.pop_front()
        }
    }

    #[test]
    fn idle_ticks_send_nothing() {
        let mut snapshot = InputSnapshot::new();
        let mut source = Scripted::default();
        let now = Instant::now();

        source.push(&[InputEvent::KeyDown(4), InputEvent::GamepadAxis { axis: 2, value: 900 }]);
        let first = capture_tick(&mut snapshot, &mut source, now).unwrap();
        assert_eq!(first.keys, Some([vec![], vec![4]]));
        assert_eq!(first.axes, Some([0, 0, 900, 0, 0, 0]));

        assert_eq!(capture_tick(&mut snapshot, &mut source, now), None);
        source.push(&[
            InputEvent::KeyDown(4),
            InputEvent::GamepadAxis { axis: 2, value: 900 },
        ]);
        assert_eq!(capture_tick(&mut snapshot, &mut source, now), None);
    }

    #[test]
    fn release_reported_once() {
        let mut snapshot = InputSnapshot::new();
        let now = Instant::now();
        snapshot.apply(InputEvent::KeyDown(4), now);
        snapshot.apply(InputEvent::KeyDown(5), now);
        snapshot.take_message();

        snapshot.apply(InputEvent::KeyUp(4), now);
        assert_eq!(snapshot.take_message().keys, Some([vec![4], vec![5]]));
        assert_eq!(snapshot.take_message().keys, None);
    }

    #[test]
    fn release_of_unheld_key_is_ignored() {
        let mut snapshot = InputSnapshot::new();
        let now = Instant::now();
        snapshot.apply(InputEvent::KeyUp(9), now);
        assert_eq!(snapshot.take_message().keys, None);

        snapshot.apply(InputEvent::KeyDown(4), now);
        snapshot.take_message();
        snapshot.apply(InputEvent::KeyUp(4), now);
        snapshot.apply(InputEvent::KeyUp(4), now);
        assert_eq!(snapshot.take_message().keys, Some([vec![4], vec![]]));
    }

    #[test]
    fn buttons_are_a_bitmask() {
        let mut snapshot = InputSnapshot::new();
        let now = Instant::now();
        snapshot.apply(InputEvent::MouseButtonDown(1), now);
        snapshot.apply(InputEvent::MouseButtonDown(3), now);
        assert_eq!(snapshot.take_message().buttons, Some(0b101));
        snapshot.apply(InputEvent::MouseButtonUp(1), now);
        assert_eq!(snapshot.take_message().buttons, Some(0b100));
        assert_eq!(snapshot.take_message().buttons, None);
    }

    #[test]
    fn wheel_is_a_per_tick_delta() {
        let mut snapshot = InputSnapshot::new();
        let now = Instant::now();
        snapshot.apply(InputEvent::Wheel { dx: 0, dy: 1 }, now);
        snapshot.apply(InputEvent::Wheel { dx: 0, dy: 1 }, now);
        assert_eq!(snapshot.take_message().wheel, Some([0, 2]));
        assert!(snapshot.take_message().is_empty());
    }

    #[test]
    fn gamepad_buttons_tracked() {
        let mut snapshot = InputSnapshot::new();
        let now = Instant::now();
        snapshot.apply(InputEvent::GamepadButtonDown(0), now);
        snapshot.apply(InputEvent::GamepadButtonDown(14), now);
        assert_eq!(snapshot.take_message().gamepad_buttons, Some(1 | 1 << 14));
        snapshot.apply(InputEvent::GamepadButtonUp(0), now);
        assert_eq!(snapshot.take_message().gamepad_buttons, Some(1 << 14));
    }

    #[test]
    fn double_escape_toggles_relative_pointer() {
        let mut snapshot = InputSnapshot::new();
        let t0 = Instant::now();
        let motion = |x, dx| InputEvent::MouseMotion {
            x,
            y: 0.5,
            dx,
            dy: 0.0,
        };

        snapshot.apply(motion(0.25, 3.0), t0);
        assert_eq!(snapshot.take_message().mouse, Some([0.25, 0.5]));

        snapshot.apply(InputEvent::KeyDown(SCANCODE_ESCAPE), t0);
        snapshot.apply(InputEvent::KeyUp(SCANCODE_ESCAPE), t0);
        snapshot.apply(InputEvent::KeyDown(SCANCODE_ESCAPE), t0 + Duration::from_millis(200));
        assert!(snapshot.is_relative());

        snapshot.apply(motion(0.3, 2.0), t0);
        snapshot.apply(motion(0.35, 1.5), t0);
        assert_eq!(snapshot.take_message().mouse, Some([3.5, 0.0]));
        assert_eq!(snapshot.take_message().mouse, None);
    }

    #[test]
    fn slow_escapes_do_not_toggle() {
        let mut snapshot = InputSnapshot::new();
        let t0 = Instant::now();
        snapshot.apply(InputEvent::KeyDown(SCANCODE_ESCAPE), t0);
        snapshot.apply(InputEvent::KeyUp(SCANCODE_ESCAPE), t0);
        snapshot.apply(InputEvent::KeyDown(SCANCODE_ESCAPE), t0 + Duration::from_millis(900));
        assert!(!snapshot.is_relative());
    }
}
