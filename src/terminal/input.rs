use std::collections::VecDeque;
use std::time::Duration;

use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, ModifierKeyCode, MouseButton,
    MouseEvent, MouseEventKind,
};
use tokio_util::sync::CancellationToken;

use crate::present::input::{InputEvent, InputSource};

const LEFT_CTRL: u32 = 224;
const LEFT_SHIFT: u32 = 225;
const LEFT_ALT: u32 = 226;
const LEFT_GUI: u32 = 227;
const RIGHT_CTRL: u32 = 228;
const RIGHT_SHIFT: u32 = 229;
const RIGHT_ALT: u32 = 230;
const RIGHT_GUI: u32 = 231;

/// USB HID usage of a key, and whether the character implies Shift.
fn scancode(code: KeyCode) -> Option<(u32, bool)> {
    let plain = |usage| Some((usage, false));
    match code {
        KeyCode::Char(c) => char_scancode(c),
        KeyCode::Enter => plain(40),
        KeyCode::Esc => plain(41),
        KeyCode::Backspace => plain(42),
        KeyCode::Tab => plain(43),
        KeyCode::BackTab => Some((43, true)),
        KeyCode::CapsLock => plain(57),
        KeyCode::F(n @ 1..=12) => plain(58 + n as u32 - 1),
        KeyCode::PrintScreen => plain(70),
        KeyCode::ScrollLock => plain(71),
        KeyCode::Pause => plain(72),
        KeyCode::Insert => plain(73),
        KeyCode::Home => plain(74),
        KeyCode::PageUp => plain(75),
        KeyCode::Delete => plain(76),
        KeyCode::End => plain(77),
        KeyCode::PageDown => plain(78),
        KeyCode::Right => plain(79),
        KeyCode::Left => plain(80),
        KeyCode::Down => plain(81),
        KeyCode::Up => plain(82),
        KeyCode::NumLock => plain(83),
        KeyCode::Menu => plain(101),
        KeyCode::Modifier(modifier) => match modifier {
            ModifierKeyCode::LeftControl => plain(LEFT_CTRL),
            ModifierKeyCode::LeftShift => plain(LEFT_SHIFT),
            ModifierKeyCode::LeftAlt => plain(LEFT_ALT),
            ModifierKeyCode::LeftSuper | ModifierKeyCode::LeftMeta => plain(LEFT_GUI),
            ModifierKeyCode::RightControl => plain(RIGHT_CTRL),
            ModifierKeyCode::RightShift => plain(RIGHT_SHIFT),
            ModifierKeyCode::RightAlt => plain(RIGHT_ALT),
            ModifierKeyCode::RightSuper | ModifierKeyCode::RightMeta => plain(RIGHT_GUI),
            _ => None,
        },
        _ => None,
    }
}

fn char_scancode(c: char) -> Option<(u32, bool)> {
    let usage = match c {
        'a'..='z' => (4 + (c as u32 - 'a' as u32), false),
        'A'..='Z' => (4 + (c as u32 - 'A' as u32), true),
        '1'..='9' => (30 + (c as u32 - '1' as u32), false),
        '0' => (39, false),
        ' ' => (44, false),
        '-' => (45, false),
        '=' => (46, false),
        '[' => (47, false),
        ']' => (48, false),
        '\\' => (49, false),
        ';' => (51, false),
        '\'' => (52, false),
        '`' => (53, false),
        ',' => (54, false),
        '.' => (55, false),
        '/' => (56, false),
        _ => {
            let shifted = "!@#$%^&*()_+{}|:\"~<>?";
            let base = [30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 45, 46, 47, 48, 49, 51, 52, 53, 54, 55, 56];
            let index = shifted.chars().position(|s| s == c)?;
            (base[index], true)
        }
    };
    Some(usage)
}

fn modifier_scancodes(modifiers: KeyModifiers) -> impl Iterator<Item = u32> {
    [
        (KeyModifiers::CONTROL, LEFT_CTRL),
        (KeyModifiers::SHIFT, LEFT_SHIFT),
        (KeyModifiers::ALT, LEFT_ALT),
        (KeyModifiers::SUPER, LEFT_GUI),
    ]
    .into_iter()
    .filter(move |(flag, _)| modifiers.contains(*flag))
    .map(|(_, usage)| usage)
}

fn mouse_button(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 3,
    }
}

/// Turns terminal events into device events.
///
/// Without key release reports every press is released one tick after it
/// was last seen, together with the modifiers that came with it.
struct Translator {
    key_release: bool,
    size: (u16, u16),
    last_cell: Option<(u16, u16)>,
    /// Pressed during the current tick.
    pressed: Vec<u32>,
    /// Pressed during the previous tick, released at the end of this one.
    due: Vec<u32>,
    shutdown: CancellationToken,
}

impl Translator {
    fn new(key_release: bool, size: (u16, u16), shutdown: CancellationToken) -> Self {
        Self {
            key_release,
            size,
            last_cell: None,
            pressed: Vec::new(),
            due: Vec::new(),
            shutdown,
        }
    }

    fn translate(&mut self, event: Event, out: &mut VecDeque<InputEvent>) {
        match event {
            Event::Key(key) => self.key(key, out),
            Event::Mouse(mouse) => self.mouse(mouse, out),
            Event::Resize(width, height) => self.size = (width, height),
            _ => {}
        }
    }

    fn key(&mut self, key: KeyEvent, out: &mut VecDeque<InputEvent>) {
        if key.code == KeyCode::Char('c')
            && key.modifiers.contains(KeyModifiers::CONTROL)
            && key.kind == KeyEventKind::Press
        {
            log::info!("Input: Ctrl+C, shutting down");
            self.shutdown.cancel();
            return;
        }
        let Some((usage, implies_shift)) = scancode(key.code) else {
            log::trace!("Input: unmapped key {:?}", key.code);
            return;
        };

        if self.key_release {
            match key.kind {
                KeyEventKind::Press | KeyEventKind::Repeat => out.push_back(InputEvent::KeyDown(usage)),
                KeyEventKind::Release => out.push_back(InputEvent::KeyUp(usage)),
            }
            return;
        }

        let mut keys: Vec<u32> = modifier_scancodes(key.modifiers).collect();
        if implies_shift && !keys.contains(&LEFT_SHIFT) {
            keys.push(LEFT_SHIFT);
        }
        keys.push(usage);
        for usage in keys {
            self.due.retain(|&k| k != usage);
            if !self.pressed.contains(&usage) {
                self.pressed.push(usage);
            }
            out.push_back(InputEvent::KeyDown(usage));
        }
    }

    fn mouse(&mut self, mouse: MouseEvent, out: &mut VecDeque<InputEvent>) {
        match mouse.kind {
            MouseEventKind::Moved | MouseEventKind::Drag(_) => {
                let (width, height) = self.size;
                let scale = |cell: u16, cells: u16| cell as f32 / cells.saturating_sub(1).max(1) as f32;
                let (dx, dy) = match self.last_cell {
                    Some((column, row)) => (
                        mouse.column as f32 - column as f32,
                        mouse.row as f32 - row as f32,
                    ),
                    None => (0.0, 0.0),
                };
                self.last_cell = Some((mouse.column, mouse.row));
                out.push_back(InputEvent::MouseMotion {
                    x: scale(mouse.column, width).min(1.0),
                    y: scale(mouse.row, height).min(1.0),
                    dx,
                    dy,
                });
            }
            MouseEventKind::Down(button) => out.push_back(InputEvent::MouseButtonDown(mouse_button(button))),
            MouseEventKind::Up(button) => out.push_back(InputEvent::MouseButtonUp(mouse_button(button))),
            MouseEventKind::ScrollUp => out.push_back(InputEvent::Wheel { dx: 0, dy: 1 }),
            MouseEventKind::ScrollDown => out.push_back(InputEvent::Wheel { dx: 0, dy: -1 }),
            MouseEventKind::ScrollLeft => out.push_back(InputEvent::Wheel { dx: -1, dy: 0 }),
            MouseEventKind::ScrollRight => out.push_back(InputEvent::Wheel { dx: 1, dy: 0 }),
        }
    }

    /// Called once no more terminal events are pending.
    fn end_of_tick(&mut self, out: &mut VecDeque<InputEvent>) {
        out.extend(self.due.drain(..).map(InputEvent::KeyUp));
        self.due = std::mem::take(&mut self.pressed);
    }
}

/// Reads key and mouse reports from the terminal.
pub struct TerminalInput {
    translator: Translator,
    queue: VecDeque<InputEvent>,
    tick_closed: bool,
}

impl TerminalInput {
    /// `key_release` tells whether the terminal reports releases itself.
    /// Ctrl+C cancels `shutdown` instead of being forwarded.
    pub fn new(key_release: bool, shutdown: CancellationToken) -> Self {
        let size = crossterm::terminal::size().unwrap_or((80, 24));
        Self {
            translator: Translator::new(key_release, size, shutdown),
            queue: VecDeque::new(),
            tick_closed: false,
        }
    }
}

impl InputSource for TerminalInput {
    fn poll_event(&mut self) -> Option<InputEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.tick_closed {
                self.tick_closed = false;
                return None;
            }
            match event::poll(Duration::ZERO) {
                Ok(true) => match event::read() {
                    Ok(event) => self.translator.translate(event, &mut self.queue),
                    Err(e) => {
                        log::warn!("Input: terminal read failed: {}", e);
                        return None;
                    }
                },
                Ok(false) => {
                    self.translator.end_of_tick(&mut self.queue);
                    self.tick_closed = true;
                }
                Err(e) => {
                    log::warn!("Input: terminal poll failed: {}", e);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent::new(code, modifiers))
    }

    fn translator(key_release: bool) -> (Translator, CancellationToken) {
        let shutdown = CancellationToken::new();
        (Translator::new(key_release, (81, 25), shutdown.clone()), shutdown)
    }

    #[test]
    fn keys_map_to_usage_codes() {
        assert_eq!(scancode(KeyCode::Char('a')), Some((4, false)));
        assert_eq!(scancode(KeyCode::Char('Z')), Some((29, true)));
        assert_eq!(scancode(KeyCode::Char('1')), Some((30, false)));
        assert_eq!(scancode(KeyCode::Char('0')), Some((39, false)));
        assert_eq!(scancode(KeyCode::Char('?')), Some((56, true)));
        assert_eq!(scancode(KeyCode::Esc), Some((41, false)));
        assert_eq!(scancode(KeyCode::F(12)), Some((69, false)));
        assert_eq!(scancode(KeyCode::Up), Some((82, false)));
        assert_eq!(scancode(KeyCode::Char('é')), None);
    }

    #[test]
    fn releases_synthesized_a_tick_later() {
        let (mut translator, _) = translator(false);
        let mut out = VecDeque::new();

        translator.translate(press(KeyCode::Char('A'), KeyModifiers::SHIFT), &mut out);
        translator.end_of_tick(&mut out);
        assert_eq!(
            out.drain(..).collect::<Vec<_>>(),
            vec![InputEvent::KeyDown(LEFT_SHIFT), InputEvent::KeyDown(4)]
        );

        translator.end_of_tick(&mut out);
        assert_eq!(
            out.drain(..).collect::<Vec<_>>(),
            vec![InputEvent::KeyUp(LEFT_SHIFT), InputEvent::KeyUp(4)]
        );

        translator.end_of_tick(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn repeat_postpones_release() {
        let (mut translator, _) = translator(false);
        let mut out = VecDeque::new();
        translator.translate(press(KeyCode::Char('x'), KeyModifiers::NONE), &mut out);
        translator.end_of_tick(&mut out);
        translator.translate(press(KeyCode::Char('x'), KeyModifiers::NONE), &mut out);
        translator.end_of_tick(&mut out);
        assert!(!out.contains(&InputEvent::KeyUp(27)));
    }

    #[test]
    fn reported_releases_pass_through() {
        let (mut translator, _) = translator(true);
        let mut out = VecDeque::new();
        let mut release = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        translator.translate(press(KeyCode::Enter, KeyModifiers::NONE), &mut out);
        translator.translate(Event::Key(release), &mut out);
        translator.end_of_tick(&mut out);
        assert_eq!(
            out.drain(..).collect::<Vec<_>>(),
            vec![InputEvent::KeyDown(40), InputEvent::KeyUp(40)]
        );
    }

    #[test]
    fn ctrl_c_requests_shutdown() {
        let (mut translator, shutdown) = translator(false);
        let mut out = VecDeque::new();
        translator.translate(press(KeyCode::Char('c'), KeyModifiers::CONTROL), &mut out);
        assert!(shutdown.is_cancelled());
        assert!(out.is_empty());
    }

    #[test]
    fn mouse_normalized_to_terminal() {
        let (mut translator, _) = translator(false);
        let mut out = VecDeque::new();
        let event = |kind, column, row| {
            Event::Mouse(MouseEvent {
                kind,
                column,
                row,
                modifiers: KeyModifiers::NONE,
            })
        };
        translator.translate(event(MouseEventKind::Moved, 40, 12), &mut out);
        translator.translate(event(MouseEventKind::Moved, 80, 24), &mut out);
        translator.translate(event(MouseEventKind::Down(MouseButton::Right), 80, 24), &mut out);
        translator.translate(event(MouseEventKind::ScrollDown, 80, 24), &mut out);
        assert_eq!(
            out.drain(..).collect::<Vec<_>>(),
            vec![
                InputEvent::MouseMotion {
                    x: 0.5,
                    y: 0.5,
                    dx: 0.0,
                    dy: 0.0
                },
                InputEvent::MouseMotion {
                    x: 1.0,
                    y: 1.0,
                    dx: 40.0,
                    dy: 12.0
                },
                InputEvent::MouseButtonDown(3),
                InputEvent::Wheel { dx: 0, dy: -1 },
            ]
        );
    }
}
