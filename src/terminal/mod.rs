//! Full-screen terminal front end: video through a terminal graphics
//! protocol, audio through the default output device, input from the
//! terminal's key and mouse reports.

mod audio;
mod input;

use std::io::{self, Stdout};

use anyhow::anyhow;
use crossterm::cursor::{Hide, Show};
use crossterm::event::{
    DisableMouseCapture, EnableMouseCapture, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, SetTitle, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use ffmpeg_bus::RawFrame;
use ffmpeg_bus::scaler::Scaler;
use image::DynamicImage;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui_image::StatefulImage;
use ratatui_image::picker::{Picker, ProtocolType};

pub use audio::CpalOutput;
pub use input::TerminalInput;

use crate::present::VideoRenderer;

/// Picks the graphics protocol. Must run before raw mode is entered.
///
/// A forced protocol name wins; otherwise the terminal is queried, then
/// guessed from the environment, falling back to half blocks.
pub fn create_picker(force_protocol: Option<&str>) -> Picker {
    if let Some(name) = force_protocol {
        let forced = match name.to_lowercase().as_str() {
            "sixel" => Some(ProtocolType::Sixel),
            "kitty" => Some(ProtocolType::Kitty),
            "iterm2" | "iterm" => Some(ProtocolType::Iterm2),
            "halfblocks" | "half" | "text" => Some(ProtocolType::Halfblocks),
            _ => {
                log::warn!("Terminal: unknown graphics protocol {:?}, detecting", name);
                None
            }
        };
        if let Some(protocol) = forced {
            let mut picker = Picker::halfblocks();
            picker.set_protocol_type(protocol);
            log::info!("Terminal: graphics forced to {:?}", protocol);
            return picker;
        }
    }

    match Picker::from_query_stdio() {
        Ok(picker) => {
            log::info!("Terminal: graphics detected {:?}", picker.protocol_type());
            picker
        }
        Err(e) => {
            let picker = env_heuristic_picker();
            log::info!(
                "Terminal: query failed ({}), graphics {:?} from environment",
                e,
                picker.protocol_type()
            );
            picker
        }
    }
}

fn env_heuristic_picker() -> Picker {
    let term_program = std::env::var("TERM_PROGRAM").unwrap_or_default();
    let term = std::env::var("TERM").unwrap_or_default();
    let windows_terminal = std::env::var_os("WT_SESSION").is_some();

    let protocol = if term_program.contains("WezTerm") || windows_terminal {
        ProtocolType::Sixel
    } else if term_program.contains("iTerm") {
        ProtocolType::Iterm2
    } else if term.contains("kitty")
        || term_program.contains("kitty")
        || term_program.to_lowercase().contains("ghostty")
    {
        ProtocolType::Kitty
    } else {
        ProtocolType::Halfblocks
    };

    let mut picker = Picker::halfblocks();
    picker.set_protocol_type(protocol);
    picker
}

/// Largest size with the source aspect ratio that fits in the bounds.
pub fn fit(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || max_width == 0 || max_height == 0 {
        return (max_width.max(1), max_height.max(1));
    }
    let by_width = (max_width as u64 * height as u64 / width as u64) as u32;
    if by_width <= max_height {
        (max_width, by_width.max(1))
    } else {
        let by_height = (max_height as u64 * width as u64 / height as u64) as u32;
        (by_height.max(1), max_height)
    }
}

/// Draws video frames over the whole alternate screen.
///
/// Owns the terminal mode: raw mode, mouse capture and, where supported,
/// key release reporting are on while it lives.
pub struct TerminalScreen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    picker: Picker,
    scaler: Scaler,
    key_release: bool,
}

impl TerminalScreen {
    pub fn open(picker: Picker) -> anyhow::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture, Hide)?;

        let key_release = supports_keyboard_enhancement().unwrap_or(false);
        if key_release {
            execute!(
                stdout,
                PushKeyboardEnhancementFlags(
                    KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                        | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
                )
            )?;
        } else {
            log::info!("Terminal: key releases not reported, synthesizing them");
        }

        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.clear()?;
        Ok(Self {
            terminal,
            picker,
            scaler: Scaler::new(),
            key_release,
        })
    }

    /// Whether the terminal reports key releases itself.
    pub fn reports_key_release(&self) -> bool {
        self.key_release
    }

    fn restore(&mut self) -> io::Result<()> {
        if self.key_release {
            execute!(self.terminal.backend_mut(), PopKeyboardEnhancementFlags)?;
        }
        execute!(
            self.terminal.backend_mut(),
            DisableMouseCapture,
            LeaveAlternateScreen,
            Show
        )?;
        disable_raw_mode()
    }
}

impl VideoRenderer<RawFrame> for TerminalScreen {
    fn prepare(&mut self) -> anyhow::Result<()> {
        self.scaler.reset();
        self.terminal.clear()?;
        Ok(())
    }

    fn render(&mut self, frame: &RawFrame) -> anyhow::Result<()> {
        let RawFrame::Video(video) = frame else {
            return Err(anyhow!("not a video frame"));
        };

        let area = self.terminal.size()?;
        let (cell_width, cell_height) = self.picker.font_size();
        let (width, height) = fit(
            video.width(),
            video.height(),
            area.width as u32 * cell_width as u32,
            area.height as u32 * cell_height as u32,
        );
        let rgb = self.scaler.to_rgb(video, width, height)?;
        let image = image::RgbImage::from_raw(rgb.width, rgb.height, rgb.data)
            .ok_or_else(|| anyhow!("rgb buffer doesn't match {}x{}", width, height))?;

        let mut protocol = self
            .picker
            .new_resize_protocol(DynamicImage::ImageRgb8(image));
        self.terminal.draw(|f| {
            f.render_stateful_widget(StatefulImage::default(), f.area(), &mut protocol);
        })?;
        Ok(())
    }

    fn set_title(&mut self, title: &str) {
        if let Err(e) = execute!(self.terminal.backend_mut(), SetTitle(title)) {
            log::debug!("Terminal: couldn't set title: {}", e);
        }
    }
}

impl Drop for TerminalScreen {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::error!("Terminal: couldn't restore terminal: {}", e);
        }
    }
}
