//! Terminal observer for a headless install.
//!
//! Prints each update as it arrives. On a terminal, warnings are yellow,
//! errors red, command echoes bold, and progress updates overwrite the
//! previous line. Without a terminal the output is plain text.

use crossterm::{
    cursor::MoveToPreviousLine,
    queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};
use std::sync::mpsc::Receiver;

use crate::progress::{MsgLevel, Update};

pub struct ConsoleRenderer<W: Write> {
    out: W,
    styled: bool,
    /// The last thing printed was exactly one complete line.
    line_erasable: bool,
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W, styled: bool) -> Self {
        Self {
            out,
            styled,
            line_erasable: false,
        }
    }

    pub fn render(&mut self, update: &Update) -> io::Result<()> {
        if let Some(stage) = update.stage {
            queue!(self.out, Print(format!("Starting stage {}\n", stage)))?;
            self.line_erasable = false;
        }
        if update.msg.is_empty() {
            return self.out.flush();
        }

        if self.styled && update.trim_last_line && self.line_erasable {
            queue!(self.out, MoveToPreviousLine(1), Clear(ClearType::CurrentLine))?;
        }

        if self.styled {
            match update.level {
                MsgLevel::Info => {}
                MsgLevel::Warning => queue!(self.out, SetForegroundColor(Color::Yellow))?,
                MsgLevel::Error => queue!(self.out, SetForegroundColor(Color::Red))?,
                MsgLevel::Command => queue!(self.out, SetAttribute(Attribute::Bold))?,
            }
        }
        queue!(self.out, Print(&update.msg))?;
        if self.styled && update.level != MsgLevel::Info {
            queue!(self.out, SetAttribute(Attribute::Reset), ResetColor)?;
        }

        self.line_erasable =
            update.msg.ends_with('\n') && update.msg.matches('\n').count() == 1;
        self.out.flush()
    }

    /// Render every update until the channel closes.
    pub fn consume(&mut self, updates: Receiver<Update>) -> io::Result<()> {
        for update in updates {
            self.render(&update)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
