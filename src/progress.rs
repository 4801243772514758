//! Progress events flowing from a run to its observer.
//!
//! Updates travel over a bounded channel of capacity one, so a slow observer
//! stalls the producer instead of letting events pile up. All senders are
//! dropped when the run thread exits; the receiver seeing the channel close
//! is the end-of-run signal.

use std::sync::mpsc::{self, Receiver, SyncSender};
use strum::{Display, EnumIter, EnumString};
use tracing::debug;

/// Coarse pipeline phase, shown to the observer when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Format,
    Configure,
    Copy,
}

/// How an update should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum MsgLevel {
    #[default]
    Info,
    Warning,
    Error,
    Command,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Update {
    /// Set when the run enters a new stage.
    pub stage: Option<Stage>,
    /// Text to append to the transcript; may be empty.
    pub msg: String,
    pub level: MsgLevel,
    /// Replace the last transcript line instead of appending.
    pub trim_last_line: bool,
}

impl Update {
    pub fn message(level: MsgLevel, msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            level,
            ..Self::default()
        }
    }

    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }
}

/// Create the bounded update channel.
pub fn update_channel() -> (UpdateSender, Receiver<Update>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (UpdateSender { tx }, rx)
}

/// Producer half of the update channel.
///
/// Sends block while the observer is behind. Once the observer has gone away
/// updates are discarded; the run still finishes and reports its outcome
/// through its handle.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: SyncSender<Update>,
}

impl UpdateSender {
    pub fn send(&self, update: Update) {
        if self.tx.send(update).is_err() {
            debug!("Update observer disconnected; discarding update");
        }
    }

    pub fn stage(&self, stage: Stage) {
        self.send(Update::stage(stage));
    }

    /// Indented informational line.
    pub fn info(&self, msg: impl AsRef<str>) {
        self.send(Update::message(MsgLevel::Info, format!("  {}\n", msg.as_ref())));
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.send(Update::message(MsgLevel::Warning, msg));
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.send(Update::message(MsgLevel::Error, msg));
    }

    pub fn command(&self, msg: impl Into<String>) {
        self.send(Update::message(MsgLevel::Command, msg));
    }

    /// Raw message at `level`, no indentation added.
    pub fn raw(&self, level: MsgLevel, msg: impl Into<String>) {
        self.send(Update::message(level, msg));
    }

    pub fn blank(&self) {
        self.send(Update::message(MsgLevel::Info, "\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stage_ids() {
        assert_eq!(Stage::Format.to_string(), "format");
        assert_eq!(Stage::Configure.to_string(), "configure");
        assert_eq!(Stage::Copy.to_string(), "copy");
        assert_eq!(Stage::from_str("copy").unwrap(), Stage::Copy);
    }

    #[test]
    fn test_channel_preserves_order_and_closes() {
        let (tx, rx) = update_channel();
        let producer = std::thread::spawn(move || {
            tx.stage(Stage::Format);
            tx.info("Partitioning");
            tx.blank();
        });

        let got: Vec<Update> = rx.iter().collect();
        producer.join().unwrap();

        assert_eq!(got.len(), 3);
        assert_eq!(got[0].stage, Some(Stage::Format));
        assert_eq!(got[1].msg, "  Partitioning\n");
        assert_eq!(got[2].msg, "\n");
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = update_channel();
        drop(rx);
        tx.info("nobody is listening");
    }
}
