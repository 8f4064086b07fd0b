use std::io::{self, Stdout, Write};

use anyhow::Context;
use ornitho_core::{render_notification, Sighting};

/// Sink for novel sightings.
pub trait Notifier {
    fn notify(&mut self, sighting: &Sighting) -> anyhow::Result<()>;
}

/// Writes one text block per sighting, separated by blank lines.
#[derive(Debug)]
pub struct ConsoleNotifier<W = Stdout> {
    out: W,
}

impl ConsoleNotifier<Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Notifier for ConsoleNotifier<W> {
    fn notify(&mut self, sighting: &Sighting) -> anyhow::Result<()> {
        writeln!(self.out, "{}", render_notification(sighting)).context("writing notification")?;
        self.out.flush().context("flushing notification output")
    }
}

/// Keeps notified sightings in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Vec<Sighting>,
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, sighting: &Sighting) -> anyhow::Result<()> {
        self.sent.push(sighting.clone());
        Ok(())
    }
}
