//! Stages a network body passes through on its way to the caller.
//!
//! Order is fixed: the meter counts wire bytes (so percentages line up with the
//! declared Content-Length), then the body is gunzipped when the server said
//! so, then the plaintext is copied into the cache staging file.

use std::collections::VecDeque;
use std::io::Write;

use flate2::write::GzDecoder;
use tokio::sync::mpsc::UnboundedSender;

use crate::cache::Staging;
use crate::error::{AppError, Result};

pub(crate) struct GzipStage {
    decoder: GzDecoder<Vec<u8>>,
}

impl GzipStage {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    pub fn decode(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        self.decoder.write_all(raw).map_err(gzip_error)?;
        self.decoder.flush().map_err(gzip_error)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// Fails if the stream stopped before the gzip trailer.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        self.decoder.try_finish().map_err(gzip_error)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}

fn gzip_error(e: std::io::Error) -> AppError {
    AppError::Decode(format!("gzip: {}", e))
}

/// Turns consumed byte counts into whole-percent notifications.
#[derive(Debug, Default)]
pub(crate) struct ProgressMeter {
    total: Option<u64>,
    consumed: u64,
    deferred: u64,
    last_reported: u8,
    suspended: bool,
    observer: Option<UnboundedSender<u8>>,
}

impl ProgressMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn set_observer(&mut self, observer: UnboundedSender<u8>) {
        self.observer = Some(observer);
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Bytes read during the lookahead are counted now, in one step.
    pub fn resume(&mut self) {
        self.suspended = false;
        let deferred = std::mem::take(&mut self.deferred);
        self.consumed += deferred;
        self.report();
    }

    pub fn advance(&mut self, n: usize) {
        if self.suspended {
            self.deferred += n as u64;
            return;
        }
        self.consumed += n as u64;
        self.report();
    }

    fn report(&mut self) {
        let Some(total) = self.total.filter(|t| *t > 0) else {
            return;
        };
        let percent = (self.consumed.saturating_mul(100) / total).min(100) as u8;
        if percent <= self.last_reported {
            return;
        }
        self.last_reported = percent;

        let delivered = match &self.observer {
            Some(observer) => observer.send(percent).is_ok(),
            None => true,
        };
        if !delivered {
            self.observer = None;
        }
    }
}

/// Mark/reset support: chunks handed out after `mark` are replayed after `reset`.
/// Reading past the mark's limit drops the mark and its buffer.
#[derive(Debug, Default)]
pub(crate) struct Lookahead {
    marked: bool,
    limit: usize,
    recorded_len: usize,
    recorded: Vec<Vec<u8>>,
    replay: VecDeque<Vec<u8>>,
}

impl Lookahead {
    pub fn mark(&mut self, limit: usize) {
        self.marked = true;
        self.limit = limit;
        self.recorded_len = 0;
        self.recorded.clear();
    }

    pub fn reset(&mut self) -> bool {
        if !self.marked {
            return false;
        }
        self.marked = false;
        self.recorded_len = 0;
        for chunk in self.recorded.drain(..).rev() {
            self.replay.push_front(chunk);
        }
        true
    }

    pub fn next_replay(&mut self) -> Option<Vec<u8>> {
        self.replay.pop_front()
    }

    /// Returns `true` if this chunk pushed the lookahead past its limit.
    pub fn record(&mut self, chunk: &[u8]) -> bool {
        if !self.marked {
            return false;
        }
        self.recorded_len += chunk.len();
        if self.recorded_len > self.limit {
            self.marked = false;
            self.recorded_len = 0;
            self.recorded.clear();
            return true;
        }
        self.recorded.push(chunk.to_vec());
        false
    }
}

pub(crate) struct Pipeline {
    pub meter: ProgressMeter,
    decoder: Option<GzipStage>,
    sink: Option<Staging>,
}

impl Pipeline {
    pub fn new(meter: ProgressMeter, decoder: Option<GzipStage>, sink: Option<Staging>) -> Self {
        Self {
            meter,
            decoder,
            sink,
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn take_sink(&mut self) -> Option<Staging> {
        self.sink.take()
    }

    pub async fn feed(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        self.meter.advance(raw.len());
        let plain = match &mut self.decoder {
            Some(decoder) => decoder.decode(raw)?,
            None => raw.to_vec(),
        };
        self.tee(&plain).await?;
        Ok(plain)
    }

    pub async fn finish(&mut self) -> Result<Vec<u8>> {
        let tail = match &mut self.decoder {
            Some(decoder) => decoder.finish()?,
            None => Vec::new(),
        };
        self.tee(&tail).await?;
        Ok(tail)
    }

    async fn tee(&mut self, plain: &[u8]) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        if let Some(sink) = &mut self.sink {
            sink.write(plain).await?;
        }
        Ok(())
    }
}
