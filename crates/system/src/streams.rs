// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// A pair of output sinks that subprocess and substep output is written to.
///
/// Handles must be cheap to create and safe to use from blocking writer
/// tasks, so implementations hand out independent `Write` boxes rather than
/// borrowed references.
pub trait OutStreams: Send + Sync {
    fn stdout(&self) -> Box<dyn Write + Send>;
    fn stderr(&self) -> Box<dyn Write + Send>;
}

/// Discards everything. Used by substeps that run tools purely for their
/// side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevNullStreams;

impl OutStreams for DevNullStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }
}

/// Accumulates output in memory. Mostly useful in tests, but the hub also
/// uses it where a tool's output feeds a later decision.
#[derive(Debug, Clone, Default)]
pub struct BufferedStreams {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl BufferedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_contents(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().expect("stream lock poisoned")).into_owned()
    }

    pub fn stderr_contents(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().expect("stream lock poisoned")).into_owned()
    }
}

impl OutStreams for BufferedStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBufWriter(Arc::clone(&self.stdout)))
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBufWriter(Arc::clone(&self.stderr)))
    }
}

struct SharedBufWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBufWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("stream lock poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
