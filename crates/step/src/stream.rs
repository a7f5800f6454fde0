// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::info;

use uplift_protocol::common;
use uplift_system::streams::OutStreams;

use crate::sender::MessageSender;

/// Tees every write to the phase log and, as tagged chunk frames, to the
/// operator stream. Writes from concurrent substeps are serialized by one
/// mutex so interleaved tool output stays line-coherent.
///
/// The log write is authoritative: a log failure fails the write, while a
/// send failure only detaches the operator stream.
#[derive(Clone)]
pub struct MultiplexedStreams {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    sender: Option<Arc<dyn MessageSender>>,
    log: Box<dyn Write + Send>,
}

impl MultiplexedStreams {
    pub fn new(sender: Arc<dyn MessageSender>, log: Box<dyn Write + Send>) -> Self {
        MultiplexedStreams {
            inner: Arc::new(Mutex::new(Inner {
                sender: Some(sender),
                log,
            })),
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| std::io::Error::other("stream lock poisoned"))?
            .log
            .flush()
    }

    fn writer(&self, stream: common::chunk::Stream) -> Box<dyn Write + Send> {
        Box::new(ChunkWriter {
            inner: Arc::clone(&self.inner),
            stream,
        })
    }
}

impl OutStreams for MultiplexedStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        self.writer(common::chunk::Stream::Stdout)
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        self.writer(common::chunk::Stream::Stderr)
    }
}

struct ChunkWriter {
    inner: Arc<Mutex<Inner>>,
    stream: common::chunk::Stream,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("stream lock poisoned"))?;

        inner.log.write_all(buf)?;

        if let Some(sender) = &inner.sender {
            // The operator may disconnect at any point. After the first
            // failed send no further attempts are made.
            if let Err(err) = sender.send(common::Message::chunk(self.stream, buf)) {
                info!("halting operator stream: {err}");
                inner.sender = None;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| std::io::Error::other("stream lock poisoned"))?
            .log
            .flush()
    }
}
