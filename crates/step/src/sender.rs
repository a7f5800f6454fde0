// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use uplift_protocol::common;

/// Destination for status and output frames. The hub backs this with the
/// operator's gRPC response stream; tests back it with a channel or a sink.
///
/// Send failures mean the operator disconnected. The phase keeps running,
/// so implementations return an error rather than panicking and callers
/// treat it as advisory.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: common::Message) -> anyhow::Result<()>;
}

impl MessageSender for tokio::sync::mpsc::UnboundedSender<common::Message> {
    fn send(&self, message: common::Message) -> anyhow::Result<()> {
        tokio::sync::mpsc::UnboundedSender::send(self, message)
            .map_err(|_| anyhow::anyhow!("message receiver dropped"))
    }
}

/// Drops every frame. For runs without an attached operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSender;

impl MessageSender for DiscardSender {
    fn send(&self, _message: common::Message) -> anyhow::Result<()> {
        Ok(())
    }
}
