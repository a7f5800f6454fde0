// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Generated gRPC types for the hub and agent services plus small
//! convenience constructors for the frames that flow over the operator
//! stream.

pub mod common {
    tonic::include_proto!("uplift.common");
}

pub mod hub {
    tonic::include_proto!("uplift.hub");
}

pub mod agent {
    tonic::include_proto!("uplift.agent");
}

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("uplift_descriptor");

impl common::Message {
    pub fn status(substep: common::Substep, status: common::Status) -> Self {
        common::Message {
            contents: Some(common::message::Contents::Status(common::SubstepStatus {
                substep: substep.into(),
                status: status.into(),
                error_message: String::new(),
            })),
        }
    }

    pub fn failed(substep: common::Substep, error_message: impl Into<String>) -> Self {
        common::Message {
            contents: Some(common::message::Contents::Status(common::SubstepStatus {
                substep: substep.into(),
                status: common::Status::Failed.into(),
                error_message: error_message.into(),
            })),
        }
    }

    pub fn chunk(stream: common::chunk::Stream, buffer: impl Into<Vec<u8>>) -> Self {
        common::Message {
            contents: Some(common::message::Contents::Chunk(common::Chunk {
                buffer: buffer.into(),
                stream: stream.into(),
            })),
        }
    }

    pub fn response(data: std::collections::HashMap<String, String>) -> Self {
        common::Message {
            contents: Some(common::message::Contents::Response(common::Response {
                data,
            })),
        }
    }
}
