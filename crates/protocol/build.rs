// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed=proto");

    // protox compiles the protos without requiring a protoc binary on the
    // build host.
    let file_descriptors = protox::compile(
        [
            "proto/common.proto",
            "proto/hub.proto",
            "proto/agent.proto",
        ],
        ["proto"],
    )?;

    // prost-build's `compile_fds` does not write `file_descriptor_set_path`
    // itself (that only happens on the protoc path), so persist it here for
    // `tonic::include_file_descriptor_set!`.
    std::fs::write(
        out_dir.join("uplift_descriptor.bin"),
        prost::Message::encode_to_vec(&file_descriptors),
    )?;

    tonic_build::configure().compile_fds(file_descriptors)?;

    Ok(())
}
