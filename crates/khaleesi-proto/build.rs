// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    // Shared request metadata, batch job messages and the Maid service
    // plus the sawmill sink (Lumberjack, Forester, Sawyer).
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/common.proto", "proto/sawmill.proto"], &["proto/"])?;

    Ok(())
}
