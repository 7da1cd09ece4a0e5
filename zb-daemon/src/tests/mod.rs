// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

pub mod support;

mod import_export;
mod rpc;
