// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod devnull;
pub mod http;
pub mod stdout;

pub use devnull::DevNullOutput;
pub use http::HttpOutput;
pub use stdout::StdoutOutput;
