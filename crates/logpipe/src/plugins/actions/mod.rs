// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod discard;
pub mod join;
pub mod mask;
pub mod set_field;

pub use discard::DiscardAction;
pub use join::JoinAction;
pub use mask::MaskAction;
pub use set_field::SetFieldAction;
