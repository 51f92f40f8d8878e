// SPDX-License-Identifier: Apache-2.0

pub mod v1;
pub mod v2;
