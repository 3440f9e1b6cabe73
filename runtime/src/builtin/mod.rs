// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::shared::*;
pub use self::singletons::*;

pub mod shared;
pub mod singletons;
