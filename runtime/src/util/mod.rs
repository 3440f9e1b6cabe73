// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::downcast::*;
pub use self::multimap::*;
pub use self::set::Set;
pub use self::set_multimap::SetMultimap;

mod downcast;
mod multimap;
mod set;
mod set_multimap;
