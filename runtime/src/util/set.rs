// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_hamt::{BytesKey, Error};

use crate::{make_empty_map, make_map_with_root, Map, HAMT_BIT_WIDTH};

/// Set is a HAMT with empty values for the purpose of acting as a hash set.
pub struct Set<'a, BS>(Map<'a, BS, ()>);

impl<'a, BS> Set<'a, BS>
where
    BS: Blockstore,
{
    /// Initializes a new empty Set with the default bitwidth.
    pub fn new(bs: &'a BS) -> Self {
        Self(make_empty_map(bs, HAMT_BIT_WIDTH))
    }

    /// Initializes a Set from a root Cid.
    pub fn from_root(bs: &'a BS, cid: &Cid) -> Result<Self, Error> {
        Ok(Self(make_map_with_root(cid, bs)?))
    }

    /// Retrieve root from the Set.
    #[inline]
    pub fn root(&mut self) -> Result<Cid, Error> {
        self.0.flush()
    }

    /// Adds key to the set.
    #[inline]
    pub fn put(&mut self, key: BytesKey) -> Result<(), Error> {
        self.0.set(key, ())?;
        Ok(())
    }

    /// Checks if key exists in the set.
    #[inline]
    pub fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.0.get(key)?.is_some())
    }

    /// Deletes key from set.
    #[inline]
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<()>, Error> {
        match self.0.delete(key)? {
            Some(_) => Ok(Some(())),
            None => Ok(None),
        }
    }

    /// Iterates through all keys in the set.
    pub fn for_each<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&BytesKey) -> anyhow::Result<()>,
    {
        // Calls the for each function on the hamt with ignoring the value
        self.0.for_each(|s, _: &()| f(s))?;
        Ok(())
    }

    /// Collects all keys from the set into a vector.
    pub fn collect_keys(&self) -> anyhow::Result<Vec<BytesKey>> {
        let mut ret_keys = Vec::new();

        self.for_each(|k| {
            ret_keys.push(k.clone());
            Ok(())
        })?;

        Ok(ret_keys)
    }
}

#[cfg(test)]
mod tests {
    use fvm_ipld_blockstore::MemoryBlockstore;

    use super::*;

    #[test]
    fn put_has_delete() {
        let store = MemoryBlockstore::default();
        let mut set = Set::new(&store);

        let key = BytesKey::from("cat".as_bytes());
        assert!(!set.has(&key).unwrap());
        set.put(key.clone()).unwrap();
        assert!(set.has(&key).unwrap());
        assert_eq!(set.delete(&key).unwrap(), Some(()));
        assert!(!set.has(&key).unwrap());
        assert_eq!(set.delete(&key).unwrap(), None);
    }
}
