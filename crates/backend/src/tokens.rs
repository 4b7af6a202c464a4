//! Attribute name tokens.
//!
//! Stored entries refer to attribute names by a dense `u32` token. The
//! `attr_tokens` tree holds both directions (`n:<lower name>` to token and
//! `t:<token>` to the name as first written) plus the `next` counter. Tokens
//! are assigned inside the write transaction that first needs them, so a
//! concurrent writer minting the same name conflicts on `next` and retries.
//!
//! A process-wide cache is published only after the minting transaction
//! commits; an aborted transaction never leaks a token into the cache.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use dirstore_substrate::{Direction, KeyRange, ReadTxn, Tree, WriteTxn, open_cursor};
use snafu::ResultExt;

use crate::error::{Result, StorageSnafu, corruption};

const NEXT_KEY: &[u8] = b"next";
const NAME_PREFIX: &[u8] = b"n:";
const TOKEN_PREFIX: &[u8] = b"t:";

#[derive(Debug, Default, Clone)]
struct TokenCache {
    by_name: HashMap<String, u32>,
    by_token: HashMap<u32, String>,
}

/// Tokens minted or looked up by one write transaction.
///
/// Handed to [`TokenTable::publish`] once the transaction has committed.
#[derive(Debug, Default)]
pub struct PendingTokens {
    minted: Vec<(String, u32)>,
}

impl PendingTokens {
    fn get(&self, lower: &str) -> Option<u32> {
        self.minted.iter().find(|(n, _)| n == lower).map(|(_, t)| *t)
    }

    /// Whether nothing was minted.
    pub fn is_empty(&self) -> bool {
        self.minted.is_empty()
    }
}

/// The attribute token table.
#[derive(Debug)]
pub struct TokenTable {
    tree: Tree,
    cache: ArcSwap<TokenCache>,
}

fn name_key(lower: &str) -> Vec<u8> {
    let mut key = NAME_PREFIX.to_vec();
    key.extend_from_slice(lower.as_bytes());
    key
}

fn token_key(token: u32) -> Vec<u8> {
    let mut key = TOKEN_PREFIX.to_vec();
    key.extend_from_slice(&token.to_be_bytes());
    key
}

fn decode_token(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] =
        bytes.try_into().map_err(|_| corruption(format!("token of {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}

impl TokenTable {
    /// Loads every committed token into the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read or holds malformed tokens.
    pub fn load(tree: Tree, txn: &dyn ReadTxn) -> Result<Self> {
        let mut cache = TokenCache::default();
        for pair in open_cursor(txn, &tree, KeyRange::prefix(TOKEN_PREFIX), Direction::Forward) {
            let (key, value) = pair.context(StorageSnafu)?;
            let token = decode_token(&key[TOKEN_PREFIX.len()..])?;
            let name = String::from_utf8(value)
                .map_err(|_| corruption(format!("attribute name for token {token} is not UTF-8")))?;
            cache.by_name.insert(name.to_ascii_lowercase(), token);
            cache.by_token.insert(token, name);
        }
        Ok(Self { tree, cache: ArcSwap::from_pointee(cache) })
    }

    /// The token for `name`, minting one inside `txn` when needed.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the transaction.
    pub fn token_for(
        &self,
        txn: &mut dyn WriteTxn,
        pending: &mut PendingTokens,
        name: &str,
    ) -> Result<u32> {
        let lower = name.to_ascii_lowercase();
        if let Some(token) = self.cache.load().by_name.get(&lower) {
            return Ok(*token);
        }
        if let Some(token) = pending.get(&lower) {
            return Ok(token);
        }
        if let Some(bytes) = txn.get(&self.tree, &name_key(&lower)).context(StorageSnafu)? {
            let token = decode_token(&bytes)?;
            pending.minted.push((lower, token));
            return Ok(token);
        }

        let next = match txn.get(&self.tree, NEXT_KEY).context(StorageSnafu)? {
            Some(bytes) => decode_token(&bytes)?,
            None => 1,
        };
        txn.put(&self.tree, &name_key(&lower), &next.to_be_bytes()).context(StorageSnafu)?;
        txn.put(&self.tree, &token_key(next), name.as_bytes()).context(StorageSnafu)?;
        txn.put(&self.tree, NEXT_KEY, &(next + 1).to_be_bytes()).context(StorageSnafu)?;
        tracing::debug!(attribute = name, token = next, "minted attribute token");
        pending.minted.push((lower, next));
        Ok(next)
    }

    /// The attribute name for `token`.
    ///
    /// Falls back to `txn` for tokens minted after the cache was published,
    /// including ones minted by `txn` itself.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::Corruption`] for unknown tokens.
    pub fn name_for(&self, txn: &dyn ReadTxn, token: u32) -> Result<Arc<str>> {
        if let Some(name) = self.cache.load().by_token.get(&token) {
            return Ok(Arc::from(name.as_str()));
        }
        let bytes = txn
            .get(&self.tree, &token_key(token))
            .context(StorageSnafu)?
            .ok_or_else(|| corruption(format!("unknown attribute token {token}")))?;
        let name = String::from_utf8(bytes)
            .map_err(|_| corruption(format!("attribute name for token {token} is not UTF-8")))?;
        Ok(Arc::from(name))
    }

    /// Makes tokens from a committed transaction visible through the cache.
    pub fn publish(&self, pending: PendingTokens, txn: &dyn ReadTxn) {
        if pending.is_empty() {
            return;
        }
        self.cache.rcu(|current| {
            let mut next = TokenCache::clone(current);
            for (lower, token) in &pending.minted {
                let display = txn
                    .get(&self.tree, &token_key(*token))
                    .ok()
                    .flatten()
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_else(|| lower.clone());
                next.by_name.insert(lower.clone(), *token);
                next.by_token.insert(*token, display);
            }
            next
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_substrate::{MemorySubstrate, Substrate};

    use super::*;

    fn table(substrate: &MemorySubstrate) -> TokenTable {
        let tree = substrate.open_tree("attr_tokens").unwrap();
        let txn = substrate.begin_read().unwrap();
        TokenTable::load(tree, txn.as_ref()).unwrap()
    }

    #[test]
    fn test_tokens_are_dense_and_case_insensitive() {
        let substrate = MemorySubstrate::new();
        let tokens = table(&substrate);
        let mut txn = substrate.begin_write().unwrap();
        let mut pending = PendingTokens::default();
        let cn = tokens.token_for(txn.as_mut(), &mut pending, "cn").unwrap();
        let mail = tokens.token_for(txn.as_mut(), &mut pending, "mail").unwrap();
        let cn_again = tokens.token_for(txn.as_mut(), &mut pending, "CN").unwrap();
        assert_eq!((cn, mail, cn_again), (1, 2, 1));
        assert_eq!(&*tokens.name_for(txn.as_read(), mail).unwrap(), "mail");
        txn.commit().unwrap();

        let read = substrate.begin_read().unwrap();
        tokens.publish(pending, read.as_ref());
        assert_eq!(&*tokens.name_for(read.as_ref(), cn).unwrap(), "cn");
    }

    #[test]
    fn test_aborted_tokens_never_reach_cache() {
        let substrate = MemorySubstrate::new();
        let tokens = table(&substrate);
        let mut txn = substrate.begin_write().unwrap();
        let mut pending = PendingTokens::default();
        tokens.token_for(txn.as_mut(), &mut pending, "description").unwrap();
        txn.abort();
        drop(pending);

        let read = substrate.begin_read().unwrap();
        assert!(tokens.name_for(read.as_ref(), 1).is_err());

        let mut txn = substrate.begin_write().unwrap();
        let mut pending = PendingTokens::default();
        assert_eq!(tokens.token_for(txn.as_mut(), &mut pending, "sn").unwrap(), 1);
    }

    #[test]
    fn test_load_restores_committed_tokens() {
        let substrate = MemorySubstrate::new();
        let tokens = table(&substrate);
        let mut txn = substrate.begin_write().unwrap();
        let mut pending = PendingTokens::default();
        tokens.token_for(txn.as_mut(), &mut pending, "objectClass").unwrap();
        txn.commit().unwrap();

        let reloaded = table(&substrate);
        let read = substrate.begin_read().unwrap();
        assert_eq!(&*reloaded.name_for(read.as_ref(), 1).unwrap(), "objectClass");
        let mut txn = substrate.begin_write().unwrap();
        let mut pending = PendingTokens::default();
        assert_eq!(reloaded.token_for(txn.as_mut(), &mut pending, "objectclass").unwrap(), 1);
        assert!(pending.is_empty());
    }
}
