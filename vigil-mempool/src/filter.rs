//! Routing interest: which subscribers care about a transaction.

use std::collections::{BTreeMap, BTreeSet};

use vigil_chain::transparent::ScriptAddr;

use crate::parsed_tx::{AddrInterest, ParsedTx};
use crate::SubscriberId;

/// The interest tuples for one ZC, computed before staging and carried
/// with it in the snapshot, so the notification pass after a commit is
/// proportional to the touched subscribers rather than the mempool.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilteredTx {
    /// Per touched script address, the subscribers watching it.
    pub per_scraddr: BTreeMap<ScriptAddr, BTreeSet<SubscriberId>>,
    /// Union of the above: every subscriber this ZC concerns.
    pub flagged: BTreeSet<SubscriberId>,
}

impl FilteredTx {
    pub fn is_empty(&self) -> bool {
        self.flagged.is_empty()
    }
}

/// Aggregate interest over every resolved input address and every output
/// address of `tx`.
pub fn filter(tx: &ParsedTx, oracle: &dyn AddrInterest) -> FilteredTx {
    let mut filtered = FilteredTx::default();
    for scraddr in tx.touched_scraddrs() {
        let watchers = oracle.watchers_of(&scraddr);
        if watchers.is_empty() {
            continue;
        }
        filtered.flagged.extend(watchers.iter().copied());
        filtered.per_scraddr.insert(scraddr, watchers);
    }
    filtered
}
