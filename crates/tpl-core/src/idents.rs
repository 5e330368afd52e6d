//! Generated-identifier minting.
//!
//! Every template-visible name is rewritten to a generated identifier
//! before code generation: the first binding of a name is `l_<name>_0`,
//! shadowing rebinds and temporaries draw from a shared counter
//! (`l_<name>_<n>`, `t<n>`), and short mode numbers everything (`l<n>`).
//! One manager serves a whole frame tree, so generated names are unique
//! across frames and the emitted code can treat them as function-flat.

use std::collections::BTreeSet;

/// Mints local and temporary identifiers.
#[derive(Debug, Default)]
pub struct IdentManager {
    index: usize,
    seen: BTreeSet<String>,
    short_ids: bool,
}

impl IdentManager {
    pub fn new(short_ids: bool) -> IdentManager {
        IdentManager {
            index: 0,
            seen: BTreeSet::new(),
            short_ids,
        }
    }

    fn next_num(&mut self) -> usize {
        self.index += 1;
        self.index
    }

    /// The identifier for a first-time binding of `name`. A repeat bind
    /// of the same name (a fresh binding in a sibling frame) falls back
    /// to the override scheme so identifiers stay unique.
    pub fn encode(&mut self, name: &str) -> String {
        if !self.short_ids && self.seen.insert(name.to_string()) {
            return format!("l_{}_0", name);
        }
        self.override_ident(name)
    }

    /// A fresh identifier for a name that shadows an outer binding.
    pub fn override_ident(&mut self, name: &str) -> String {
        let num = self.next_num();
        if self.short_ids {
            format!("l{}", num)
        } else {
            format!("l_{}_{}", name, num)
        }
    }

    /// An anonymous temporary.
    pub fn temporary(&mut self) -> String {
        format!("t{}", self.next_num())
    }

    /// Recovers the source name from a long-form identifier, if any.
    pub fn decode(ident: &str) -> Option<&str> {
        let rest = ident.strip_prefix("l_")?;
        let cut = rest.rfind('_')?;
        rest[cut + 1..].parse::<usize>().ok()?;
        Some(&rest[..cut])
    }
}
