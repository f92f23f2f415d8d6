//! Edge model (spec §3 "Edge", §9 "Graph cycles and back-pointers"). An edge
//! is an ordered `(from, to)` pair; `reverse` is a *derived lookup* against
//! the registry's edge index, never an owned pointer — per spec §9's
//! redesign note, this avoids the legacy cyclic-pointer arena entirely.

pub mod opt {
    pub const INDIRECT: u32 = 0x0001;
}

/// A directed edge as advertised by `from` about its connection to `to`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub weight: u32,
    pub address: Option<crate::util::sockaddr::MeshAddr>,
    pub options: u32,
    /// Random hex token carried on `ADD_EDGE`/`DEL_EDGE` so textually
    /// identical updates still defeat the `past_request` dedup cache
    /// (spec §4.2 "Flood and dedup").
    pub nonce: String,
    /// Membership in the most recently computed MST (spec §4.3), used by
    /// the routing engine's `mst` broadcast policy (spec §4.4).
    pub in_mst: bool,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, weight: u32) -> Self {
        Self { from: from.into(), to: to.into(), weight, address: None, options: 0, nonce: String::new(), in_mst: false }
    }

    pub fn key(&self) -> (String, String) {
        (self.from.clone(), self.to.clone())
    }

    /// Kruskal/SSSP sort key (spec §9 "Kruskal tie-break"): weight first,
    /// then `(from, to)` lexicographic order.
    pub fn sort_key(&self) -> (u32, String, String) {
        (self.weight, self.from.clone(), self.to.clone())
    }

    pub fn is_indirect(&self) -> bool {
        self.options & opt::INDIRECT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_breaks_ties_on_endpoint_names() {
        let a = Edge::new("a", "b", 5);
        let b = Edge::new("a", "c", 5);
        assert!(a.sort_key() < b.sort_key());
    }
}
