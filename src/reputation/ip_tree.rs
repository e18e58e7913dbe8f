use ipnet::IpNet;
use std::net::IpAddr;

/// Storage for resolved reputation entries.
pub trait ReputationStore: Send + Sync {
    /// Identifier of the most specific network containing `ip`.
    fn get(&self, ip: IpAddr) -> Option<String>;
    fn set(&mut self, network: IpNet, identifier: String);
    fn evict(&mut self, network: IpNet) -> Option<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    identifier: Option<String>,
}

/// Binary prefix trie, one root per address family.
#[derive(Default)]
pub struct IpTree {
    v4: Node,
    v6: Node,
    entries: usize,
}

impl IpTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn root(&self, ip: &IpAddr) -> &Node {
        match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    fn root_mut(&mut self, ip: &IpAddr) -> &mut Node {
        match ip {
            IpAddr::V4(_) => &mut self.v4,
            IpAddr::V6(_) => &mut self.v6,
        }
    }

    fn find_node_mut(&mut self, network: &IpNet) -> Option<&mut Node> {
        let network = network.trunc();
        let bytes = octets(&network.addr());
        let mut node = self.root_mut(&network.addr());
        for i in 0..network.prefix_len() as usize {
            node = node.children[bit(&bytes, i)].as_deref_mut()?;
        }
        Some(node)
    }
}

impl ReputationStore for IpTree {
    fn get(&self, ip: IpAddr) -> Option<String> {
        let bytes = octets(&ip);
        let mut node = self.root(&ip);
        let mut best = node.identifier.as_ref();

        for i in 0..bytes.len() * 8 {
            match node.children[bit(&bytes, i)].as_deref() {
                Some(child) => {
                    node = child;
                    if node.identifier.is_some() {
                        best = node.identifier.as_ref();
                    }
                }
                None => break,
            }
        }

        best.cloned()
    }

    fn set(&mut self, network: IpNet, identifier: String) {
        let network = network.trunc();
        let bytes = octets(&network.addr());
        let mut node = self.root_mut(&network.addr());

        for i in 0..network.prefix_len() as usize {
            node = node.children[bit(&bytes, i)]
                .get_or_insert_with(Box::default)
                .as_mut();
        }

        if node.identifier.replace(identifier).is_none() {
            self.entries += 1;
        }
    }

    fn evict(&mut self, network: IpNet) -> Option<String> {
        let removed = self.find_node_mut(&network)?.identifier.take();
        if removed.is_some() {
            self.entries -= 1;
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries
    }
}

fn octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn bit(bytes: &[u8], index: usize) -> usize {
    ((bytes[index / 8] >> (7 - index % 8)) & 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut tree = IpTree::new();
        tree.set(net("10.0.0.0/8"), "A".to_string());
        tree.set(net("10.1.0.0/16"), "B".to_string());

        assert_eq!(tree.get(ip("10.1.2.3")).as_deref(), Some("B"));
        assert_eq!(tree.get(ip("10.2.2.3")).as_deref(), Some("A"));
        assert_eq!(tree.get(ip("11.0.0.1")), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut tree = IpTree::new();
        tree.set(net("10.1.0.0/16"), "B".to_string());
        tree.set(net("10.0.0.0/8"), "A".to_string());

        assert_eq!(tree.get(ip("10.1.2.3")).as_deref(), Some("B"));
        assert_eq!(tree.get(ip("10.200.0.1")).as_deref(), Some("A"));
    }

    #[test]
    fn test_host_bits_are_ignored() {
        let mut tree = IpTree::new();
        tree.set(net("192.168.1.77/24"), "LAN".to_string());
        assert_eq!(tree.get(ip("192.168.1.1")).as_deref(), Some("LAN"));
    }

    #[test]
    fn test_families_are_separate() {
        let mut tree = IpTree::new();
        tree.set(net("0.0.0.0/0"), "ALL4".to_string());
        tree.set(net("2001:db8::/32"), "DOC".to_string());

        assert_eq!(tree.get(ip("2001:db8::1")).as_deref(), Some("DOC"));
        assert_eq!(tree.get(ip("2001:db9::1")), None);
        assert_eq!(tree.get(ip("1.2.3.4")).as_deref(), Some("ALL4"));
    }

    #[test]
    fn test_replace_and_evict() {
        let mut tree = IpTree::new();
        tree.set(net("203.0.113.7/32"), "NL".to_string());
        tree.set(net("203.0.113.7/32"), "SBL".to_string());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(ip("203.0.113.7")).as_deref(), Some("SBL"));

        assert_eq!(tree.evict(net("203.0.113.7/32")).as_deref(), Some("SBL"));
        assert_eq!(tree.evict(net("203.0.113.7/32")), None);
        assert_eq!(tree.evict(net("198.51.100.0/24")), None);
        assert!(tree.is_empty());
        assert_eq!(tree.get(ip("203.0.113.7")), None);
    }

    #[test]
    fn test_clear() {
        let mut tree = IpTree::new();
        tree.set(net("10.0.0.0/8"), "A".to_string());
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.get(ip("10.0.0.1")), None);
    }
}
