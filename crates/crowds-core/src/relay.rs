//! The per-hop relay decision.
//!
//! Every forwarder that handles a DATA or VOTE_CAST message re-applies the
//! same biased coin: with probability `p` the message goes to a uniformly
//! random member, otherwise straight to its stated destination. Path length
//! is therefore geometric with success probability `1 - p` per hop.
//!
//! The decision is pure: it only reads the membership table and draws from
//! the supplied RNG. Performing the hop is the caller's job.

use crate::{MembershipTable, Node};
use rand::Rng;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Default probability (percent) of forwarding to a random member.
pub const DEFAULT_BIAS: u8 = 66;

#[derive(Debug, Error)]
pub enum BiasError {
    #[error("Bias must be a percentage between 0 and 100, got {0}")]
    OutOfRange(u8),
}

/// Probability, in whole percent, of choosing random-forward over direct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bias(u8);

impl Bias {
    pub fn new(percent: u8) -> Result<Self, BiasError> {
        if percent > 100 {
            return Err(BiasError::OutOfRange(percent));
        }
        Ok(Self(percent))
    }

    pub fn percent(&self) -> u8 {
        self.0
    }

    /// Draw the coin. True means forward to a random member.
    ///
    /// `0` never selects random-forward and `100` always does.
    pub fn flip<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.random_range(0..100u8) < self.0
    }
}

impl Default for Bias {
    fn default() -> Self {
        Self(DEFAULT_BIAS)
    }
}

impl Display for Bias {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Outcome of a relay decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// The message is addressed to this node; terminate here.
    Local,
    /// Forward unchanged to this randomly chosen member.
    Random(Node),
    /// Forward unchanged to the stated destination.
    Direct { address: String, port: u16 },
    /// Random-forward was drawn but there was no eligible member.
    Dropped,
}

impl Display for Hop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Local => f.write_str("local"),
            Hop::Random(node) => write!(f, "random member {node}"),
            Hop::Direct { address, port } => write!(f, "direct to {address}:{port}"),
            Hop::Dropped => f.write_str("dropped (no eligible member)"),
        }
    }
}

/// How a forwarder relays traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPolicy {
    pub bias: Bias,
    /// Leave the declared source out of random-forward candidates.
    pub exclude_source: bool,
}

impl RelayPolicy {
    pub fn new(bias: Bias, exclude_source: bool) -> Self {
        Self {
            bias,
            exclude_source,
        }
    }

    /// Decide the next hop for a message at `local`.
    ///
    /// `source` is the message's declared source, if it carries one. It only
    /// affects candidate selection when `exclude_source` is set.
    pub fn next_hop<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        local: &Node,
        table: &MembershipTable,
        destination: (&str, u16),
        source: Option<(&str, u16)>,
    ) -> Hop {
        let (dst_addr, dst_port) = destination;
        if local.is_at(dst_addr, dst_port) {
            return Hop::Local;
        }

        if !self.bias.flip(rng) {
            return Hop::Direct {
                address: dst_addr.to_string(),
                port: dst_port,
            };
        }

        let excluded = source.filter(|_| self.exclude_source);
        let picked = table.random_member(rng, |candidate| {
            candidate.is_at(local.address(), local.port())
                || excluded.is_some_and(|(addr, port)| candidate.is_at(addr, port))
        });
        match picked {
            Some(node) => Hop::Random(node),
            None => {
                tracing::debug!("Random forward drawn with no eligible member; dropping");
                Hop::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn local() -> Node {
        Node::new("127.0.0.1", 6000)
    }

    fn table_with(ports: &[u16]) -> MembershipTable {
        let table = MembershipTable::new();
        table.extend(ports.iter().map(|p| Node::new("127.0.0.1", *p)));
        table
    }

    fn policy(percent: u8) -> RelayPolicy {
        RelayPolicy::new(Bias::new(percent).unwrap(), false)
    }

    #[test]
    fn test_bias_bounds() {
        assert!(Bias::new(0).is_ok());
        assert!(Bias::new(100).is_ok());
        assert!(matches!(Bias::new(101), Err(BiasError::OutOfRange(101))));
        assert_eq!(Bias::default().percent(), DEFAULT_BIAS);
    }

    #[test]
    fn test_destination_self_is_local() {
        let table = table_with(&[6001, 6002]);
        let mut rng = StdRng::seed_from_u64(0);
        for percent in [0, 66, 100] {
            let hop = policy(percent).next_hop(&mut rng, &local(), &table, ("127.0.0.1", 6000), None);
            assert_eq!(hop, Hop::Local);
        }
    }

    #[test]
    fn test_zero_bias_always_direct() {
        let table = table_with(&[6001, 6002]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let hop = policy(0).next_hop(&mut rng, &local(), &table, ("127.0.0.1", 6002), None);
            assert_eq!(
                hop,
                Hop::Direct {
                    address: "127.0.0.1".to_string(),
                    port: 6002
                }
            );
        }
    }

    #[test]
    fn test_full_bias_always_random() {
        let table = table_with(&[6001, 6002, 6003]);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..1000 {
            let hop = policy(100).next_hop(&mut rng, &local(), &table, ("127.0.0.1", 6002), None);
            assert!(matches!(hop, Hop::Random(_)), "got {hop}");
        }
    }

    #[test]
    fn test_empty_table_drops() {
        let table = MembershipTable::new();
        let mut rng = StdRng::seed_from_u64(3);
        let hop = policy(100).next_hop(&mut rng, &local(), &table, ("127.0.0.1", 6002), None);
        assert_eq!(hop, Hop::Dropped);
    }

    #[test]
    fn test_random_never_picks_self() {
        // A table that (unusually) contains ourselves alongside one other member.
        let table = table_with(&[6000, 6001]);
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..500 {
            let hop = policy(100).next_hop(&mut rng, &local(), &table, ("127.0.0.1", 6005), None);
            assert_eq!(hop, Hop::Random(Node::new("127.0.0.1", 6001)));
        }
    }

    #[test]
    fn test_source_exclusion_is_opt_in() {
        let table = table_with(&[6001, 6002]);
        let source = Some(("127.0.0.1", 6001));
        let mut rng = StdRng::seed_from_u64(5);

        let excluding = RelayPolicy::new(Bias::new(100).unwrap(), true);
        for _ in 0..500 {
            let hop = excluding.next_hop(&mut rng, &local(), &table, ("127.0.0.1", 5000), source);
            assert_eq!(hop, Hop::Random(Node::new("127.0.0.1", 6002)));
        }

        let including = policy(100);
        let picked_source = (0..500).any(|_| {
            including.next_hop(&mut rng, &local(), &table, ("127.0.0.1", 5000), source)
                == Hop::Random(Node::new("127.0.0.1", 6001))
        });
        assert!(picked_source);
    }

    #[test]
    fn test_source_exclusion_can_empty_candidates() {
        let table = table_with(&[6001]);
        let excluding = RelayPolicy::new(Bias::new(100).unwrap(), true);
        let mut rng = StdRng::seed_from_u64(6);
        let hop = excluding.next_hop(
            &mut rng,
            &local(),
            &table,
            ("127.0.0.1", 5000),
            Some(("127.0.0.1", 6001)),
        );
        assert_eq!(hop, Hop::Dropped);
    }

    #[test]
    fn test_random_fraction_matches_bias() {
        const TRIALS: u32 = 10_000;
        let table = table_with(&[6001, 6002, 6003, 6004]);
        let policy = RelayPolicy::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let mut random = 0u32;
        for _ in 0..TRIALS {
            match policy.next_hop(&mut rng, &local(), &table, ("127.0.0.1", 7000), None) {
                Hop::Random(_) => random += 1,
                Hop::Direct { .. } => {}
                other => panic!("unexpected hop {other}"),
            }
        }

        // 99% binomial interval around the configured bias.
        let p = f64::from(DEFAULT_BIAS) / 100.0;
        let n = f64::from(TRIALS);
        let bound = 2.576 * (p * (1.0 - p) / n).sqrt();
        let fraction = f64::from(random) / n;
        assert!(
            (fraction - p).abs() < bound,
            "random fraction {fraction} outside {p} +/- {bound}"
        );
    }
}
