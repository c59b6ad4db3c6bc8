//! # tether-test-support
//!
//! Packet-loss simulation for exercising retransmission and drop paths.
//! Wire a [`LossGenerator`] into a host's intercept callback to decide,
//! datagram by datagram, what the "network" eats.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Pattern of datagram loss to simulate.
#[derive(Debug, Clone)]
pub enum LossPattern {
    /// Pass everything.
    None,
    /// Drop each datagram independently with the given probability.
    Random { probability: f64 },
    /// Drop every Nth datagram.
    Periodic { every_n: usize },
    /// Drop exactly one datagram, the nth one seen (1-based).
    Once { nth: usize },
    /// Drop a run of datagrams starting at the nth one seen (1-based).
    Burst { start: usize, length: usize },
}

/// Decides which datagrams a lossy link would swallow.
pub struct LossGenerator {
    pattern: LossPattern,
    seen: usize,
    dropped: usize,
    rng: StdRng,
}

impl LossGenerator {
    pub fn new(pattern: LossPattern) -> Self {
        Self {
            pattern,
            seen: 0,
            dropped: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// A link that loses nothing.
    pub fn none() -> Self {
        Self::new(LossPattern::None)
    }

    /// A link losing each datagram with probability `probability`.
    pub fn random(probability: f64) -> Self {
        Self::new(LossPattern::Random {
            probability: probability.clamp(0.0, 1.0),
        })
    }

    /// A link losing every Nth datagram.
    pub fn periodic(every_n: usize) -> Self {
        Self::new(LossPattern::Periodic { every_n })
    }

    /// A link losing exactly the nth datagram (1-based).
    pub fn once(nth: usize) -> Self {
        Self::new(LossPattern::Once { nth })
    }

    /// A link losing `length` consecutive datagrams starting at `start`.
    pub fn burst(start: usize, length: usize) -> Self {
        Self::new(LossPattern::Burst { start, length })
    }

    /// Register one datagram and decide whether it gets dropped.
    pub fn should_drop(&mut self) -> bool {
        self.seen += 1;
        let drop = match &self.pattern {
            LossPattern::None => false,
            LossPattern::Random { probability } => self.rng.gen::<f64>() < *probability,
            LossPattern::Periodic { every_n } => *every_n > 0 && self.seen % *every_n == 0,
            LossPattern::Once { nth } => self.seen == *nth,
            LossPattern::Burst { start, length } => {
                self.seen >= *start && self.seen < *start + *length
            }
        };
        if drop {
            self.dropped += 1;
        }
        drop
    }

    /// Datagrams inspected so far.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Datagrams dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_passes_everything() {
        let mut generator = LossGenerator::none();
        for _ in 0..100 {
            assert!(!generator.should_drop());
        }
        assert_eq!(generator.dropped(), 0);
    }

    #[test]
    fn periodic_drops_every_nth() {
        let mut generator = LossGenerator::periodic(10);
        let drops = (0..100).filter(|_| generator.should_drop()).count();
        assert_eq!(drops, 10);
    }

    #[test]
    fn once_drops_exactly_one() {
        let mut generator = LossGenerator::once(3);
        let decisions: Vec<bool> = (0..6).map(|_| generator.should_drop()).collect();
        assert_eq!(decisions, vec![false, false, true, false, false, false]);
        assert_eq!(generator.dropped(), 1);
    }

    #[test]
    fn burst_drops_a_run() {
        let mut generator = LossGenerator::burst(4, 3);
        let dropped: Vec<usize> = (1..=10).filter(|_| generator.should_drop()).collect();
        assert_eq!(generator.dropped(), 3);
        assert_eq!(dropped.len(), 3);
    }

    #[test]
    fn random_rate_is_plausible() {
        let mut generator = LossGenerator::random(0.2);
        let drops = (0..10_000).filter(|_| generator.should_drop()).count();
        assert!((1_500..2_500).contains(&drops), "drops = {drops}");
    }
}
