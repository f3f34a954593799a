//! Path MTU bookkeeping for the handshake retransmit path.

use transport::DatagramBio;

/// MTUs assumed in order as the path proves lossy: ethernet, then two
/// conservative fallbacks.
const PROBE_LADDER: [u32; 3] = [1500, 512, 256];
/// Worst-case record-layer expansion of a single datagram.
pub const MAX_MTU_OVERHEAD: u32 = 48;

/// Link and effective MTU state. Zero means unset.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Mtu {
    /// Maximum datagram size including lower-layer headers.
    pub link_mtu: u32,
    /// Usable payload per datagram after record overhead.
    pub mtu: u32,
}

impl Mtu {
    pub fn new() -> Self {
        Default::default()
    }

    /// Floor of the probe ladder.
    pub fn link_min_mtu() -> u32 {
        PROBE_LADDER[PROBE_LADDER.len() - 1]
    }

    /// Smallest usable effective MTU given the transport's real overhead.
    pub fn min_mtu<T: DatagramBio>(transport: &T) -> u32 {
        Self::link_min_mtu().saturating_sub(transport.mtu_overhead())
    }

    pub fn set_link_mtu(&mut self, link_mtu: u32) -> bool {
        if link_mtu < Self::link_min_mtu() {
            return false;
        }
        self.link_mtu = link_mtu;
        true
    }

    /// Set the effective MTU directly. The transport may not be wired up
    /// yet, so the lower bound uses the worst-case overhead rather than the
    /// real one.
    pub fn set_mtu(&mut self, mtu: u32) -> bool {
        if mtu < Self::link_min_mtu() - MAX_MTU_OVERHEAD {
            return false;
        }
        self.mtu = mtu;
        true
    }

    /// Make sure a plausible effective MTU is known.
    ///
    /// A pending link MTU is converted by subtracting the transport's
    /// overhead. Failing that, the transport is asked for the path MTU
    /// unless `no_query_mtu` forbids it. Kernels report nonsense before the
    /// first write, so the answer is clamped below and the clamped value
    /// pushed back down to the transport.
    pub fn query<T: DatagramBio>(&mut self, transport: &mut T, no_query_mtu: bool) -> bool {
        if self.link_mtu != 0 {
            self.mtu = self.link_mtu.saturating_sub(transport.mtu_overhead());
            self.link_mtu = 0;
        }

        let min = Self::min_mtu(transport);
        if self.mtu < min {
            if no_query_mtu {
                return false;
            }
            self.mtu = transport.query_mtu();
            if self.mtu < min {
                self.mtu = min;
                transport.set_mtu(self.mtu);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::TestTransport;

    #[test]
    fn link_mtu_floor_is_ladder_bottom() {
        let mut mtu = Mtu::new();
        assert_eq!(Mtu::link_min_mtu(), 256);
        assert!(!mtu.set_link_mtu(255));
        assert_eq!(mtu.link_mtu, 0);
        assert!(mtu.set_link_mtu(256));
        assert_eq!(mtu.link_mtu, 256);
    }

    #[test]
    fn effective_mtu_floor_uses_worst_case_overhead() {
        let mut mtu = Mtu::new();
        assert!(!mtu.set_mtu(207));
        assert_eq!(mtu.mtu, 0);
        assert!(mtu.set_mtu(208));
        assert_eq!(mtu.mtu, 208);
    }

    #[test]
    fn query_converts_pending_link_mtu() {
        let mut transport = TestTransport::new();
        let mut mtu = Mtu::new();
        mtu.set_link_mtu(1500);
        assert!(mtu.query(&mut transport, false));
        assert_eq!(mtu.mtu, 1500 - 28);
        assert_eq!(mtu.link_mtu, 0);
    }

    #[test]
    fn query_asks_transport_when_unset() {
        let mut transport = TestTransport::new();
        let mut mtu = Mtu::new();
        assert!(mtu.query(&mut transport, false));
        assert_eq!(mtu.mtu, 1400);
        assert_eq!(transport.pushed_mtu, None);
    }

    #[test]
    fn query_clamps_bogus_path_mtu() {
        let mut transport = TestTransport::new();
        transport.path_mtu = 100;
        let mut mtu = Mtu::new();
        assert!(mtu.query(&mut transport, false));
        assert_eq!(mtu.mtu, 256 - 28);
        assert_eq!(transport.pushed_mtu, Some(256 - 28));
    }

    #[test]
    fn query_refuses_when_forbidden_and_unset() {
        let mut transport = TestTransport::new();
        let mut mtu = Mtu::new();
        assert!(!mtu.query(&mut transport, true));
        // but an already-plausible value passes without touching the
        // transport
        mtu.mtu = 1400;
        assert!(mtu.query(&mut transport, true));
    }
}
