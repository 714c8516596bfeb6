//! Sliding-window replay protection for transport nonces.

/// Number of nonces tracked behind the highest one seen
pub const REPLAY_WINDOW: u64 = 64;

/// Sliding bitmap over the most recent nonces
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    // bit i set => nonce (highest - i) seen
    bitmap: u64,
}

impl ReplayWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `nonce` would be accepted
    pub fn check(&self, nonce: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if nonce > highest {
            return true;
        }
        let offset = highest - nonce;
        offset < REPLAY_WINDOW && self.bitmap & (1 << offset) == 0
    }

    /// Record `nonce` as seen. Call only after the ciphertext authenticated.
    pub fn accept(&mut self, nonce: u64) {
        match self.highest {
            None => {
                self.highest = Some(nonce);
                self.bitmap = 1;
            }
            Some(highest) if nonce > highest => {
                let shift = nonce - highest;
                self.bitmap = if shift >= REPLAY_WINDOW {
                    0
                } else {
                    self.bitmap << shift
                };
                self.bitmap |= 1;
                self.highest = Some(nonce);
            }
            Some(highest) => {
                let offset = highest - nonce;
                if offset < REPLAY_WINDOW {
                    self.bitmap |= 1 << offset;
                }
            }
        }
    }
}
